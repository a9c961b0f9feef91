//! User-Agent rotation

use crate::config::UpstreamConfig;
use rand::Rng;

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// Pool of client identities; never hands out the same one twice in a row
#[derive(Debug, Clone)]
pub struct IdentityPool {
    agents: Vec<String>,
    last: Option<usize>,
}

impl IdentityPool {
    /// Creates a pool; an empty list falls back to built-in desktop browsers
    pub fn new(agents: Vec<String>) -> Self {
        let agents = if agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            agents
        };
        Self { agents, last: None }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.user_agents.clone())
    }

    /// Picks the identity for the next request
    pub fn next_agent(&mut self) -> &str {
        let len = self.agents.len();
        let idx = match self.last {
            Some(last) if len > 1 => {
                // skip over the previous pick
                let offset = rand::thread_rng().gen_range(1..len);
                (last + offset) % len
            }
            _ => rand::thread_rng().gen_range(0..len),
        };
        self.last = Some(idx);
        &self.agents[idx]
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_uses_defaults() {
        let pool = IdentityPool::new(Vec::new());
        assert_eq!(pool.len(), DEFAULT_USER_AGENTS.len());
    }

    #[test]
    fn test_never_repeats_consecutively() {
        let mut pool = IdentityPool::new(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let mut previous = pool.next_agent().to_string();
        for _ in 0..50 {
            let current = pool.next_agent().to_string();
            assert_ne!(current, previous);
            previous = current;
        }
    }

    #[test]
    fn test_single_agent_pool() {
        let mut pool = IdentityPool::new(vec!["only".to_string()]);
        assert_eq!(pool.next_agent(), "only");
        assert_eq!(pool.next_agent(), "only");
    }
}

//! Human-like pacing between items
//!
//! Each worker waits a uniform random delay between items and takes a longer
//! pause every K items, with K redrawn after every pause.

use crate::config::StealthConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StealthPacer {
    min_delay: Duration,
    max_delay: Duration,
    burst_min: Duration,
    burst_max: Duration,
    every_min: u32,
    every_max: u32,
    since_burst: u32,
    next_burst: u32,
}

impl StealthPacer {
    pub fn from_config(config: &StealthConfig) -> Self {
        let (min_delay, max_delay) = config.delay_range();
        let every_min = config.burst_every_min.max(1);
        let every_max = config.burst_every_max.max(every_min);
        Self {
            min_delay,
            max_delay,
            burst_min: Duration::from_millis(config.burst_pause_min_ms),
            burst_max: Duration::from_millis(config.burst_pause_max_ms),
            every_min,
            every_max,
            since_burst: 0,
            next_burst: draw_count(every_min, every_max),
        }
    }

    /// Delay to wait before the next item
    pub fn next_delay(&mut self) -> Duration {
        self.since_burst += 1;
        if self.since_burst >= self.next_burst {
            self.since_burst = 0;
            self.next_burst = draw_count(self.every_min, self.every_max);
            return draw(self.burst_min, self.burst_max);
        }
        draw(self.min_delay, self.max_delay)
    }

    /// Sleeps for [`next_delay`](Self::next_delay)
    pub async fn pause(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }
}

fn draw(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

fn draw_count(min: u32, max: u32) -> u32 {
    rand::thread_rng().gen_range(min..=max)
}

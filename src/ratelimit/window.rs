use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Recent call timestamps for one operation class
///
/// Admission is bounded two ways: never more than `cap` calls inside the
/// window, and the observed rate `count / min(window, age_of_oldest)` may not
/// exceed `cap / window`, which spreads calls out instead of letting a full
/// window's quota go out in one burst.
#[derive(Debug)]
pub struct SlidingWindow {
    stamps: VecDeque<Instant>,
    cap: u32,
    window: Duration,
}

impl SlidingWindow {
    pub fn new(cap: u32, window: Duration) -> Self {
        Self {
            stamps: VecDeque::with_capacity(cap as usize),
            cap: cap.max(1),
            window,
        }
    }

    /// Drops timestamps that have left the window
    pub fn purge(&mut self, now: Instant) {
        while let Some(oldest) = self.stamps.front() {
            if now.duration_since(*oldest) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time to wait before another call is admitted, or `None` if it may go now
    pub fn wait_needed(&mut self, now: Instant) -> Option<Duration> {
        self.purge(now);

        let oldest = *self.stamps.front()?;
        let count = self.stamps.len() as f64;
        let age = now.duration_since(oldest);

        if self.stamps.len() as u32 >= self.cap {
            // hard cap: wait for the oldest call to leave the window
            return Some(self.window.saturating_sub(age));
        }

        let cap_rate = self.cap as f64 / self.window.as_secs_f64();
        let span = age.min(self.window).as_secs_f64();
        let observed_rate = if span > 0.0 { count / span } else { f64::INFINITY };

        if observed_rate > cap_rate {
            let wait = count / cap_rate - age.as_secs_f64();
            return Some(Duration::from_secs_f64(wait.max(0.0)));
        }

        None
    }

    pub fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
    }

    /// Calls currently inside the window
    pub fn count(&mut self, now: Instant) -> usize {
        self.purge(now);
        self.stamps.len()
    }
}

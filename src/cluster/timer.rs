use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::protocol::event::now_seconds;

/// Smallest step used to keep timestamps strictly increasing.
const TIMESTAMP_STEP: f64 = 1e-6;

/// Draws this node's election delay, uniform in `[min_ms, max_ms)`.
pub fn random_election_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..max_ms))
}

/// Delay for a node that found an existing master: uniform in
/// `[master_delay, master_delay + 1s)`, so the master keeps priority.
pub fn delay_after(master_delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    master_delay + Duration::from_millis(rng.gen_range(0..1000))
}

/// Source of event timestamps that never repeats or goes backwards.
#[derive(Debug)]
pub struct EventClock {
    last: AtomicU64,
}

impl EventClock {
    /// Start a clock whose first timestamp is later than `last`.
    pub fn starting_after(last: f64) -> Self {
        Self {
            last: AtomicU64::new(last.to_bits()),
        }
    }

    pub fn next(&self) -> f64 {
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let last = f64::from_bits(prev);
            let now = now_seconds();
            let ts = if now > last { now } else { last + TIMESTAMP_STEP };
            match self
                .last
                .compare_exchange_weak(prev, ts.to_bits(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return ts,
                Err(actual) => prev = actual,
            }
        }
    }
}

impl Default for EventClock {
    fn default() -> Self {
        Self::starting_after(0.0)
    }
}

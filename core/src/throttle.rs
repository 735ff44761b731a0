use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::state::SharedState;

#[derive(Debug)]
struct Budget {
    start: Instant,
    bytes: u64,
}

/// Session-wide byte-rate cap shared by every worker.
#[derive(Debug)]
pub struct Throttle {
    limit_bytes_per_sec: Option<u64>,
    budget: Mutex<Budget>,
}

impl Throttle {
    pub fn new(limit_bytes_per_sec: Option<u64>) -> Self {
        Self {
            limit_bytes_per_sec: limit_bytes_per_sec.filter(|limit| *limit > 0),
            budget: Mutex::new(Budget {
                start: Instant::now(),
                bytes: 0,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// How long the caller should pause after moving `bytes` more bytes.
    pub fn reserve(&self, bytes: u64) -> Duration {
        let Some(limit) = self.limit_bytes_per_sec else {
            return Duration::ZERO;
        };
        let Ok(mut budget) = self.budget.lock() else {
            return Duration::ZERO;
        };
        budget.bytes = budget.bytes.saturating_add(bytes);
        let expected = budget.bytes as f64 / limit as f64;
        let elapsed = budget.start.elapsed().as_secs_f64();
        if expected > elapsed {
            Duration::from_secs_f64(expected - elapsed)
        } else {
            Duration::ZERO
        }
    }

    /// Reserves `bytes` and sleeps off the debt in `slice` steps, giving up
    /// early once the session stops.
    pub fn throttle(&self, bytes: u64, state: &SharedState, slice: Duration) {
        let mut remaining = self.reserve(bytes);
        while !remaining.is_zero() && !state.is_stopped() {
            let step = remaining.min(slice);
            thread::sleep(step);
            remaining -= step;
        }
    }
}

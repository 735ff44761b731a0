use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::EngineConfig;
use crate::progress::ProgressEvent;
use crate::state::SharedState;

const BACKOFF_EXPONENT: f64 = 4.0 / 3.0;
// Deadline used when `now + delay` does not fit in an `Instant`.
const MAX_RETRY_WAIT: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    slice: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, slice: Duration) -> Self {
        Self {
            base_delay_ms,
            slice: slice.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.base_delay_ms, config.retry_slice())
    }

    pub fn slice(&self) -> Duration {
        self.slice
    }

    /// `base * attempt^(4/3)`; zero for the first attempt.
    pub fn wait_time(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = (attempt as f64).powf(BACKOFF_EXPONENT);
        let micros = (self.base_delay_ms as f64 * 1000.0 * factor).round();
        Duration::from_micros(micros as u64)
    }

    /// Sleeps out the backoff for `attempt` in slices, returning `false` as
    /// soon as the session is stopped.
    pub fn wait(&self, attempt: u32, worker: usize, segment: usize, state: &SharedState) -> bool {
        let delay = self.wait_time(attempt);
        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .or_else(|| now.checked_add(MAX_RETRY_WAIT))
            .unwrap_or(now);
        debug!(worker, segment, attempt, delay_ms = delay.as_millis() as u64, "waiting before retry");
        state.record_retry();
        state.emit(ProgressEvent::RetryScheduled {
            worker,
            segment,
            attempt,
            delay,
        });

        let board = state.retry_board();
        board.enter(worker, segment, deadline);
        let completed = loop {
            if state.is_stopped() {
                break false;
            }
            let now = Instant::now();
            if now >= deadline {
                break true;
            }
            if let Some(line) = board.soonest(now) {
                if line.worker == worker {
                    state.emit(ProgressEvent::Retrying {
                        worker,
                        segment: line.segment,
                        remaining: line.remaining,
                        waiting: line.waiting,
                    });
                }
            }
            thread::sleep(self.slice.min(deadline - now));
        };
        if board.leave(worker) {
            state.emit(ProgressEvent::RetryCleared);
        }
        completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryLine {
    pub worker: usize,
    pub segment: usize,
    pub remaining: Duration,
    pub waiting: usize,
}

/// Per-session table of workers currently sitting out a backoff.
#[derive(Debug, Default)]
pub struct RetryBoard {
    deadlines: Mutex<HashMap<usize, (usize, Instant)>>,
}

impl RetryBoard {
    pub fn enter(&self, worker: usize, segment: usize, deadline: Instant) {
        if let Ok(mut deadlines) = self.deadlines.lock() {
            deadlines.insert(worker, (segment, deadline));
        }
    }

    /// Returns `true` when the last waiting worker has left.
    pub fn leave(&self, worker: usize) -> bool {
        match self.deadlines.lock() {
            Ok(mut deadlines) => {
                deadlines.remove(&worker);
                deadlines.is_empty()
            }
            Err(_) => false,
        }
    }

    pub fn waiting(&self) -> usize {
        self.deadlines.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn soonest(&self, now: Instant) -> Option<RetryLine> {
        let deadlines = self.deadlines.lock().ok()?;
        let waiting = deadlines.len();
        deadlines
            .iter()
            .min_by_key(|(worker, (_, deadline))| (*deadline, **worker))
            .map(|(worker, (segment, deadline))| RetryLine {
                worker: *worker,
                segment: *segment,
                remaining: deadline.saturating_duration_since(now),
                waiting,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::silent;
    use crate::segment::Segment;
    use std::sync::Arc;

    #[test]
    fn first_retry_waits_base_delay() {
        let policy = RetryPolicy::new(250, Duration::from_millis(50));
        assert_eq!(policy.wait_time(0), Duration::ZERO);
        assert_eq!(policy.wait_time(1), Duration::from_millis(250));
    }

    #[test]
    fn wait_time_strictly_increasing() {
        let policy = RetryPolicy::new(100, Duration::from_millis(50));
        let mut previous = policy.wait_time(1);
        for attempt in 2..64 {
            let next = policy.wait_time(attempt);
            assert!(next > previous, "attempt {} did not grow", attempt);
            previous = next;
        }
        // 8^(4/3) == 16
        assert_eq!(policy.wait_time(8), Duration::from_millis(1600));
    }

    #[test]
    fn board_reports_soonest_worker() {
        let board = RetryBoard::default();
        let now = Instant::now();
        board.enter(0, 4, now + Duration::from_secs(5));
        board.enter(1, 7, now + Duration::from_secs(2));
        let line = board.soonest(now).unwrap();
        assert_eq!(line.worker, 1);
        assert_eq!(line.segment, 7);
        assert_eq!(line.waiting, 2);
        assert_eq!(board.waiting(), 2);
        assert_eq!(line.remaining, Duration::from_secs(2));

        assert!(!board.leave(1));
        assert_eq!(board.soonest(now).unwrap().worker, 0);
        assert!(board.leave(0));
        assert!(board.soonest(now).is_none());
        assert_eq!(board.waiting(), 0);
    }

    #[test]
    fn huge_delay_still_interruptible() {
        let policy = RetryPolicy::new(u64::MAX, Duration::from_millis(5));
        let state = Arc::new(SharedState::new(
            &[Segment::new(0, "mem://a", Some(1))],
            1,
            silent(),
        ));
        let canceler = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                state.cancel();
            })
        };
        let started = Instant::now();
        assert!(!policy.wait(1, 0, 0, &state));
        canceler.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(state.retries(), 1);
        assert_eq!(state.retry_board().waiting(), 0);
    }
}

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CoreError;
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::retry::RetryBoard;
use crate::segment::Segment;

const STOP_NONE: u8 = 0;
const STOP_CANCELED: u8 = 1;
const STOP_FAILED: u8 = 2;

const UNKNOWN_TOTAL: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Canceled,
    Failed,
}

/// Flags, counters and the first fatal error of one download session,
/// shared by every worker and the merger.
pub struct SharedState {
    running: AtomicBool,
    paused: AtomicBool,
    stop: AtomicU8,
    done: AtomicBool,
    error_flag: AtomicBool,
    retry_suppressed: AtomicBool,
    total_size: AtomicU64,
    known_size: AtomicU64,
    unknown_segments: AtomicUsize,
    downloaded: AtomicU64,
    last_flush: AtomicU64,
    flush_bytes: u64,
    segment_bytes: Vec<AtomicU64>,
    first_error: Mutex<Option<CoreError>>,
    retries: AtomicU64,
    compactions: AtomicU64,
    retry_board: RetryBoard,
    progress: ProgressCallback,
}

impl SharedState {
    pub fn new(segments: &[Segment], flush_bytes: u64, progress: ProgressCallback) -> Self {
        let mut known = 0u64;
        let mut unknown = 0usize;
        for segment in segments {
            match segment.expected_size() {
                Some(size) => known = known.saturating_add(size),
                None => unknown += 1,
            }
        }
        Self {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stop: AtomicU8::new(STOP_NONE),
            done: AtomicBool::new(false),
            error_flag: AtomicBool::new(false),
            retry_suppressed: AtomicBool::new(true),
            total_size: AtomicU64::new(if unknown == 0 { known } else { UNKNOWN_TOTAL }),
            known_size: AtomicU64::new(known),
            unknown_segments: AtomicUsize::new(unknown),
            downloaded: AtomicU64::new(0),
            last_flush: AtomicU64::new(0),
            flush_bytes: flush_bytes.max(1),
            segment_bytes: segments.iter().map(|_| AtomicU64::new(0)).collect(),
            first_error: Mutex::new(None),
            retries: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            retry_board: RetryBoard::default(),
            progress,
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.is_stopped()
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Blocks while paused. Returns `false` if the session stopped meanwhile.
    pub fn hold_while_paused(&self, slice: Duration) -> bool {
        while self.is_paused() {
            if self.is_stopped() {
                return false;
            }
            thread::sleep(slice);
        }
        !self.is_stopped()
    }

    pub fn cancel(&self) {
        if self
            .stop
            .compare_exchange(STOP_NONE, STOP_CANCELED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("session canceled");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst) != STOP_NONE
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.stop.load(Ordering::SeqCst) {
            STOP_CANCELED => Some(StopReason::Canceled),
            STOP_FAILED => Some(StopReason::Failed),
            _ => None,
        }
    }

    /// Records `err` as the session's fatal error unless one is already
    /// recorded, and stops the session.
    pub fn fail(&self, err: CoreError) {
        if let Ok(mut slot) = self.first_error.lock() {
            if slot.is_none() {
                warn!(error = %err, "session failed");
                *slot = Some(err);
            }
        }
        self.error_flag.store(true, Ordering::SeqCst);
        let _ = self
            .stop
            .compare_exchange(STOP_NONE, STOP_FAILED, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }

    pub fn first_error(&self) -> Option<CoreError> {
        self.first_error.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn set_retry_suppressed(&self, suppressed: bool) {
        self.retry_suppressed.store(suppressed, Ordering::SeqCst);
    }

    /// A failure that will be retried. It only reaches the error flag when
    /// suppression is turned off.
    pub fn report_transient(&self, index: usize, attempt: u32, err: &CoreError) {
        if self.retry_suppressed.load(Ordering::SeqCst) {
            debug!(segment = index, attempt, error = %err, "transient segment failure");
        } else {
            self.fail(err.clone());
        }
    }

    pub fn total_size(&self) -> Option<u64> {
        match self.total_size.load(Ordering::Acquire) {
            UNKNOWN_TOTAL => None,
            size => Some(size),
        }
    }

    /// Folds a newly learned segment size into the total. `previous` is the
    /// size recorded before, if any.
    pub fn resolve_size(&self, previous: Option<u64>, size: u64) {
        match previous {
            Some(old) if old == size => return,
            Some(old) => {
                if size > old {
                    self.known_size.fetch_add(size - old, Ordering::AcqRel);
                } else {
                    self.known_size.fetch_sub(old - size, Ordering::AcqRel);
                }
            }
            None => {
                self.known_size.fetch_add(size, Ordering::AcqRel);
                self.unknown_segments.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if self.unknown_segments.load(Ordering::Acquire) == 0 {
            self.total_size
                .store(self.known_size.load(Ordering::Acquire), Ordering::Release);
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// Forgets whatever an earlier attempt at `index` counted.
    pub fn restart_segment(&self, index: usize) {
        if let Some(counter) = self.segment_bytes.get(index) {
            let stale = counter.swap(0, Ordering::AcqRel);
            if stale > 0 {
                self.downloaded.fetch_sub(stale, Ordering::AcqRel);
            }
        }
    }

    pub fn add_bytes(&self, index: usize, bytes: u64) {
        if let Some(counter) = self.segment_bytes.get(index) {
            counter.fetch_add(bytes, Ordering::AcqRel);
        }
        let total = self.downloaded.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let last = self.last_flush.load(Ordering::Relaxed);
        if total.saturating_sub(last) >= self.flush_bytes
            && self
                .last_flush
                .compare_exchange(last, total, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
        {
            self.emit_progress();
        }
    }

    pub fn segment_bytes(&self, index: usize) -> u64 {
        self.segment_bytes
            .get(index)
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn emit_progress(&self) {
        self.emit(ProgressEvent::Progress {
            downloaded: self.downloaded(),
            total: self.total_size(),
        });
    }

    pub fn emit(&self, event: ProgressEvent) {
        (self.progress)(&event);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::AcqRel);
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Acquire)
    }

    pub fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Acquire)
    }

    pub fn retry_board(&self) -> &RetryBoard {
        &self.retry_board
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::silent;

    fn segments(sizes: &[Option<u64>]) -> Vec<Segment> {
        sizes
            .iter()
            .enumerate()
            .map(|(index, size)| Segment::new(index, "mem://x", *size))
            .collect()
    }

    #[test]
    fn total_known_only_when_every_size_known() {
        let segs = segments(&[Some(10), None, None]);
        let state = SharedState::new(&segs, 1, silent());
        assert_eq!(state.total_size(), None);
        state.resolve_size(None, 5);
        assert_eq!(state.total_size(), None);
        state.resolve_size(None, 7);
        assert_eq!(state.total_size(), Some(22));
        state.resolve_size(Some(10), 12);
        assert_eq!(state.total_size(), Some(24));
    }

    #[test]
    fn restart_discards_partial_attempt() {
        let segs = segments(&[Some(10), Some(10)]);
        let state = SharedState::new(&segs, 1, silent());
        state.add_bytes(0, 6);
        state.add_bytes(1, 4);
        assert_eq!(state.downloaded(), 10);
        state.restart_segment(0);
        assert_eq!(state.downloaded(), 4);
        assert_eq!(state.segment_bytes(0), 0);
        assert_eq!(state.segment_bytes(1), 4);
    }

    #[test]
    fn first_error_wins() {
        let state = SharedState::new(&segments(&[Some(1)]), 1, silent());
        state.fail(CoreError::Merge("first".to_string()));
        state.fail(CoreError::Merge("second".to_string()));
        assert!(state.has_error());
        assert_eq!(state.stop_reason(), Some(StopReason::Failed));
        match state.first_error() {
            Some(CoreError::Merge(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn suppressed_transient_errors_do_not_stop() {
        let state = SharedState::new(&segments(&[Some(1)]), 1, silent());
        let err = CoreError::Network("reset".to_string());
        state.report_transient(0, 1, &err);
        assert!(!state.has_error());
        state.set_retry_suppressed(false);
        state.report_transient(0, 1, &err);
        assert!(state.has_error());
    }

    #[test]
    fn cancel_after_failure_keeps_failure() {
        let state = SharedState::new(&segments(&[Some(1)]), 1, silent());
        state.fail(CoreError::Canceled);
        state.cancel();
        assert_eq!(state.stop_reason(), Some(StopReason::Failed));
    }
}

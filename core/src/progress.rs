use std::sync::Arc;
use std::time::Duration;

/// Everything a front end needs to drive a progress bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        segments: usize,
        workers: usize,
        total: Option<u64>,
    },
    Progress {
        downloaded: u64,
        total: Option<u64>,
    },
    RetryScheduled {
        worker: usize,
        segment: usize,
        attempt: u32,
        delay: Duration,
    },
    /// Shared retry line: the worker closest to its next attempt.
    Retrying {
        worker: usize,
        segment: usize,
        remaining: Duration,
        waiting: usize,
    },
    RetryCleared,
    SegmentMerged {
        index: usize,
        merged: usize,
        total: usize,
    },
    Compacted {
        worker: usize,
        epoch: u64,
        reclaimed: u64,
    },
    Finished {
        bytes: u64,
    },
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

pub fn silent() -> ProgressCallback {
    Arc::new(|_| {})
}

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{CoreError, CoreResult};
use crate::progress::ProgressEvent;
use crate::queue::{MergeRequest, PendingMerges};
use crate::state::SharedState;
use crate::worker::WorkerHandle;

struct MergeState {
    pending: PendingMerges,
    last_merged: Option<usize>,
    merged_bytes: u64,
    terminate: bool,
    stop: bool,
    finished: bool,
    error: Option<CoreError>,
}

impl MergeState {
    fn next_index(&self) -> usize {
        self.last_merged.map_or(0, |index| index + 1)
    }
}

/// The merger's inbox.
pub struct MergeQueue {
    total: usize,
    state: Mutex<MergeState>,
    arrived: Condvar,
    processed: Condvar,
}

impl MergeQueue {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            state: Mutex::new(MergeState {
                pending: PendingMerges::default(),
                last_merged: None,
                merged_bytes: 0,
                terminate: false,
                stop: false,
                finished: false,
                error: None,
            }),
            arrived: Condvar::new(),
            processed: Condvar::new(),
        }
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, MergeState>> {
        self.state.lock().map_err(|_| CoreError::poisoned("merge queue"))
    }

    pub fn submit(&self, request: MergeRequest) -> CoreResult<()> {
        if request.segment_index >= self.total {
            return Err(CoreError::InvalidState(format!(
                "merge request for segment {} of {}",
                request.segment_index, self.total
            )));
        }
        let mut state = self.lock()?;
        trace!(segment = request.segment_index, worker = request.worker_id, "merge request queued");
        state.pending.push(request);
        self.arrived.notify_all();
        Ok(())
    }

    /// Stop waiting for new requests once everything has been merged.
    pub fn terminate(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.terminate = true;
        }
        self.arrived.notify_all();
    }

    /// Abort right away, merged or not.
    pub fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.stop = true;
        }
        self.arrived.notify_all();
        self.processed.notify_all();
    }

    pub fn last_merged(&self) -> Option<usize> {
        self.state.lock().ok().and_then(|state| state.last_merged)
    }

    pub fn merged_bytes(&self) -> u64 {
        self.state.lock().map(|state| state.merged_bytes).unwrap_or(0)
    }

    pub fn wait(&self, shared: &SharedState, slice: Duration) -> CoreResult<()> {
        let mut state = self.lock()?;
        loop {
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            if state.finished {
                return Ok(());
            }
            if state.stop || shared.is_stopped() {
                return Err(CoreError::Canceled);
            }
            state = self
                .processed
                .wait_timeout(state, slice)
                .map_err(|_| CoreError::poisoned("merge queue"))?
                .0;
        }
    }

    /// Next request in index order, or `None` once all are merged.
    fn next_request(&self, shared: &SharedState, slice: Duration) -> CoreResult<Option<MergeRequest>> {
        let mut state = self.lock()?;
        loop {
            if state.stop || shared.is_stopped() {
                return Err(CoreError::Canceled);
            }
            let next = state.next_index();
            if next >= self.total {
                return Ok(None);
            }
            if let Some(request) = state.pending.pop_if_next(next) {
                return Ok(Some(request));
            }
            if state.terminate {
                // Every worker has finished, so nothing else is coming.
                return Err(CoreError::Merge(format!(
                    "segment {} was never delivered ({} requests stranded)",
                    next,
                    state.pending.len()
                )));
            }
            state = self
                .arrived
                .wait_timeout(state, slice)
                .map_err(|_| CoreError::poisoned("merge queue"))?
                .0;
        }
    }

    fn mark_merged(&self, request: &MergeRequest) -> CoreResult<usize> {
        let mut state = self.lock()?;
        state.last_merged = Some(request.segment_index);
        state.merged_bytes += request.byte_count;
        self.processed.notify_all();
        Ok(request.segment_index + 1)
    }

    fn finish(&self, result: &CoreResult<()>) {
        if let Ok(mut state) = self.state.lock() {
            match result {
                Ok(()) => state.finished = true,
                Err(CoreError::Canceled) => state.stop = true,
                Err(err) => {
                    if state.error.is_none() {
                        state.error = Some(err.clone());
                    }
                }
            }
        }
        self.processed.notify_all();
    }
}

/// Single consumer that appends segments to the output strictly in index
/// order, reading each one out of the worker temp file that holds it.
pub struct Merger {
    queue: Arc<MergeQueue>,
    workers: Vec<WorkerHandle>,
    output: BufWriter<File>,
    state: Arc<SharedState>,
    buffer: Vec<u8>,
    slice: Duration,
}

impl Merger {
    pub fn new(
        queue: Arc<MergeQueue>,
        workers: Vec<WorkerHandle>,
        output: File,
        state: Arc<SharedState>,
        buffer_size: usize,
        slice: Duration,
    ) -> Self {
        let buffer_size = buffer_size.max(1024);
        Self {
            queue,
            workers,
            output: BufWriter::with_capacity(buffer_size, output),
            state,
            buffer: vec![0u8; buffer_size],
            slice,
        }
    }

    pub fn spawn(self) -> CoreResult<JoinHandle<()>> {
        thread::Builder::new()
            .name("segflow-merger".to_string())
            .spawn(move || {
                let mut merger = self;
                let result = merger.run();
                // Record the error on the queue first so a waiter sees it
                // rather than a bare stop.
                merger.queue.finish(&result);
                if let Err(err) = result {
                    if !matches!(err, CoreError::Canceled) {
                        merger.state.fail(err);
                    }
                }
            })
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    pub fn run(&mut self) -> CoreResult<()> {
        let total = self.queue.total;
        while let Some(request) = self.queue.next_request(&self.state, self.slice)? {
            self.transfer(&request)?;
            let merged = self.queue.mark_merged(&request)?;
            self.state.emit(ProgressEvent::SegmentMerged {
                index: request.segment_index,
                merged,
                total,
            });
        }
        self.output
            .flush()
            .map_err(|err| CoreError::Merge(format!("flushing output: {}", err)))?;
        self.output
            .get_ref()
            .sync_all()
            .map_err(|err| CoreError::Merge(format!("syncing output: {}", err)))?;
        debug!(segments = total, bytes = self.queue.merged_bytes(), "merge complete");
        Ok(())
    }

    fn transfer(&mut self, request: &MergeRequest) -> CoreResult<()> {
        let handle = self.workers.get(request.worker_id).ok_or_else(|| {
            CoreError::Merge(format!("unknown worker {}", request.worker_id))
        })?;
        let mut slot = handle.lock()?;
        let physical = slot.translate(request.epoch, request.logical_offset).map_err(|err| {
            CoreError::Merge(format!("segment {}: {}", request.segment_index, err))
        })?;
        trace!(
            segment = request.segment_index,
            worker = handle.id(),
            epoch = request.epoch,
            logical = request.logical_offset,
            physical,
            bytes = request.byte_count,
            "merging segment"
        );
        slot.read_at(physical, request.byte_count, &mut self.output, &mut self.buffer)
            .map_err(|err| CoreError::Merge(format!("segment {}: {}", request.segment_index, err)))?;
        slot.acknowledge(physical + request.byte_count, request.epoch);
        Ok(())
    }
}

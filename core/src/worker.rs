use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::barrier::BarrierTicket;
use crate::compact::{Compactor, EpochTable};
use crate::error::{CoreError, CoreResult};
use crate::fetcher::SegmentFetcher;
use crate::merge::MergeQueue;
use crate::progress::ProgressEvent;
use crate::queue::{MergeRequest, WorkQueue};
use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Downloading,
    Compacting,
    Done,
    Failed,
}

/// Lock-guarded bookkeeping for one worker's temp file. The worker touches it
/// around downloads and compactions; the merger touches it while copying.
#[derive(Debug)]
pub struct WorkerSlot {
    reader: File,
    written: u64,
    merged: u64,
    epochs: EpochTable,
}

impl WorkerSlot {
    pub fn new(reader: File) -> Self {
        Self {
            reader,
            written: 0,
            merged: 0,
            epochs: EpochTable::default(),
        }
    }

    /// End of valid data in the file as it is now.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Length of the prefix the merger has already copied out.
    pub fn merged(&self) -> u64 {
        self.merged
    }

    pub fn epoch(&self) -> u64 {
        self.epochs.current_epoch()
    }

    pub fn translate(&self, epoch: u64, logical: u64) -> CoreResult<u64> {
        self.epochs.translate(epoch, logical)
    }

    pub(crate) fn advance_written(&mut self, bytes: u64) {
        self.written += bytes;
    }

    pub(crate) fn record_compaction(&mut self, removed: u64) -> u64 {
        self.written -= removed;
        self.merged -= removed;
        self.epochs.advance(removed)
    }

    /// Copies `len` bytes at physical `offset` into `out`.
    pub fn read_at<W: Write>(
        &mut self,
        offset: u64,
        len: u64,
        out: &mut W,
        buffer: &mut [u8],
    ) -> CoreResult<()> {
        if offset + len > self.written {
            return Err(CoreError::InvalidState(format!(
                "read of {}..{} past valid data end {}",
                offset,
                offset + len,
                self.written
            )));
        }
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut left = len;
        while left > 0 {
            let chunk = left.min(buffer.len() as u64) as usize;
            self.reader.read_exact(&mut buffer[..chunk])?;
            out.write_all(&buffer[..chunk])?;
            left -= chunk as u64;
        }
        Ok(())
    }

    /// Marks everything up to physical `end` as merged; epochs before
    /// `epoch` will not be asked for again.
    pub fn acknowledge(&mut self, end: u64, epoch: u64) {
        self.merged = self.merged.max(end);
        self.epochs.discard_before(epoch);
    }
}

/// The merger's read capability into one worker: its id and lock, never the
/// worker itself.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: usize,
    slot: Arc<Mutex<WorkerSlot>>,
}

impl WorkerHandle {
    pub fn new(id: usize, reader: File) -> Self {
        Self {
            id,
            slot: Arc::new(Mutex::new(WorkerSlot::new(reader))),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn lock(&self) -> CoreResult<MutexGuard<'_, WorkerSlot>> {
        self.slot
            .lock()
            .map_err(|_| CoreError::poisoned("worker slot"))
    }
}

pub struct Worker {
    id: usize,
    file: File,
    handle: WorkerHandle,
    queue: Arc<WorkQueue>,
    fetcher: SegmentFetcher,
    merger: Arc<MergeQueue>,
    state: Arc<SharedState>,
    compactor: Compactor,
    slice: Duration,
    phase: WorkerPhase,
}

impl Worker {
    /// Opens `path` twice: a read-write handle the worker keeps and a read
    /// handle behind the lock for the merger.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: usize,
        path: &Path,
        queue: Arc<WorkQueue>,
        fetcher: SegmentFetcher,
        merger: Arc<MergeQueue>,
        state: Arc<SharedState>,
        compactor: Compactor,
        slice: Duration,
    ) -> CoreResult<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let reader = File::open(path)?;
        Ok(Self {
            id,
            file,
            handle: WorkerHandle::new(id, reader),
            queue,
            fetcher,
            merger,
            state,
            compactor,
            slice,
            phase: WorkerPhase::Idle,
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn spawn(self, ticket: BarrierTicket) -> CoreResult<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("segflow-worker-{}", self.id))
            .spawn(move || {
                let mut worker = self;
                match worker.run_to_end() {
                    Ok(()) => ticket.arrive(None),
                    Err(err) => {
                        worker.state.fail(err.clone());
                        ticket.arrive(Some(err));
                    }
                }
            })
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    /// Runs the loop and records whether the worker ended cleanly.
    pub fn run_to_end(&mut self) -> CoreResult<()> {
        let result = self.run();
        self.set_phase(match result {
            Ok(()) => WorkerPhase::Done,
            Err(_) => WorkerPhase::Failed,
        });
        result
    }

    fn set_phase(&mut self, phase: WorkerPhase) {
        if self.phase != phase {
            trace!(worker = self.id, from = ?self.phase, to = ?phase, "worker phase");
            self.phase = phase;
        }
    }

    pub fn run(&mut self) -> CoreResult<()> {
        let queue = Arc::clone(&self.queue);
        loop {
            if !self.state.is_running() || !self.state.hold_while_paused(self.slice) {
                debug!(worker = self.id, "worker stopping");
                return Ok(());
            }
            self.maybe_compact()?;
            let Some(segment) = queue.claim() else {
                debug!(worker = self.id, "no segments left");
                return Ok(());
            };
            self.set_phase(WorkerPhase::Downloading);
            let (offset, epoch) = {
                let slot = self.handle.lock()?;
                (slot.written(), slot.epoch())
            };
            trace!(worker = self.id, segment = segment.index, offset, epoch, "segment claimed");
            let bytes = match self.fetcher.fetch(self.id, segment, &mut self.file, offset) {
                Ok(bytes) => bytes,
                Err(CoreError::Canceled) => return Ok(()),
                Err(err) => {
                    warn!(worker = self.id, segment = segment.index, error = %err, "segment failed");
                    return Err(err);
                }
            };
            self.handle.lock()?.advance_written(bytes);
            self.merger.submit(MergeRequest {
                worker_id: self.id,
                segment_index: segment.index,
                logical_offset: offset,
                byte_count: bytes,
                epoch,
            })?;
            self.set_phase(WorkerPhase::Idle);
        }
    }

    fn maybe_compact(&mut self) -> CoreResult<()> {
        let handle = self.handle.clone();
        let mut slot = handle.lock()?;
        if !self.compactor.should_compact(&slot) {
            return Ok(());
        }
        self.set_phase(WorkerPhase::Compacting);
        let reclaimed = self.compactor.compact(&mut self.file, &mut slot)?;
        let epoch = slot.epoch();
        drop(slot);
        self.state.record_compaction();
        self.state.emit(ProgressEvent::Compacted {
            worker: self.id,
            epoch,
            reclaimed,
        });
        self.set_phase(WorkerPhase::Idle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::merge::Merger;
    use crate::net::{FetchRequest, FetchResponse, SegmentTransport};
    use crate::progress::silent;
    use crate::segment::Segment;
    use crate::throttle::Throttle;
    use std::io::Cursor;

    struct Bodies(Vec<(String, Vec<u8>)>);

    impl SegmentTransport for Bodies {
        fn get(&self, req: &FetchRequest) -> CoreResult<FetchResponse> {
            let body = self
                .0
                .iter()
                .find(|(uri, _)| *uri == req.url)
                .map(|(_, body)| body.clone())
                .ok_or_else(|| CoreError::InvalidInput(format!("no route to {}", req.url)))?;
            Ok(FetchResponse {
                status: 200,
                content_length: Some(body.len() as u64),
                body: Box::new(Cursor::new(body)),
            })
        }
    }

    fn worker_for(
        dir: &Path,
        segments: Vec<Segment>,
        transport: Bodies,
    ) -> (Worker, Arc<MergeQueue>, Arc<SharedState>) {
        let segments: Arc<[Segment]> = segments.into();
        let state = Arc::new(SharedState::new(&segments, 1, silent()));
        state.set_running(true);
        let config = EngineConfig {
            base_delay_ms: 1,
            retry_slice_ms: 1,
            ..EngineConfig::default()
        };
        let fetcher = SegmentFetcher::new(
            &config,
            Arc::new(transport),
            Arc::clone(&state),
            Arc::new(Throttle::unlimited()),
        );
        let merge_queue = Arc::new(MergeQueue::new(segments.len()));
        let worker = Worker::open(
            0,
            &dir.join("part0"),
            Arc::new(WorkQueue::new(segments)),
            fetcher,
            Arc::clone(&merge_queue),
            Arc::clone(&state),
            Compactor::new(1, 1024),
            Duration::from_millis(1),
        )
        .unwrap();
        (worker, merge_queue, state)
    }

    #[test]
    fn worker_drains_queue_and_ends_done() {
        let dir = tempfile::tempdir().unwrap();
        let segments = vec![
            Segment::new(0, "mem://0", Some(3)),
            Segment::new(1, "mem://1", Some(2)),
        ];
        let transport = Bodies(vec![
            ("mem://0".to_string(), b"abc".to_vec()),
            ("mem://1".to_string(), b"de".to_vec()),
        ]);
        let (mut worker, merge_queue, state) = worker_for(dir.path(), segments, transport);
        let handles = vec![worker.handle()];
        assert_eq!(worker.phase(), WorkerPhase::Idle);

        worker.run_to_end().unwrap();
        assert_eq!(worker.phase(), WorkerPhase::Done);
        assert_eq!(handles[0].lock().unwrap().written(), 5);

        // Both merge requests were queued; a merger can now drain them.
        merge_queue.terminate();
        let out_path = dir.path().join("out");
        let mut merger = Merger::new(
            Arc::clone(&merge_queue),
            handles,
            File::create(&out_path).unwrap(),
            state,
            1024,
            Duration::from_millis(1),
        );
        merger.run().unwrap();
        assert_eq!(std::fs::read(&out_path).unwrap(), b"abcde");
    }

    #[test]
    fn fatal_segment_error_ends_failed() {
        let dir = tempfile::tempdir().unwrap();
        let segments = vec![Segment::new(0, "mem://missing", Some(1))];
        let (mut worker, _merge_queue, _state) =
            worker_for(dir.path(), segments, Bodies(Vec::new()));
        assert!(matches!(
            worker.run_to_end(),
            Err(CoreError::InvalidInput(_))
        ));
        assert_eq!(worker.phase(), WorkerPhase::Failed);
    }

    #[test]
    fn slot_tracks_merge_and_compaction() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"aaaabbbbcc").unwrap();
        let reader = file.try_clone().unwrap();
        let handle = WorkerHandle::new(0, reader);
        let mut compactor = Compactor::new(5, 1024);

        {
            let mut slot = handle.lock().unwrap();
            slot.advance_written(10);
            let mut out = Vec::new();
            let mut buffer = vec![0u8; 3];
            slot.read_at(0, 4, &mut out, &mut buffer).unwrap();
            slot.read_at(4, 4, &mut out, &mut buffer).unwrap();
            assert_eq!(out, b"aaaabbbb");
            slot.acknowledge(8, 0);
            assert!(compactor.should_compact(&slot));
            assert_eq!(compactor.compact(&mut file, &mut slot).unwrap(), 8);
            assert_eq!(slot.written(), 2);
            assert_eq!(slot.merged(), 0);
            assert_eq!(slot.epoch(), 1);
        }

        // A request recorded at offset 8 during epoch 0 now lives at 0.
        let mut slot = handle.lock().unwrap();
        let physical = slot.translate(0, 8).unwrap();
        assert_eq!(physical, 0);
        let mut out = Vec::new();
        let mut buffer = vec![0u8; 16];
        slot.read_at(physical, 2, &mut out, &mut buffer).unwrap();
        assert_eq!(out, b"cc");
        assert!(slot.read_at(1, 2, &mut out, &mut buffer).is_err());
    }
}

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::barrier::Barrier;
use crate::checksum::{verify_checksum, ChecksumRequest};
use crate::compact::Compactor;
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::fetcher::SegmentFetcher;
use crate::merge::{MergeQueue, Merger};
use crate::net::{ReqwestTransport, SegmentTransport};
use crate::progress::{silent, ProgressCallback, ProgressEvent};
use crate::queue::WorkQueue;
use crate::segment::{average_size, build_segments, Segment, SegmentSpec, SegmentStatus};
use crate::state::{SharedState, StopReason};
use crate::throttle::Throttle;
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub segments: Vec<SegmentSpec>,
    pub dest: PathBuf,
    pub checksum: Option<ChecksumRequest>,
}

impl DownloadJob {
    pub fn new(segments: Vec<SegmentSpec>, dest: impl Into<PathBuf>) -> Self {
        Self {
            segments,
            dest: dest.into(),
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: ChecksumRequest) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub bytes: u64,
    pub segments: usize,
    pub workers: usize,
    pub retries: u64,
    pub compactions: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed(DownloadReport),
    Canceled,
}

pub struct DownloadEngine {
    pub config: EngineConfig,
    transport: Arc<dyn SegmentTransport>,
    progress: ProgressCallback,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self {
            config,
            transport: Arc::new(transport),
            progress: silent(),
        })
    }

    pub fn with_transport(mut self, transport: Box<dyn SegmentTransport>) -> Self {
        self.transport = Arc::from(transport);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn prepare(&self, job: DownloadJob) -> CoreResult<Session> {
        if job.dest.as_os_str().is_empty() {
            return Err(CoreError::InvalidInput("destination path is empty".to_string()));
        }
        let segments: Arc<[Segment]> = build_segments(&job.segments)?.into();
        let state = Arc::new(SharedState::new(
            &segments,
            self.config.progress_flush_bytes,
            Arc::clone(&self.progress),
        ));
        Ok(Session {
            id: Uuid::new_v4(),
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            segments,
            state,
            dest: job.dest,
            checksum: job.checksum,
        })
    }

    pub fn download(&self, job: DownloadJob) -> CoreResult<DownloadOutcome> {
        self.prepare(job)?.run()
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<SharedState>,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn pause(&self) {
        self.state.pause();
    }

    pub fn resume(&self) {
        self.state.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    pub fn downloaded(&self) -> u64 {
        self.state.downloaded()
    }

    pub fn total_size(&self) -> Option<u64> {
        self.state.total_size()
    }
}

pub struct Session {
    id: Uuid,
    config: EngineConfig,
    transport: Arc<dyn SegmentTransport>,
    segments: Arc<[Segment]>,
    state: Arc<SharedState>,
    dest: PathBuf,
    checksum: Option<ChecksumRequest>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn segment_status(&self) -> Vec<SegmentStatus> {
        self.segments.iter().map(|segment| segment.status()).collect()
    }

    pub fn run(self) -> CoreResult<DownloadOutcome> {
        let started = Instant::now();
        let workers = self.config.effective_workers(self.segments.len());
        let slice = self.config.retry_slice();
        let temp_dir = self.temp_dir();
        ensure_dir(&temp_dir)?;
        if let Some(parent) = self.dest.parent() {
            ensure_dir(parent)?;
        }

        let mut temps = TempFiles::default();
        let result = self.execute(workers, slice, &temp_dir, &mut temps);
        self.state.mark_done();
        temps.cleanup();

        let outcome = match result {
            Ok(()) => self.finish(workers, started),
            Err(err) => match (self.state.first_error(), self.state.stop_reason()) {
                (Some(first), _) => Err(first),
                (None, Some(StopReason::Canceled)) => {
                    info!(session = %self.id, "download canceled");
                    Ok(DownloadOutcome::Canceled)
                }
                (None, _) => Err(err),
            },
        };
        if let Err(err) = &outcome {
            warn!(session = %self.id, error = %err, "download failed");
        }
        outcome
    }

    fn temp_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config.temp_dir {
            return dir.clone();
        }
        match self.dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn execute(
        &self,
        workers: usize,
        slice: Duration,
        temp_dir: &Path,
        temps: &mut TempFiles,
    ) -> CoreResult<()> {
        let name = self
            .dest
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("download");
        let threshold = self.config.compaction_threshold(average_size(&self.segments));
        let queue = Arc::new(WorkQueue::new(Arc::clone(&self.segments)));
        let merge_queue = Arc::new(MergeQueue::new(self.segments.len()));
        let barrier = Arc::new(Barrier::new(workers));
        let throttle = Arc::new(Throttle::new(self.config.speed_limit_bytes_per_sec));
        let fetcher = SegmentFetcher::new(
            &self.config,
            Arc::clone(&self.transport),
            Arc::clone(&self.state),
            throttle,
        );

        let mut pool = Vec::with_capacity(workers);
        for id in 0..workers {
            let path = temp_dir.join(format!(".{}.{}.part{}", name, self.id.simple(), id));
            temps.track(path.clone());
            pool.push(Worker::open(
                id,
                &path,
                Arc::clone(&queue),
                fetcher.clone(),
                Arc::clone(&merge_queue),
                Arc::clone(&self.state),
                Compactor::new(threshold, self.config.buffer_size),
                slice,
            )?);
        }
        let output = File::create(&self.dest)?;

        self.state
            .set_retry_suppressed(self.config.suppress_transient_errors);
        self.state.set_running(true);
        info!(
            session = %self.id,
            segments = self.segments.len(),
            workers,
            total = ?self.state.total_size(),
            compaction_threshold = threshold,
            "download started"
        );
        self.state.emit(ProgressEvent::Started {
            segments: self.segments.len(),
            workers,
            total: self.state.total_size(),
        });

        let mut threads = Threads::default();
        let handles = pool.iter().map(|worker| worker.handle()).collect();
        let merger = Merger::new(
            Arc::clone(&merge_queue),
            handles,
            output,
            Arc::clone(&self.state),
            self.config.buffer_size,
            slice,
        );
        let result = self.drive(pool, merger, &barrier, &merge_queue, slice, &mut threads);
        if result.is_err() {
            if !self.state.is_stopped() {
                if let Err(err) = &result {
                    self.state.fail(err.clone());
                }
            }
            merge_queue.stop();
        }
        threads.join_all();
        result
    }

    fn drive(
        &self,
        pool: Vec<Worker>,
        merger: Merger,
        barrier: &Arc<Barrier>,
        merge_queue: &MergeQueue,
        slice: Duration,
        threads: &mut Threads,
    ) -> CoreResult<()> {
        threads.push(merger.spawn()?);
        for (id, worker) in pool.into_iter().enumerate() {
            threads.push(worker.spawn(barrier.ticket(id))?);
        }
        barrier.wait(&self.state, slice)?;
        debug!(session = %self.id, "all workers finished");
        merge_queue.terminate();
        merge_queue.wait(&self.state, slice)
    }

    fn finish(&self, workers: usize, started: Instant) -> CoreResult<DownloadOutcome> {
        if let Some(checksum) = &self.checksum {
            verify_checksum(&self.dest, checksum)?;
        }
        let bytes = fs::metadata(&self.dest)?.len();
        self.state.emit_progress();
        self.state.emit(ProgressEvent::Finished { bytes });
        let report = DownloadReport {
            bytes,
            segments: self.segments.len(),
            workers,
            retries: self.state.retries(),
            compactions: self.state.compactions(),
            elapsed: started.elapsed(),
        };
        info!(
            session = %self.id,
            bytes,
            retries = report.retries,
            compactions = report.compactions,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "download complete"
        );
        Ok(DownloadOutcome::Completed(report))
    }
}

fn ensure_dir(dir: &Path) -> CoreResult<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|err| CoreError::Io(format!("{}: {}", dir.display(), err)))
}

/// Worker temp files, removed on every exit path.
#[derive(Default)]
struct TempFiles {
    paths: Vec<PathBuf>,
}

impl TempFiles {
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temp file"),
            }
        }
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[derive(Default)]
struct Threads {
    handles: Vec<JoinHandle<()>>,
}

impl Threads {
    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("segflow").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "thread panicked");
            }
        }
    }
}

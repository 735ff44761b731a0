//! Parallel segmented downloader.
//!
//! A download is an ordered list of independently fetchable segments. Worker
//! threads claim segments from a shared cursor and append them to private
//! temp files; a single merger thread copies them into the destination
//! strictly in segment order, so the result is byte-identical to fetching the
//! segments one after another. Workers compact their temp files in place as
//! the merger drains them.

pub mod barrier;
pub mod checksum;
pub mod compact;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod merge;
pub mod net;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod segment;
pub mod state;
pub mod throttle;
pub mod worker;


pub use crate::config::EngineConfig;
pub use crate::engine::{DownloadEngine, DownloadJob, DownloadOutcome, DownloadReport, Session, SessionHandle};
pub use crate::error::{CoreError, CoreResult};
pub use crate::progress::{ProgressCallback, ProgressEvent};
pub use crate::segment::{SegmentSpec, SegmentStatus};

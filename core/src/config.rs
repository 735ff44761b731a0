use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub retry_slice_ms: u64,
    pub suppress_transient_errors: bool,
    pub compaction_factor: u64,
    pub compaction_floor_bytes: u64,
    pub compaction_threshold_bytes: Option<u64>,
    pub buffer_size: usize,
    pub speed_limit_bytes_per_sec: Option<u64>,
    pub progress_flush_bytes: u64,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub proxy: Option<String>,
    pub headers: HashMap<String, String>,
    pub temp_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            base_delay_ms: 1000,
            retry_slice_ms: 50,
            suppress_transient_errors: true,
            compaction_factor: 16,
            compaction_floor_bytes: 1024 * 1024,
            compaction_threshold_bytes: None,
            buffer_size: 64 * 1024,
            speed_limit_bytes_per_sec: None,
            progress_flush_bytes: 256 * 1024,
            user_agent: "segflow/0.1".to_string(),
            request_timeout_secs: 60,
            proxy: None,
            headers: HashMap::new(),
            temp_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn retry_slice(&self) -> Duration {
        Duration::from_millis(self.retry_slice_ms.max(1))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Number of worker threads actually started for `segment_count` segments.
    pub fn effective_workers(&self, segment_count: usize) -> usize {
        self.workers.max(1).min(segment_count.max(1))
    }

    /// Bytes a worker may have merged before it shifts its temp file down.
    ///
    /// Without an explicit override this is the average segment size, floored
    /// at `compaction_floor_bytes`, times `compaction_factor`.
    pub fn compaction_threshold(&self, average_segment_size: u64) -> u64 {
        if let Some(threshold) = self.compaction_threshold_bytes {
            return threshold.max(1);
        }
        average_segment_size
            .max(self.compaction_floor_bytes)
            .saturating_mul(self.compaction_factor.max(1))
    }
}

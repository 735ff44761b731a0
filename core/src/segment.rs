use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::{CoreError, CoreResult};

const UNKNOWN_SIZE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Active => "active",
            SegmentStatus::Completed => "completed",
            SegmentStatus::Failed => "failed",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SegmentStatus::Pending => 0,
            SegmentStatus::Active => 1,
            SegmentStatus::Completed => 2,
            SegmentStatus::Failed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SegmentStatus::Active,
            2 => SegmentStatus::Completed,
            3 => SegmentStatus::Failed,
            _ => SegmentStatus::Pending,
        }
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing description of one segment, as handed over by whatever
/// resolved the resource into pieces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentSpec {
    pub uri: String,
    #[serde(default)]
    pub expected_size: Option<u64>,
    #[serde(default)]
    pub estimated_size: Option<u64>,
    /// Inclusive byte range within `uri`.
    #[serde(default)]
    pub range: Option<(u64, u64)>,
}

impl SegmentSpec {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            expected_size: None,
            estimated_size: None,
            range: None,
        }
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_estimated_size(mut self, size: u64) -> Self {
        self.estimated_size = Some(size);
        self
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, end));
        self
    }
}

/// One entry of the ordered segment list. Identity (`index`, `uri`, `range`)
/// is fixed; the expected size is filled in once the transport reports it.
#[derive(Debug)]
pub struct Segment {
    pub index: usize,
    pub uri: String,
    pub range: Option<(u64, u64)>,
    pub estimated_size: u64,
    expected_size: AtomicU64,
    status: AtomicU8,
}

impl Segment {
    pub fn new(index: usize, uri: impl Into<String>, expected_size: Option<u64>) -> Self {
        Self {
            index,
            uri: uri.into(),
            range: None,
            estimated_size: expected_size.unwrap_or(0),
            expected_size: AtomicU64::new(expected_size.unwrap_or(UNKNOWN_SIZE)),
            status: AtomicU8::new(SegmentStatus::Pending.as_u8()),
        }
    }

    pub fn from_spec(index: usize, spec: &SegmentSpec) -> CoreResult<Self> {
        if spec.uri.trim().is_empty() {
            return Err(CoreError::InvalidInput(format!("segment {} has an empty uri", index)));
        }
        let mut expected = spec.expected_size;
        if let Some((start, end)) = spec.range {
            if end < start {
                return Err(CoreError::InvalidInput(format!(
                    "segment {} has an inverted range {}-{}",
                    index, start, end
                )));
            }
            let range_size = end - start + 1;
            if let Some(size) = expected {
                if size != range_size {
                    return Err(CoreError::InvalidInput(format!(
                        "segment {} expects {} bytes but its range covers {}",
                        index, size, range_size
                    )));
                }
            }
            expected = Some(range_size);
        }
        let mut segment = Segment::new(index, spec.uri.trim(), expected);
        segment.range = spec.range;
        segment.estimated_size = expected.or(spec.estimated_size).unwrap_or(0);
        Ok(segment)
    }

    pub fn expected_size(&self) -> Option<u64> {
        match self.expected_size.load(Ordering::Acquire) {
            UNKNOWN_SIZE => None,
            size => Some(size),
        }
    }

    /// Records the true size; returns the previous value.
    pub fn set_expected_size(&self, size: u64) -> Option<u64> {
        match self.expected_size.swap(size, Ordering::AcqRel) {
            UNKNOWN_SIZE => None,
            previous => Some(previous),
        }
    }

    /// Best guess at the size, for heuristics only.
    pub fn size_hint(&self) -> u64 {
        self.expected_size().unwrap_or(self.estimated_size)
    }

    pub fn status(&self) -> SegmentStatus {
        SegmentStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SegmentStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }
}

pub fn build_segments(specs: &[SegmentSpec]) -> CoreResult<Vec<Segment>> {
    if specs.is_empty() {
        return Err(CoreError::InvalidInput("segment list is empty".to_string()));
    }
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| Segment::from_spec(index, spec))
        .collect()
}

pub fn average_size(segments: &[Segment]) -> u64 {
    if segments.is_empty() {
        return 0;
    }
    let total: u64 = segments.iter().map(|seg| seg.size_hint()).sum();
    total / segments.len() as u64
}

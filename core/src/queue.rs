use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::segment::Segment;

#[derive(Debug)]
pub struct WorkQueue {
    segments: Arc<[Segment]>,
    cursor: AtomicUsize,
}

impl WorkQueue {
    pub fn new(segments: Arc<[Segment]>) -> Self {
        Self {
            segments,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn claim(&self) -> Option<&Segment> {
        let index = self.cursor.fetch_add(1, AtomicOrdering::AcqRel);
        self.segments.get(index)
    }

    pub fn remaining(&self) -> usize {
        self.segments
            .len()
            .saturating_sub(self.cursor.load(AtomicOrdering::Acquire))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub worker_id: usize,
    pub segment_index: usize,
    /// Offset in the worker's temp file as it was at `epoch`.
    pub logical_offset: u64,
    pub byte_count: u64,
    pub epoch: u64,
}

// Reversed on `segment_index` so the max-heap pops the lowest index first.
impl Ord for MergeRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .segment_index
            .cmp(&self.segment_index)
            .then_with(|| other.worker_id.cmp(&self.worker_id))
    }
}

impl PartialOrd for MergeRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct PendingMerges {
    heap: BinaryHeap<MergeRequest>,
}

impl PendingMerges {
    pub fn push(&mut self, request: MergeRequest) {
        self.heap.push(request);
    }

    pub fn pop_if_next(&mut self, expected: usize) -> Option<MergeRequest> {
        match self.heap.peek() {
            Some(top) if top.segment_index == expected => self.heap.pop(),
            _ => None,
        }
    }

    pub fn peek_index(&self) -> Option<usize> {
        self.heap.peek().map(|request| request.segment_index)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

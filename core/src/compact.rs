//! In-place compaction of worker temp files.
//!
//! A worker appends segments to its temp file while the merger drains them
//! from the front. Once enough of the front has been merged, the unmerged
//! tail is shifted down to offset 0 and the file is truncated. Each shift
//! opens a new epoch; merge requests carry the epoch their offset was taken
//! in, and [`EpochTable`] maps such offsets to the current layout.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::worker::WorkerSlot;

/// Moves `[size, total_size)` of `file` down to `[0, total_size - size)` and
/// truncates the rest.
///
/// Copies front to back through `buffer`. The destination always trails the
/// source, so overlapping chunks are safe.
pub fn shift_down(file: &mut File, size: u64, total_size: u64, buffer: &mut [u8]) -> CoreResult<()> {
    if size > total_size {
        return Err(CoreError::InvalidState(format!(
            "cannot drop {} bytes from a {} byte file",
            size, total_size
        )));
    }
    if size == 0 {
        return Ok(());
    }
    if buffer.is_empty() {
        return Err(CoreError::InvalidState("compaction buffer is empty".to_string()));
    }
    let tail = total_size - size;
    let mut moved = 0u64;
    while moved < tail {
        let chunk = (tail - moved).min(buffer.len() as u64) as usize;
        file.seek(SeekFrom::Start(size + moved))?;
        file.read_exact(&mut buffer[..chunk])?;
        file.seek(SeekFrom::Start(moved))?;
        file.write_all(&buffer[..chunk])?;
        moved += chunk as u64;
    }
    file.set_len(tail)?;
    file.flush()?;
    Ok(())
}

/// Epoch number -> bytes removed from the front of the file before that
/// epoch began.
#[derive(Debug, Clone)]
pub struct EpochTable {
    offsets: BTreeMap<u64, u64>,
}

impl Default for EpochTable {
    fn default() -> Self {
        let mut offsets = BTreeMap::new();
        offsets.insert(0, 0);
        Self { offsets }
    }
}

impl EpochTable {
    pub fn current_epoch(&self) -> u64 {
        self.offsets.keys().next_back().copied().unwrap_or(0)
    }

    pub fn offset_at(&self, epoch: u64) -> Option<u64> {
        self.offsets.get(&epoch).copied()
    }

    fn current_offset(&self) -> u64 {
        self.offsets.values().next_back().copied().unwrap_or(0)
    }

    /// Opens the next epoch after `removed` more bytes were cut off.
    pub fn advance(&mut self, removed: u64) -> u64 {
        let epoch = self.current_epoch() + 1;
        let offset = self.current_offset() + removed;
        self.offsets.insert(epoch, offset);
        epoch
    }

    /// Maps an offset recorded during `epoch` onto the file as it is now.
    pub fn translate(&self, epoch: u64, logical: u64) -> CoreResult<u64> {
        let at = self.offset_at(epoch).ok_or_else(|| {
            CoreError::InvalidState(format!("epoch {} is no longer tracked", epoch))
        })?;
        let shift = self.current_offset() - at;
        logical.checked_sub(shift).ok_or_else(|| {
            CoreError::InvalidState(format!(
                "offset {} from epoch {} was compacted away",
                logical, epoch
            ))
        })
    }

    /// Drops epochs older than `epoch`; nothing still pending refers to them.
    pub fn discard_before(&mut self, epoch: u64) {
        if self.offsets.contains_key(&epoch) {
            self.offsets = self.offsets.split_off(&epoch);
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Per-worker compaction policy and scratch buffer.
#[derive(Debug)]
pub struct Compactor {
    threshold: u64,
    buffer: Vec<u8>,
}

impl Compactor {
    pub fn new(threshold: u64, buffer_size: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            buffer: vec![0u8; buffer_size.max(1024)],
        }
    }

    pub fn should_compact(&self, slot: &WorkerSlot) -> bool {
        slot.merged() > self.threshold
    }

    /// Shifts away the merged prefix of `file`. The caller must hold the
    /// worker lock that guards `slot`. Returns the number of bytes reclaimed.
    pub fn compact(&mut self, file: &mut File, slot: &mut WorkerSlot) -> CoreResult<u64> {
        let size = slot.merged();
        let total_size = slot.written();
        shift_down(file, size, total_size, &mut self.buffer)?;
        let epoch = slot.record_compaction(size);
        debug!(epoch, reclaimed = size, remaining = total_size - size, "temp file compacted");
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(file: &mut File) -> Vec<u8> {
        let mut out = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn shift_down_with_overlap() {
        let mut file = tempfile::tempfile().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        file.write_all(&data).unwrap();
        // Small buffer forces many overlapping chunk moves.
        let mut buffer = vec![0u8; 7];
        shift_down(&mut file, 3, data.len() as u64, &mut buffer).unwrap();
        assert_eq!(read_all(&mut file), &data[3..]);
    }

    #[test]
    fn shift_down_everything() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"merged").unwrap();
        let mut buffer = vec![0u8; 4];
        shift_down(&mut file, 6, 6, &mut buffer).unwrap();
        assert!(read_all(&mut file).is_empty());
        assert!(shift_down(&mut file, 1, 0, &mut buffer).is_err());
    }

    #[test]
    fn epoch_translation_across_compactions() {
        let mut table = EpochTable::default();
        // Request A written at offset 100 in epoch 0.
        let a = (0, 100);
        assert_eq!(table.advance(40), 1);
        // Request B written at offset 90 in epoch 1.
        let b = (1, 90);
        assert_eq!(table.advance(50), 2);

        assert_eq!(table.translate(a.0, a.1).unwrap(), 10);
        assert_eq!(table.translate(b.0, b.1).unwrap(), 40);
        assert_eq!(table.translate(2, 5).unwrap(), 5);
        // An offset inside a removed prefix cannot be translated.
        assert!(table.translate(0, 20).is_err());
    }

    #[test]
    fn discard_keeps_referenced_epochs() {
        let mut table = EpochTable::default();
        table.advance(10);
        table.advance(10);
        table.advance(10);
        table.discard_before(2);
        assert_eq!(table.len(), 2);
        assert!(table.translate(1, 50).is_err());
        assert_eq!(table.translate(2, 50).unwrap(), 40);
        assert_eq!(table.current_epoch(), 3);
    }
}

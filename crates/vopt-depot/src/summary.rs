//! The slab summary: a compact, persisted per-slab hint.
//!
//! One 4-byte entry per slab records whether the slab's reference counts
//! are known clean, a coarse free-block fullness hint for allocator
//! targeting, and the offset of the slab journal's tail block. The summary
//! is advisory except for the clean bit, which decides scrubbing after an
//! unclean shutdown.

use std::sync::Arc;
use vopt_block::{BlockIo, IoPriority};
use vopt_error::Result;
use vopt_types::{Pbn, SlabNumber, BLOCK_SIZE};

const ENTRY_SIZE: usize = 4;

/// Entries per summary block.
pub const SUMMARY_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / ENTRY_SIZE;

/// One slab's summary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabSummaryEntry {
    pub is_clean: bool,
    /// Free-space fullness on a 0..=255 scale (255 = empty slab).
    pub fullness_hint: u8,
    pub tail_block_offset: u16,
}

impl Default for SlabSummaryEntry {
    fn default() -> Self {
        Self {
            is_clean: true,
            fullness_hint: u8::MAX,
            tail_block_offset: 0,
        }
    }
}

/// Scale a free-block count to the 8-bit hint.
#[must_use]
pub fn compute_fullness_hint(free_blocks: u64, data_blocks: u64) -> u8 {
    if data_blocks == 0 {
        return 0;
    }
    ((free_blocks * 255) / data_blocks) as u8
}

/// The in-memory summary, persisted as a flat entry array.
#[derive(Debug)]
pub struct SlabSummary {
    origin: Pbn,
    entries: Vec<SlabSummaryEntry>,
    dirty: bool,
}

impl SlabSummary {
    #[must_use]
    pub fn new(origin: Pbn, slab_count: u32) -> Self {
        Self {
            origin,
            entries: vec![SlabSummaryEntry::default(); slab_count as usize],
            dirty: true,
        }
    }

    /// Blocks needed to persist `slab_count` entries.
    #[must_use]
    pub fn block_count(slab_count: u32) -> u64 {
        (slab_count as u64 * ENTRY_SIZE as u64).div_ceil(BLOCK_SIZE as u64)
    }

    #[must_use]
    pub fn entry(&self, slab: SlabNumber) -> SlabSummaryEntry {
        self.entries[slab.0 as usize]
    }

    pub fn update(&mut self, slab: SlabNumber, entry: SlabSummaryEntry) {
        if self.entries[slab.0 as usize] != entry {
            self.entries[slab.0 as usize] = entry;
            self.dirty = true;
        }
    }

    /// Mark a slab dirty (reference counts possibly stale on disk).
    pub fn mark_dirty(&mut self, slab: SlabNumber) {
        let mut entry = self.entry(slab);
        if entry.is_clean {
            entry.is_clean = false;
            self.update(slab, entry);
        }
    }

    pub fn save(&mut self, device: &Arc<dyn BlockIo>) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let blocks = Self::block_count(self.entries.len() as u32);
        for block_index in 0..blocks {
            let mut block = vec![0u8; BLOCK_SIZE];
            let base = block_index as usize * SUMMARY_ENTRIES_PER_BLOCK;
            for i in 0..SUMMARY_ENTRIES_PER_BLOCK {
                let Some(entry) = self.entries.get(base + i) else {
                    break;
                };
                let offset = i * ENTRY_SIZE;
                block[offset] = u8::from(entry.is_clean);
                block[offset + 1] = entry.fullness_hint;
                block[offset + 2..offset + 4]
                    .copy_from_slice(&entry.tail_block_offset.to_le_bytes());
            }
            device.write_block(
                IoPriority::Metadata,
                Pbn(self.origin.0 + block_index),
                &block,
            )?;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn load(device: &Arc<dyn BlockIo>, origin: Pbn, slab_count: u32) -> Result<Self> {
        let mut entries = Vec::with_capacity(slab_count as usize);
        let blocks = Self::block_count(slab_count);
        for block_index in 0..blocks {
            let block = device.read_block(IoPriority::Metadata, Pbn(origin.0 + block_index))?;
            for i in 0..SUMMARY_ENTRIES_PER_BLOCK {
                if entries.len() == slab_count as usize {
                    break;
                }
                let offset = i * ENTRY_SIZE;
                entries.push(SlabSummaryEntry {
                    is_clean: block[offset] != 0,
                    fullness_hint: block[offset + 1],
                    tail_block_offset: u16::from_le_bytes([block[offset + 2], block[offset + 3]]),
                });
            }
        }
        Ok(Self {
            origin,
            entries,
            dirty: false,
        })
    }

    /// Slabs whose reference counts must be rebuilt by scrubbing.
    pub fn dirty_slabs(&self) -> impl Iterator<Item = SlabNumber> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_clean)
            .map(|(i, _)| SlabNumber(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vopt_block::RamDevice;

    #[test]
    fn fullness_hint_scales() {
        assert_eq!(compute_fullness_hint(0, 100), 0);
        assert_eq!(compute_fullness_hint(100, 100), 255);
        let half = compute_fullness_hint(50, 100);
        assert!((126..=128).contains(&half));
    }

    #[test]
    fn summary_round_trips_through_device() {
        let device = RamDevice::new(16);
        let io: Arc<dyn BlockIo> = device;
        let mut summary = SlabSummary::new(Pbn(4), 3);
        summary.update(
            SlabNumber(1),
            SlabSummaryEntry {
                is_clean: false,
                fullness_hint: 17,
                tail_block_offset: 2,
            },
        );
        summary.save(&io).unwrap();
        let loaded = SlabSummary::load(&io, Pbn(4), 3).unwrap();
        assert_eq!(loaded.entry(SlabNumber(1)).fullness_hint, 17);
        assert!(!loaded.entry(SlabNumber(1)).is_clean);
        assert!(loaded.entry(SlabNumber(0)).is_clean);
        let dirty: Vec<_> = loaded.dirty_slabs().collect();
        assert_eq!(dirty, vec![SlabNumber(1)]);
    }

    #[test]
    fn save_skips_when_not_dirty() {
        let device = RamDevice::new(16);
        let io: Arc<dyn BlockIo> = device.clone();
        let mut summary = SlabSummary::new(Pbn(4), 1);
        summary.save(&io).unwrap();
        let writes = device.counters().metadata_writes.load(std::sync::atomic::Ordering::Relaxed);
        summary.save(&io).unwrap();
        assert_eq!(
            device.counters().metadata_writes.load(std::sync::atomic::Ordering::Relaxed),
            writes
        );
    }
}

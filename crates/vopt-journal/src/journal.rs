//! The live recovery journal.
//!
//! Owned by the journal zone. Entries batch into the open tail block; the
//! block is rewritten in place on every commit, so a partially filled block
//! reaches disk with an increasing entry count and a constant sequence
//! number. Per-sequence lock counts (block map dirtyings and slab journal
//! references) hold blocks until both downstreams have made their state
//! durable, at which point the head advances and the space is reusable.

use crate::format::{
    compute_check_byte, is_valid_block_header, max_entries_per_block, pack_block, BlockHeader,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use vopt_block::{BlockIo, IoPriority};
use vopt_error::{Result, VoptError};
use vopt_types::{
    JournalPoint, Pbn, RecoveryJournalEntry, SequenceNumber, METADATA_TYPE_RECOVERY_JOURNAL,
};

/// Which downstream still needs a journal block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalLock {
    BlockMap,
    SlabJournal,
}

#[derive(Debug, Default, Clone, Copy)]
struct LockCounts {
    block_map: u32,
    slab_journal: u32,
}

impl LockCounts {
    fn is_free(self) -> bool {
        self.block_map == 0 && self.slab_journal == 0
    }
}

/// Geometry and identity of the journal region.
#[derive(Debug, Clone, Copy)]
pub struct JournalConfig {
    pub origin: Pbn,
    /// Block count; must be a power of two.
    pub size: u64,
    pub nonce: u64,
    /// Entries per block; capped by the physical layout.
    pub entries_per_block: u16,
}

impl JournalConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.size.is_power_of_two() {
            return Err(VoptError::BadConfiguration(format!(
                "journal size {} is not a power of two",
                self.size
            )));
        }
        if self.entries_per_block == 0 || self.entries_per_block > max_entries_per_block() {
            return Err(VoptError::BadConfiguration(format!(
                "{} entries per journal block",
                self.entries_per_block
            )));
        }
        Ok(())
    }

    /// The on-disk block holding `sequence`.
    #[must_use]
    pub fn block_for(&self, sequence: SequenceNumber) -> Pbn {
        Pbn(self.origin.0 + (sequence % self.size))
    }
}

/// Counters surfaced through the stats interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct JournalStats {
    pub entries_appended: u64,
    pub blocks_committed: u64,
    pub blocks_reaped: u64,
    pub discarded_after_read_only: u64,
}

/// The recovery journal writer.
pub struct RecoveryJournal {
    config: JournalConfig,
    device: Arc<dyn BlockIo>,
    /// Sequence of the open tail block.
    tail: SequenceNumber,
    /// Oldest sequence not yet reaped.
    head: SequenceNumber,
    active_entries: Vec<RecoveryJournalEntry>,
    /// Entries of the open block already on disk (from the last commit).
    committed_count: u16,
    locks: BTreeMap<SequenceNumber, LockCounts>,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
    recovery_count: u8,
    stats: JournalStats,
}

impl RecoveryJournal {
    pub fn new(
        device: Arc<dyn BlockIo>,
        config: JournalConfig,
        tail: SequenceNumber,
        recovery_count: u8,
        logical_blocks_used: u64,
        block_map_data_blocks: u64,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device,
            tail,
            head: tail,
            active_entries: Vec::with_capacity(usize::from(config.entries_per_block)),
            committed_count: 0,
            locks: BTreeMap::new(),
            logical_blocks_used,
            block_map_data_blocks,
            recovery_count,
            stats: JournalStats::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    #[must_use]
    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    #[must_use]
    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        self.stats
    }

    #[must_use]
    pub fn recovery_count(&self) -> u8 {
        self.recovery_count
    }

    /// Closed blocks not yet reaped.
    #[must_use]
    pub fn blocks_in_use(&self) -> u64 {
        self.tail - self.head
    }

    /// Whether a new tail block may still be opened: the window
    /// `head..=tail` must fit the circular region.
    #[must_use]
    pub fn has_space(&self) -> bool {
        self.blocks_in_use() < self.config.size
    }

    /// Append one entry, acquiring a slab journal lock on its block for
    /// data operations. Returns the entry's journal point.
    ///
    /// Opening a new tail block requires free space; without it the caller
    /// suspends until lock releases let the head advance.
    pub fn append(&mut self, entry: RecoveryJournalEntry) -> Result<JournalPoint> {
        if self.active_entries.is_empty() && !self.has_space() {
            return Err(VoptError::ComponentBusy("recovery-journal"));
        }
        let point = JournalPoint::new(self.tail, self.active_entries.len() as u16);
        self.active_entries.push(entry);
        self.stats.entries_appended += 1;
        // Data entries need the slab journal to catch up before this block
        // may be reaped; block map entries pin it through the dirty era.
        self.acquire_lock(point.sequence_number, JournalLock::SlabJournal);
        trace!(
            target: "vopt::journal",
            event = "entry_appended",
            sequence = point.sequence_number,
            entry = point.entry_count,
        );
        if self.active_entries.len() as u16 == self.config.entries_per_block {
            self.commit(false)?;
        }
        Ok(point)
    }

    /// Write the open tail block. A full block advances the tail; a partial
    /// one stays open and will be rewritten with more entries later.
    /// Returns the committed sequence number.
    pub fn commit(&mut self, fua: bool) -> Result<SequenceNumber> {
        let entry_count = self.active_entries.len() as u16;
        let sequence = self.tail;
        if entry_count == self.committed_count && entry_count != self.config.entries_per_block {
            // Nothing new; still honor an explicit flush request.
            if fua {
                self.device.flush()?;
            }
            return Ok(sequence);
        }
        let header = BlockHeader {
            block_map_head: self.block_map_head(),
            slab_journal_head: self.slab_journal_head(),
            sequence_number: sequence,
            nonce: self.config.nonce,
            metadata_type: METADATA_TYPE_RECOVERY_JOURNAL,
            entry_count,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
            check_byte: compute_check_byte(sequence, self.config.size),
            recovery_count: self.recovery_count,
        };
        let block = pack_block(&header, &self.active_entries)?;
        let pbn = self.config.block_for(sequence);
        if let Err(error) = self.device.write_block(IoPriority::Metadata, pbn, &block) {
            warn!(
                target: "vopt::journal",
                event = "commit_failed",
                sequence,
                error = %error,
            );
            return Err(error);
        }
        if fua {
            self.device.flush()?;
        }
        self.stats.blocks_committed += 1;
        self.committed_count = entry_count;
        debug!(
            target: "vopt::journal",
            event = "block_committed",
            sequence,
            entries = entry_count,
            fua,
        );
        if entry_count == self.config.entries_per_block {
            self.tail += 1;
            self.active_entries.clear();
            self.committed_count = 0;
        }
        Ok(sequence)
    }

    /// A commit attempted after read-only entry is discarded here rather
    /// than issued; the lagging per-thread read-only caches make this a
    /// legal race.
    pub fn discard_pending(&mut self) {
        if self.active_entries.len() as u16 != self.committed_count {
            self.stats.discarded_after_read_only += 1;
            self.active_entries.truncate(usize::from(self.committed_count));
        }
    }

    pub fn acquire_lock(&mut self, sequence: SequenceNumber, kind: JournalLock) {
        let counts = self.locks.entry(sequence).or_default();
        match kind {
            JournalLock::BlockMap => counts.block_map += 1,
            JournalLock::SlabJournal => counts.slab_journal += 1,
        }
    }

    /// Release one lock of `kind` on `sequence`, then reap any freed
    /// prefix of the journal.
    pub fn release_lock(&mut self, sequence: SequenceNumber, kind: JournalLock) {
        if let Some(counts) = self.locks.get_mut(&sequence) {
            match kind {
                JournalLock::BlockMap => {
                    counts.block_map = counts.block_map.saturating_sub(1);
                }
                JournalLock::SlabJournal => {
                    counts.slab_journal = counts.slab_journal.saturating_sub(1);
                }
            }
            if counts.is_free() {
                self.locks.remove(&sequence);
            }
        }
        self.reap();
    }

    /// Oldest sequence still pinned by a block map dirty era.
    fn block_map_head(&self) -> SequenceNumber {
        self.locks
            .iter()
            .find(|(_, c)| c.block_map > 0)
            .map_or(self.tail, |(&seq, _)| seq)
    }

    /// Oldest sequence still pinned by a slab journal.
    fn slab_journal_head(&self) -> SequenceNumber {
        self.locks
            .iter()
            .find(|(_, c)| c.slab_journal > 0)
            .map_or(self.tail, |(&seq, _)| seq)
    }

    fn reap(&mut self) {
        let mut reaped = 0;
        while self.head < self.tail && !self.locks.contains_key(&self.head) {
            self.head += 1;
            reaped += 1;
        }
        if reaped > 0 {
            self.stats.blocks_reaped += reaped;
            trace!(target: "vopt::journal", event = "reaped", new_head = self.head);
        }
    }

    /// Validate a header read back from this journal's region at the
    /// offset for its sequence.
    #[must_use]
    pub fn accepts_header(&self, header: &BlockHeader) -> bool {
        is_valid_block_header(
            header,
            self.config.nonce,
            self.config.size,
            self.config.entries_per_block,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::unpack_block_header;
    use vopt_block::RamDevice;
    use vopt_types::{BlockMapSlot, DataLocation, JournalOperation, MappingState};

    fn entry(i: u64) -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataIncrement,
            slot: BlockMapSlot {
                pbn: Pbn(40),
                slot: (i % 812) as u16,
            },
            mapping: DataLocation::new(Pbn(100 + i), MappingState::Uncompressed),
        }
    }

    fn journal_parts(size: u64, epb: u16) -> (Arc<RamDevice>, RecoveryJournal) {
        let device = RamDevice::new(size + 10);
        let config = JournalConfig {
            origin: Pbn(2),
            size,
            nonce: 0x5eed,
            entries_per_block: epb,
        };
        let io: Arc<dyn BlockIo> = device.clone();
        let journal = RecoveryJournal::new(io, config, 1, 0, 0, 0).unwrap();
        (device, journal)
    }

    #[test]
    fn points_advance_within_and_across_blocks() {
        let (_dev, mut journal) = journal_parts(8, 3);
        let p0 = journal.append(entry(0)).unwrap();
        let p1 = journal.append(entry(1)).unwrap();
        assert_eq!(p0, JournalPoint::new(1, 0));
        assert_eq!(p1, JournalPoint::new(1, 1));
        // Third append fills the block and auto-commits; tail advances.
        let p2 = journal.append(entry(2)).unwrap();
        assert_eq!(p2, JournalPoint::new(1, 2));
        assert_eq!(journal.tail(), 2);
        let p3 = journal.append(entry(3)).unwrap();
        assert_eq!(p3, JournalPoint::new(2, 0));
    }

    #[test]
    fn partial_commit_rewrites_in_place() {
        let (device, mut journal) = journal_parts(8, 4);
        journal.append(entry(0)).unwrap();
        journal.commit(false).unwrap();
        journal.append(entry(1)).unwrap();
        journal.commit(false).unwrap();
        let block = device
            .read_block(IoPriority::Metadata, Pbn(2 + 1))
            .unwrap();
        let header = unpack_block_header(&block);
        assert_eq!(header.sequence_number, 1);
        assert_eq!(header.entry_count, 2);
    }

    #[test]
    fn wraparound_lands_on_offset_zero() {
        let size = 4;
        let config = JournalConfig {
            origin: Pbn(2),
            size,
            nonce: 1,
            entries_per_block: 1,
        };
        // Sequence `size` maps back to the first journal block.
        assert_eq!(config.block_for(size), Pbn(2));
        assert_eq!(config.block_for(size - 1), Pbn(2 + size - 1));
    }

    #[test]
    fn locks_gate_reaping() {
        let (_dev, mut journal) = journal_parts(4, 1);
        journal.append(entry(0)).unwrap(); // seq 1, sj lock held
        journal.append(entry(1)).unwrap(); // seq 2
        assert_eq!(journal.head(), 1);
        journal.release_lock(1, JournalLock::SlabJournal);
        assert_eq!(journal.head(), 2);
        journal.release_lock(2, JournalLock::SlabJournal);
        assert_eq!(journal.head(), 3);
        assert_eq!(journal.stats().blocks_reaped, 2);
    }

    #[test]
    fn space_pressure_reports_busy() {
        let (_dev, mut journal) = journal_parts(2, 1);
        journal.append(entry(0)).unwrap();
        journal.append(entry(1)).unwrap();
        // Two blocks in a two-block journal, none reapable.
        assert!(!journal.has_space());
        assert!(matches!(
            journal.append(entry(2)),
            Err(VoptError::ComponentBusy("recovery-journal"))
        ));
        journal.release_lock(1, JournalLock::SlabJournal);
        assert!(journal.has_space());
        journal.append(entry(2)).unwrap();
    }

    #[test]
    fn heads_reflect_outstanding_locks() {
        let (device, mut journal) = journal_parts(8, 2);
        journal.append(entry(0)).unwrap();
        journal.acquire_lock(1, JournalLock::BlockMap);
        journal.append(entry(1)).unwrap(); // fills and commits block 1
        journal.append(entry(2)).unwrap();
        // Both block-1 entries reach their slab journal; the block map
        // era still pins it.
        journal.release_lock(1, JournalLock::SlabJournal);
        journal.release_lock(1, JournalLock::SlabJournal);
        journal.commit(false).unwrap();
        let block = device
            .read_block(IoPriority::Metadata, Pbn(2 + 2 % 8))
            .unwrap();
        let header = unpack_block_header(&block);
        assert_eq!(header.block_map_head, 1, "era 1 still dirty");
        assert_eq!(header.slab_journal_head, 2);
    }

    #[test]
    fn commit_failure_surfaces_io_error() {
        let (device, mut journal) = journal_parts(8, 4);
        journal.append(entry(0)).unwrap();
        device.fail_writes_in(0..100);
        assert!(journal.commit(false).is_err());
        device.clear_write_faults();
        journal.discard_pending();
        assert_eq!(journal.stats().discarded_after_read_only, 1);
    }
}

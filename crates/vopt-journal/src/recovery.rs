//! Locating and replaying the recovery journal after an unclean shutdown.
//!
//! The scan accepts a block only when it sits at the offset its sequence
//! number implies and its header validates against the journal identity;
//! anything else is a block from a previous lap or unformatted space.
//! Replay applies entries in strict journal-point order and refuses, with
//! `CorruptJournal`, any entry that could not have been written by a
//! healthy journal.

use crate::format::{is_valid_block_header, unpack_block_entries, unpack_block_header};
use crate::journal::JournalConfig;
use std::sync::Arc;
use tracing::{debug, info};
use vopt_block::{BlockIo, IoPriority};
use vopt_error::{Result, VoptError};
use vopt_types::{
    JournalOperation, JournalPoint, RecoveryJournalEntry, SequenceNumber,
};

/// Result of scanning the journal region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadAndTail {
    /// Highest sequence found in a valid block.
    pub tail: SequenceNumber,
    /// Newest block map head recorded by any valid block.
    pub block_map_head: SequenceNumber,
    /// Newest slab journal head recorded by any valid block.
    pub slab_journal_head: SequenceNumber,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
    pub recovery_count: u8,
}

/// Read the whole journal region into memory, one buffer per block.
pub fn load_journal_region(
    device: &Arc<dyn BlockIo>,
    config: &JournalConfig,
) -> Result<Vec<Vec<u8>>> {
    let mut blocks = Vec::with_capacity(config.size as usize);
    for offset in 0..config.size {
        blocks.push(device.read_block(
            IoPriority::Metadata,
            vopt_types::Pbn(config.origin.0 + offset),
        )?);
    }
    Ok(blocks)
}

/// Scan every journal block, treating one as valid when its on-disk offset
/// matches its sequence number and the header passes validation. Returns
/// `None` when no block is valid (a freshly formatted device).
#[must_use]
pub fn find_head_and_tail(config: &JournalConfig, blocks: &[Vec<u8>]) -> Option<HeadAndTail> {
    let mut found: Option<HeadAndTail> = None;
    for (offset, block) in blocks.iter().enumerate() {
        let header = unpack_block_header(block);
        let congruent = header.sequence_number % config.size == offset as u64;
        if !congruent
            || !is_valid_block_header(
                &header,
                config.nonce,
                config.size,
                config.entries_per_block,
            )
        {
            // Old, unformatted, or misplaced.
            continue;
        }
        let best = found.get_or_insert(HeadAndTail {
            tail: header.sequence_number,
            block_map_head: 0,
            slab_journal_head: 0,
            logical_blocks_used: 0,
            block_map_data_blocks: 0,
            recovery_count: header.recovery_count,
        });
        if header.sequence_number >= best.tail {
            best.tail = header.sequence_number;
            best.logical_blocks_used = header.logical_blocks_used;
            best.block_map_data_blocks = header.block_map_data_blocks;
            best.recovery_count = header.recovery_count;
        }
        best.block_map_head = best.block_map_head.max(header.block_map_head);
        best.slab_journal_head = best.slab_journal_head.max(header.slab_journal_head);
    }
    found
}

/// Bounds a journal entry must respect to be applied.
#[derive(Debug, Clone, Copy)]
pub struct EntryBounds {
    /// One past the highest addressable physical block.
    pub physical_blocks: u64,
    /// Entries in one block map page.
    pub entries_per_page: u16,
}

/// Validate one journal entry against the device shape.
pub fn validate_entry(entry: &RecoveryJournalEntry, bounds: &EntryBounds) -> Result<()> {
    if entry.slot.pbn.0 >= bounds.physical_blocks {
        return Err(VoptError::CorruptJournal(format!(
            "entry addresses page {} beyond physical size {}",
            entry.slot.pbn, bounds.physical_blocks
        )));
    }
    if entry.slot.slot >= bounds.entries_per_page {
        return Err(VoptError::CorruptJournal(format!(
            "entry slot {} exceeds page capacity {}",
            entry.slot.slot, bounds.entries_per_page
        )));
    }
    if !entry.mapping.is_valid() {
        return Err(VoptError::CorruptJournal(format!(
            "entry mapping {:?} is not a possible mapping",
            entry.mapping
        )));
    }
    if entry.mapping.is_mapped() && entry.mapping.pbn.0 >= bounds.physical_blocks {
        return Err(VoptError::CorruptJournal(format!(
            "entry maps to {} beyond physical size {}",
            entry.mapping.pbn, bounds.physical_blocks
        )));
    }
    if entry.operation == JournalOperation::BlockMapIncrement {
        if entry.mapping.state.is_compressed() {
            return Err(VoptError::CorruptJournal(
                "block map increment with a compressed mapping".to_owned(),
            ));
        }
        if entry.mapping.is_zero_block() {
            return Err(VoptError::CorruptJournal(
                "block map increment pointing at the zero block".to_owned(),
            ));
        }
    }
    Ok(())
}

/// Counters from a replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub blocks_scanned: u64,
    pub blocks_applied: u64,
    pub entries_applied: u64,
}

/// Replay journal entries from `head` through `tail` in sequence order.
///
/// Every entry is validated before `apply` sees it; a missing or invalid
/// block inside the range ends the replay at the last good block, since
/// nothing after it can have committed.
pub fn replay(
    config: &JournalConfig,
    blocks: &[Vec<u8>],
    head: SequenceNumber,
    tail: SequenceNumber,
    bounds: &EntryBounds,
    apply: &mut dyn FnMut(JournalPoint, &RecoveryJournalEntry) -> Result<()>,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for sequence in head.max(1)..=tail {
        let offset = (sequence % config.size) as usize;
        let block = &blocks[offset];
        let header = unpack_block_header(block);
        stats.blocks_scanned += 1;
        if header.sequence_number != sequence
            || !is_valid_block_header(
                &header,
                config.nonce,
                config.size,
                config.entries_per_block,
            )
        {
            debug!(
                target: "vopt::journal::recovery",
                event = "replay_stopped",
                expected = sequence,
                found = header.sequence_number,
            );
            break;
        }
        let entries = unpack_block_entries(block, header.entry_count);
        for (index, entry) in entries.iter().enumerate() {
            validate_entry(entry, bounds)?;
            apply(JournalPoint::new(sequence, index as u16), entry)?;
            stats.entries_applied += 1;
        }
        stats.blocks_applied += 1;
    }
    info!(
        target: "vopt::journal::recovery",
        event = "replay_complete",
        blocks = stats.blocks_applied,
        entries = stats.entries_applied,
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::RecoveryJournal;
    use vopt_block::RamDevice;
    use vopt_types::{
        BlockMapSlot, DataLocation, MappingState, Pbn,
    };

    const BOUNDS: EntryBounds = EntryBounds {
        physical_blocks: 10_000,
        entries_per_page: 812,
    };

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

    fn config() -> JournalConfig {
        JournalConfig {
            origin: Pbn(1),
            size: 8,
            nonce: 0xcafe,
            entries_per_block: 3,
        }
    }

    fn written_journal(appends: u64) -> (Arc<RamDevice>, JournalConfig) {
        let device = RamDevice::new(64);
        let config = config();
        let io: Arc<dyn BlockIo> = device.clone();
        let mut journal = RecoveryJournal::new(io, config, 1, 0, 0, 0).unwrap();
        for i in 0..appends {
            journal.append(entry(i)).unwrap();
        }
        journal.commit(false).unwrap();
        (device, config)
    }

    #[test]
    fn empty_region_scans_to_none() {
        let device = RamDevice::new(64);
        let io: Arc<dyn BlockIo> = device;
        let blocks = load_journal_region(&io, &config()).unwrap();
        assert!(find_head_and_tail(&config(), &blocks).is_none());
    }

    #[test]
    fn scan_finds_highest_tail() {
        let (device, config) = written_journal(7); // blocks 1, 2 full; 3 partial
        let io: Arc<dyn BlockIo> = device;
        let blocks = load_journal_region(&io, &config).unwrap();
        let found = find_head_and_tail(&config, &blocks).unwrap();
        assert_eq!(found.tail, 3);
    }

    #[test]
    fn replay_applies_all_entries_in_order() {
        let (device, config) = written_journal(7);
        let io: Arc<dyn BlockIo> = device;
        let blocks = load_journal_region(&io, &config).unwrap();
        let found = find_head_and_tail(&config, &blocks).unwrap();
        let mut seen = Vec::new();
        let stats = replay(&config, &blocks, 1, found.tail, &BOUNDS, &mut |point, e| {
            seen.push((point, e.mapping.pbn.0));
            Ok(())
        })
        .unwrap();
        assert_eq!(stats.entries_applied, 7);
        assert_eq!(seen.len(), 7);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0), "points ascend");
        assert_eq!(seen[0].1, 100);
        assert_eq!(seen[6].1, 106);
    }

    #[test]
    fn stale_lap_blocks_are_ignored() {
        let (device, config) = written_journal(7);
        // Forge a block claiming a sequence from a later lap at offset 5.
        let mut header = crate::format::BlockHeader {
            sequence_number: 5 + config.size,
            nonce: config.nonce,
            metadata_type: vopt_types::METADATA_TYPE_RECOVERY_JOURNAL,
            entry_count: 0,
            // Check byte for the *old* lap: stale data, wrong byte.
            check_byte: crate::format::compute_check_byte(5, config.size),
            ..Default::default()
        };
        let block = crate::format::pack_block(&header, &[]).unwrap();
        device
            .write_block(IoPriority::Metadata, Pbn(1 + 5), &block)
            .unwrap();
        let io: Arc<dyn BlockIo> = device.clone();
        let blocks = load_journal_region(&io, &config).unwrap();
        let found = find_head_and_tail(&config, &blocks).unwrap();
        assert_eq!(found.tail, 3, "stale block must not extend the tail");

        // With a correct check byte the later-lap block is accepted.
        header.check_byte = crate::format::compute_check_byte(5 + config.size, config.size);
        let block = crate::format::pack_block(&header, &[]).unwrap();
        device
            .write_block(IoPriority::Metadata, Pbn(1 + 5), &block)
            .unwrap();
        let io: Arc<dyn BlockIo> = device;
        let blocks = load_journal_region(&io, &config).unwrap();
        let found = find_head_and_tail(&config, &blocks).unwrap();
        assert_eq!(found.tail, 5 + config.size);
    }

    #[test]
    fn validation_rejects_corrupt_entries() {
        let out_of_bounds = RecoveryJournalEntry {
            slot: BlockMapSlot {
                pbn: Pbn(BOUNDS.physical_blocks),
                slot: 0,
            },
            ..entry(0)
        };
        assert!(matches!(
            validate_entry(&out_of_bounds, &BOUNDS),
            Err(VoptError::CorruptJournal(_))
        ));

        let bad_slot = RecoveryJournalEntry {
            slot: BlockMapSlot {
                pbn: Pbn(1),
                slot: 812,
            },
            ..entry(0)
        };
        assert!(validate_entry(&bad_slot, &BOUNDS).is_err());

        let compressed_tree_page = RecoveryJournalEntry {
            operation: JournalOperation::BlockMapIncrement,
            mapping: DataLocation::new(Pbn(9), MappingState::Compressed(0)),
            ..entry(0)
        };
        assert!(validate_entry(&compressed_tree_page, &BOUNDS).is_err());

        let zero_tree_page = RecoveryJournalEntry {
            operation: JournalOperation::BlockMapIncrement,
            mapping: DataLocation::ZERO,
            ..entry(0)
        };
        assert!(validate_entry(&zero_tree_page, &BOUNDS).is_err());

        assert!(validate_entry(&entry(0), &BOUNDS).is_ok());
    }
}

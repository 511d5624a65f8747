//! On-disk format of recovery journal blocks.
//!
//! Each journal block is a 53-byte packed little-endian header followed by
//! 11-byte packed entries. The check byte changes on every trip around the
//! circular journal, so a stale block from a previous lap cannot be
//! mistaken for the sequence its offset implies.

use vopt_error::{Result, VoptError};
use vopt_types::{
    pack_recovery_journal_entry, unpack_recovery_journal_entry, RecoveryJournalEntry,
    SequenceNumber, BLOCK_SIZE, METADATA_TYPE_RECOVERY_JOURNAL, RECOVERY_JOURNAL_ENTRY_SIZE,
};

/// Size of the packed block header.
pub const BLOCK_HEADER_SIZE: usize = 53;

/// Unpacked recovery journal block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// Oldest sequence still needed by the block map's dirty eras.
    pub block_map_head: SequenceNumber,
    /// Oldest sequence still needed by any slab journal.
    pub slab_journal_head: SequenceNumber,
    pub sequence_number: SequenceNumber,
    pub nonce: u64,
    pub metadata_type: u8,
    pub entry_count: u16,
    /// Logical blocks in use when this block was opened.
    pub logical_blocks_used: u64,
    /// Allocated block map pages when this block was opened.
    pub block_map_data_blocks: u64,
    pub check_byte: u8,
    pub recovery_count: u8,
}

/// The check byte for `sequence` in a journal of `size` blocks.
#[must_use]
pub fn compute_check_byte(sequence: SequenceNumber, size: u64) -> u8 {
    (((sequence / size) & 0x7f) as u8) | 0x80
}

/// Pack a block header into the head of `block`.
pub fn pack_block_header(header: &BlockHeader, block: &mut [u8]) {
    debug_assert!(block.len() >= BLOCK_HEADER_SIZE);
    block[0..8].copy_from_slice(&header.block_map_head.to_le_bytes());
    block[8..16].copy_from_slice(&header.slab_journal_head.to_le_bytes());
    block[16..24].copy_from_slice(&header.sequence_number.to_le_bytes());
    block[24..32].copy_from_slice(&header.nonce.to_le_bytes());
    block[32] = header.metadata_type;
    block[33..35].copy_from_slice(&header.entry_count.to_le_bytes());
    block[35..43].copy_from_slice(&header.logical_blocks_used.to_le_bytes());
    block[43..51].copy_from_slice(&header.block_map_data_blocks.to_le_bytes());
    block[51] = header.check_byte;
    block[52] = header.recovery_count;
}

/// Unpack a block header from the head of `block`.
#[must_use]
pub fn unpack_block_header(block: &[u8]) -> BlockHeader {
    debug_assert!(block.len() >= BLOCK_HEADER_SIZE);
    let u64_at = |offset: usize| {
        u64::from_le_bytes(block[offset..offset + 8].try_into().expect("8 bytes"))
    };
    BlockHeader {
        block_map_head: u64_at(0),
        slab_journal_head: u64_at(8),
        sequence_number: u64_at(16),
        nonce: u64_at(24),
        metadata_type: block[32],
        entry_count: u16::from_le_bytes([block[33], block[34]]),
        logical_blocks_used: u64_at(35),
        block_map_data_blocks: u64_at(43),
        check_byte: block[51],
        recovery_count: block[52],
    }
}

/// How many 11-byte entries fit after the header. The configured cap may be
/// lower; it may never be higher.
#[must_use]
pub fn max_entries_per_block() -> u16 {
    ((BLOCK_SIZE - BLOCK_HEADER_SIZE) / RECOVERY_JOURNAL_ENTRY_SIZE) as u16
}

/// Serialize a full journal block: header plus packed entries.
pub fn pack_block(header: &BlockHeader, entries: &[RecoveryJournalEntry]) -> Result<Vec<u8>> {
    if entries.len() != usize::from(header.entry_count) {
        return Err(VoptError::InvalidArgument(format!(
            "header claims {} entries, got {}",
            header.entry_count,
            entries.len()
        )));
    }
    if entries.len() > usize::from(max_entries_per_block()) {
        return Err(VoptError::InvalidArgument(format!(
            "{} entries exceed block capacity",
            entries.len()
        )));
    }
    let mut block = vec![0u8; BLOCK_SIZE];
    pack_block_header(header, &mut block);
    let mut offset = BLOCK_HEADER_SIZE;
    for entry in entries {
        block[offset..offset + RECOVERY_JOURNAL_ENTRY_SIZE]
            .copy_from_slice(&pack_recovery_journal_entry(entry));
        offset += RECOVERY_JOURNAL_ENTRY_SIZE;
    }
    Ok(block)
}

/// Decode the entries a block's header says it holds.
#[must_use]
pub fn unpack_block_entries(block: &[u8], entry_count: u16) -> Vec<RecoveryJournalEntry> {
    let count = usize::from(entry_count.min(max_entries_per_block()));
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let offset = BLOCK_HEADER_SIZE + i * RECOVERY_JOURNAL_ENTRY_SIZE;
        let mut packed = [0u8; RECOVERY_JOURNAL_ENTRY_SIZE];
        packed.copy_from_slice(&block[offset..offset + RECOVERY_JOURNAL_ENTRY_SIZE]);
        entries.push(unpack_recovery_journal_entry(&packed));
    }
    entries
}

/// Header validity for a journal with the given identity: the right nonce
/// and metadata type, a check byte matching the sequence, and a plausible
/// entry count.
#[must_use]
pub fn is_valid_block_header(header: &BlockHeader, nonce: u64, size: u64, cap: u16) -> bool {
    header.nonce == nonce
        && header.metadata_type == METADATA_TYPE_RECOVERY_JOURNAL
        && header.check_byte == compute_check_byte(header.sequence_number, size)
        && header.entry_count <= cap
        && header.sequence_number > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use vopt_types::{
        BlockMapSlot, DataLocation, JournalOperation, MappingState, Pbn,
        RECOVERY_JOURNAL_ENTRIES_PER_BLOCK,
    };

    fn sample_entry(i: u64) -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataIncrement,
            slot: BlockMapSlot {
                pbn: Pbn(100 + i),
                slot: (i % 812) as u16,
            },
            mapping: DataLocation::new(Pbn(500 + i), MappingState::Uncompressed),
        }
    }

    #[test]
    fn header_round_trip() {
        let header = BlockHeader {
            block_map_head: 3,
            slab_journal_head: 2,
            sequence_number: 17,
            nonce: 0xdead_beef,
            metadata_type: METADATA_TYPE_RECOVERY_JOURNAL,
            entry_count: 5,
            logical_blocks_used: 1234,
            block_map_data_blocks: 8,
            check_byte: compute_check_byte(17, 16),
            recovery_count: 2,
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        pack_block_header(&header, &mut block);
        assert_eq!(unpack_block_header(&block), header);
    }

    #[test]
    fn check_byte_changes_per_lap() {
        let size = 16;
        assert_eq!(compute_check_byte(1, size), compute_check_byte(15, size));
        assert_ne!(compute_check_byte(15, size), compute_check_byte(16, size));
        // High bit is always set so an unformatted (zero) block never
        // carries a valid check byte.
        assert_eq!(compute_check_byte(0, size) & 0x80, 0x80);
    }

    #[test]
    fn block_round_trip() {
        let entries: Vec<_> = (0..7).map(sample_entry).collect();
        let header = BlockHeader {
            sequence_number: 9,
            nonce: 1,
            metadata_type: METADATA_TYPE_RECOVERY_JOURNAL,
            entry_count: 7,
            check_byte: compute_check_byte(9, 8),
            ..BlockHeader::default()
        };
        let block = pack_block(&header, &entries).unwrap();
        assert_eq!(unpack_block_header(&block).entry_count, 7);
        assert_eq!(unpack_block_entries(&block, 7), entries);
    }

    #[test]
    fn configured_cap_fits_physical_block() {
        assert!(RECOVERY_JOURNAL_ENTRIES_PER_BLOCK <= max_entries_per_block());
    }

    #[test]
    fn header_validation_rejects_imposters() {
        let size = 16;
        let mut header = BlockHeader {
            sequence_number: 5,
            nonce: 7,
            metadata_type: METADATA_TYPE_RECOVERY_JOURNAL,
            entry_count: 0,
            check_byte: compute_check_byte(5, size),
            ..BlockHeader::default()
        };
        assert!(is_valid_block_header(&header, 7, size, 311));
        assert!(!is_valid_block_header(&header, 8, size, 311));
        header.check_byte ^= 0x40;
        assert!(!is_valid_block_header(&header, 7, size, 311));
    }
}

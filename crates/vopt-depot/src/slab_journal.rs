//! Per-slab circular journal of reference count deltas.
//!
//! Entries are 3 bytes: a 23-bit slab block offset and an increment bit.
//! Blocks holding any block-map increment carry a trailing type bitmap and
//! a smaller entry capacity. Each block header records the recovery journal
//! point of its newest entry; a slab journal block must be durable before
//! the recovery journal block it references may be reaped.

use std::sync::Arc;
use tracing::{debug, trace};
use vopt_block::{BlockIo, IoPriority};
use vopt_error::{Result, VoptError};
use vopt_types::{
    pack_journal_point, unpack_journal_point, JournalOperation, JournalPoint, Pbn, SequenceNumber,
    SlabBlockNumber, BLOCK_SIZE, MAX_SLAB_BLOCK_NUMBER, METADATA_TYPE_SLAB_JOURNAL,
};

/// Size of the packed slab journal block header.
pub const SLAB_JOURNAL_HEADER_SIZE: usize = 36;

const PAYLOAD_SIZE: usize = BLOCK_SIZE - SLAB_JOURNAL_HEADER_SIZE;
const ENTRY_SIZE: usize = 3;

/// Entries per block when none are block-map increments.
pub const SLAB_JOURNAL_ENTRIES_PER_BLOCK: u16 = (PAYLOAD_SIZE / ENTRY_SIZE) as u16;

/// Entries per block when the type bitmap is present: 25 bits per entry
/// (24 entry bits plus one bitmap bit).
pub const SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK: u16 = ((PAYLOAD_SIZE * 8) / 25) as u16;

/// One delta applied to a slab's reference counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub sbn: SlabBlockNumber,
    pub operation: JournalOperation,
}

/// Unpacked slab journal block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabJournalBlockHeader {
    /// Oldest unreaped sequence of this slab journal at write time.
    pub head: SequenceNumber,
    pub sequence_number: SequenceNumber,
    /// Recovery journal point of the newest entry in this block.
    pub recovery_point: JournalPoint,
    pub nonce: u64,
    pub metadata_type: u8,
    pub has_block_map_increments: bool,
    pub entry_count: u16,
}

fn pack_header(header: &SlabJournalBlockHeader, block: &mut [u8]) {
    block[0..8].copy_from_slice(&header.head.to_le_bytes());
    block[8..16].copy_from_slice(&header.sequence_number.to_le_bytes());
    block[16..24].copy_from_slice(&pack_journal_point(header.recovery_point));
    block[24..32].copy_from_slice(&header.nonce.to_le_bytes());
    block[32] = header.metadata_type;
    block[33] = u8::from(header.has_block_map_increments);
    block[34..36].copy_from_slice(&header.entry_count.to_le_bytes());
}

fn unpack_header(block: &[u8]) -> SlabJournalBlockHeader {
    let mut point = [0u8; 8];
    point.copy_from_slice(&block[16..24]);
    SlabJournalBlockHeader {
        head: u64::from_le_bytes(block[0..8].try_into().expect("8 bytes")),
        sequence_number: u64::from_le_bytes(block[8..16].try_into().expect("8 bytes")),
        recovery_point: unpack_journal_point(&point),
        nonce: u64::from_le_bytes(block[24..32].try_into().expect("8 bytes")),
        metadata_type: block[32],
        has_block_map_increments: block[33] != 0,
        entry_count: u16::from_le_bytes([block[34], block[35]]),
    }
}

fn pack_entry(entry: SlabJournalEntry, bytes: &mut [u8]) {
    let offset = entry.sbn.0 & MAX_SLAB_BLOCK_NUMBER;
    bytes[0] = (offset & 0xff) as u8;
    bytes[1] = ((offset >> 8) & 0xff) as u8;
    bytes[2] = (((offset >> 16) & 0x7f) as u8)
        | if entry.operation.is_increment() { 0x80 } else { 0 };
}

fn unpack_entry(bytes: &[u8], is_block_map: bool) -> SlabJournalEntry {
    let offset =
        u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2] & 0x7f) << 16);
    let increment = bytes[2] & 0x80 != 0;
    // The bitmap flags block-map increments; tree page releases journal as
    // plain data decrements.
    let operation = match (is_block_map, increment) {
        (true, _) => JournalOperation::BlockMapIncrement,
        (false, true) => JournalOperation::DataIncrement,
        (false, false) => JournalOperation::DataDecrement,
    };
    SlabJournalEntry {
        sbn: SlabBlockNumber(offset),
        operation,
    }
}

/// Serialize one sealed block.
fn pack_block(header: &SlabJournalBlockHeader, entries: &[SlabJournalEntry]) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    pack_header(header, &mut block);
    for (i, &entry) in entries.iter().enumerate() {
        let offset = SLAB_JOURNAL_HEADER_SIZE + i * ENTRY_SIZE;
        pack_entry(entry, &mut block[offset..offset + ENTRY_SIZE]);
    }
    if header.has_block_map_increments {
        // Bitmap sits after the entry array's full-capacity extent.
        let bitmap_base =
            SLAB_JOURNAL_HEADER_SIZE + usize::from(SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK) * ENTRY_SIZE;
        for (i, &entry) in entries.iter().enumerate() {
            if entry.operation == JournalOperation::BlockMapIncrement {
                block[bitmap_base + i / 8] |= 1 << (i % 8);
            }
        }
    }
    block
}

/// Decode a sealed block's entries using its header.
#[must_use]
pub fn unpack_block_entries(block: &[u8], header: &SlabJournalBlockHeader) -> Vec<SlabJournalEntry> {
    let cap = if header.has_block_map_increments {
        SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
    } else {
        SLAB_JOURNAL_ENTRIES_PER_BLOCK
    };
    let count = usize::from(header.entry_count.min(cap));
    let bitmap_base =
        SLAB_JOURNAL_HEADER_SIZE + usize::from(SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK) * ENTRY_SIZE;
    (0..count)
        .map(|i| {
            let offset = SLAB_JOURNAL_HEADER_SIZE + i * ENTRY_SIZE;
            let is_block_map = header.has_block_map_increments
                && block[bitmap_base + i / 8] & (1 << (i % 8)) != 0;
            unpack_entry(&block[offset..offset + ENTRY_SIZE], is_block_map)
        })
        .collect()
}

/// Geometry and identity of one slab's journal region.
#[derive(Debug, Clone, Copy)]
pub struct SlabJournalConfig {
    pub origin: Pbn,
    /// Block count of the circular region.
    pub size: u64,
    pub nonce: u64,
}

impl SlabJournalConfig {
    #[must_use]
    pub fn block_for(&self, sequence: SequenceNumber) -> Pbn {
        Pbn(self.origin.0 + (sequence % self.size))
    }
}

/// Validate a block header against the journal identity and an expected
/// sequence number.
#[must_use]
pub fn is_valid_slab_block_header(
    header: &SlabJournalBlockHeader,
    config: &SlabJournalConfig,
    expected_sequence: SequenceNumber,
) -> bool {
    let cap = if header.has_block_map_increments {
        SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
    } else {
        SLAB_JOURNAL_ENTRIES_PER_BLOCK
    };
    header.nonce == config.nonce
        && header.metadata_type == METADATA_TYPE_SLAB_JOURNAL
        && header.sequence_number == expected_sequence
        && header.entry_count <= cap
}

/// Result of appending to the tail block.
#[derive(Debug, Default)]
pub struct AppendOutcome {
    /// The slab journal point assigned to the entry.
    pub point: JournalPoint,
    /// Recovery journal sequences released by a block commit, if one
    /// happened.
    pub released_recovery_sequences: Vec<SequenceNumber>,
}

/// The live journal of one slab.
#[derive(Debug)]
pub struct SlabJournal {
    config: SlabJournalConfig,
    tail: SequenceNumber,
    head: SequenceNumber,
    entries: Vec<SlabJournalEntry>,
    /// Recovery sequence of each pending entry, for lock release on commit.
    pending_recovery: Vec<SequenceNumber>,
    has_block_map_increments: bool,
    tail_recovery_point: JournalPoint,
}

impl SlabJournal {
    #[must_use]
    pub fn new(config: SlabJournalConfig, tail: SequenceNumber) -> Self {
        Self {
            config,
            tail,
            head: tail,
            entries: Vec::new(),
            pending_recovery: Vec::new(),
            has_block_map_increments: false,
            tail_recovery_point: JournalPoint::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SlabJournalConfig {
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

    fn capacity(&self) -> u16 {
        if self.has_block_map_increments {
            SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
        } else {
            SLAB_JOURNAL_ENTRIES_PER_BLOCK
        }
    }

    /// Append one entry tagged with its recovery journal point, sealing
    /// the tail block first when it cannot take the entry.
    pub fn append(
        &mut self,
        device: &Arc<dyn BlockIo>,
        entry: SlabJournalEntry,
        recovery_point: JournalPoint,
    ) -> Result<AppendOutcome> {
        let mut released = Vec::new();
        let becomes_full_format =
            entry.operation == JournalOperation::BlockMapIncrement && !self.has_block_map_increments;
        let over_capacity = self.entries.len() as u16 >= self.capacity()
            || (becomes_full_format
                && self.entries.len() as u16 >= SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK);
        if over_capacity {
            released = self.commit(device)?;
        }
        if self.tail - self.head >= self.config.size {
            return Err(VoptError::ComponentBusy("slab-journal"));
        }
        let point = JournalPoint::new(self.tail, self.entries.len() as u16);
        if entry.operation == JournalOperation::BlockMapIncrement {
            self.has_block_map_increments = true;
        }
        self.entries.push(entry);
        self.pending_recovery.push(recovery_point.sequence_number);
        self.tail_recovery_point = recovery_point;
        trace!(
            target: "vopt::depot::journal",
            event = "entry_appended",
            sequence = point.sequence_number,
            entry = point.entry_count,
            sbn = entry.sbn.0,
        );
        if self.entries.len() as u16 == self.capacity() {
            let mut more = self.commit(device)?;
            released.append(&mut more);
        }
        Ok(AppendOutcome {
            point,
            released_recovery_sequences: released,
        })
    }

    /// Seal and write the tail block. Returns the recovery sequences whose
    /// locks the commit releases. An empty tail block is a no-op.
    pub fn commit(&mut self, device: &Arc<dyn BlockIo>) -> Result<Vec<SequenceNumber>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        let header = SlabJournalBlockHeader {
            head: self.head,
            sequence_number: self.tail,
            recovery_point: self.tail_recovery_point,
            nonce: self.config.nonce,
            metadata_type: METADATA_TYPE_SLAB_JOURNAL,
            has_block_map_increments: self.has_block_map_increments,
            entry_count: self.entries.len() as u16,
        };
        let block = pack_block(&header, &self.entries);
        device.write_block(IoPriority::Metadata, self.config.block_for(self.tail), &block)?;
        debug!(
            target: "vopt::depot::journal",
            event = "block_committed",
            sequence = self.tail,
            entries = self.entries.len(),
        );
        self.tail += 1;
        self.entries.clear();
        self.has_block_map_increments = false;
        Ok(std::mem::take(&mut self.pending_recovery))
    }

    /// All journalled state up to the tail is reflected in durable
    /// reference counts; the whole region becomes reusable.
    pub fn reap_all(&mut self) {
        self.head = self.tail;
    }

    /// True when no sealed-but-unreaped blocks remain and nothing is
    /// pending.
    #[must_use]
    pub fn is_reaped(&self) -> bool {
        self.head == self.tail && self.entries.is_empty()
    }
}

/// Scan a slab journal region: decode every valid block, returning them in
/// sequence order starting from the block with the lowest head field.
pub fn scan_region(
    device: &Arc<dyn BlockIo>,
    config: &SlabJournalConfig,
) -> Result<Vec<(SlabJournalBlockHeader, Vec<SlabJournalEntry>)>> {
    let mut found: Vec<(SlabJournalBlockHeader, Vec<u8>)> = Vec::new();
    for offset in 0..config.size {
        let raw = device.read_block(IoPriority::Metadata, Pbn(config.origin.0 + offset))?;
        let header = unpack_header(&raw);
        if header.nonce != config.nonce
            || header.metadata_type != METADATA_TYPE_SLAB_JOURNAL
            || header.sequence_number % config.size != offset
        {
            continue;
        }
        found.push((header, raw));
    }
    if found.is_empty() {
        return Ok(Vec::new());
    }
    found.sort_by_key(|(header, _)| header.sequence_number);
    let lowest_head = found
        .iter()
        .map(|(header, _)| header.head)
        .min()
        .unwrap_or(0);
    let mut blocks = Vec::new();
    let mut expected = None;
    for (header, raw) in found {
        if header.sequence_number < lowest_head {
            continue;
        }
        if let Some(expected_sequence) = expected {
            if header.sequence_number != expected_sequence {
                // A gap means everything after is from an older epoch.
                break;
            }
        }
        if !is_valid_slab_block_header(&header, config, header.sequence_number) {
            return Err(VoptError::CorruptJournal(format!(
                "slab journal block {} fails validation",
                header.sequence_number
            )));
        }
        let entries = unpack_block_entries(&raw, &header);
        expected = Some(header.sequence_number + 1);
        blocks.push((header, entries));
    }
    Ok(blocks)
}

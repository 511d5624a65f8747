#![forbid(unsafe_code)]
//! Core types for VOpt: block numbers, mapping states, journal points and
//! operations, chunk names, and the packed on-disk codecs shared by the
//! journal and block map crates.
//!
//! All on-disk encodings here are little-endian and bit-exact; each codec
//! has a matching round-trip test.

use serde::{Deserialize, Serialize};
use std::fmt;
use vopt_error::{Result, VoptError};

/// Fixed block size, everywhere.
pub const BLOCK_SIZE: usize = 4096;

/// Size of a dedupe chunk fingerprint.
pub const CHUNK_NAME_SIZE: usize = 16;

/// Widest representable block number: PBNs and LBNs are 48-bit.
pub const MAX_BLOCK_NUMBER: u64 = (1 << 48) - 1;

/// Block map entries carry a 36-bit PBN (high nibble + 32-bit low word).
pub const MAX_BLOCK_MAP_PBN: u64 = (1 << 36) - 1;

/// Number of compressed fragments that fit in one physical block.
pub const MAX_COMPRESSION_SLOTS: u8 = 14;

/// Entries in one block map leaf or interior page.
pub const BLOCK_MAP_ENTRIES_PER_PAGE: usize = 812;

/// Cap on entries per recovery journal block. More would change the
/// amortization of metadata writes and recovery speed.
pub const RECOVERY_JOURNAL_ENTRIES_PER_BLOCK: u16 = 311;

/// The physical block reserved as the zero block.
pub const ZERO_BLOCK: Pbn = Pbn(0);

/// Reference count encodings (8-bit counters).
pub const EMPTY_REFERENCE_COUNT: u8 = 0;
/// Largest exact count; beyond this the counter saturates to shared.
pub const MAXIMUM_REFERENCE_COUNT: u8 = 253;
pub const PROVISIONAL_REFERENCE_COUNT: u8 = 254;
pub const SHARED_REFERENCE_COUNT: u8 = 255;

/// On-disk metadata type tags.
pub const METADATA_TYPE_RECOVERY_JOURNAL: u8 = 1;
pub const METADATA_TYPE_SLAB_JOURNAL: u8 = 2;

/// A physical block number on the backing device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Pbn(pub u64);

impl Pbn {
    /// True for the reserved zero block.
    #[must_use]
    pub fn is_zero_block(self) -> bool {
        self == ZERO_BLOCK
    }
}

impl fmt::Display for Pbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// A logical block number in the virtual device the host sees.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lbn(pub u64);

impl fmt::Display for Lbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A block offset within one slab (23 bits on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlabBlockNumber(pub u32);

pub const MAX_SLAB_BLOCK_NUMBER: u32 = (1 << 23) - 1;

/// Index of a slab within the depot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlabNumber(pub u32);

/// A monotonically increasing journal block sequence number.
pub type SequenceNumber = u64;

/// The state half of a block mapping.
///
/// The on-disk form is a 4-bit nibble: 0 = unmapped, 1 = uncompressed,
/// 2..=15 = compressed fragment in slot 0..=13.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingState {
    Unmapped,
    Uncompressed,
    Compressed(u8),
}

impl MappingState {
    /// Decode from the 4-bit on-disk nibble.
    #[must_use]
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble & 0x0f {
            0 => Some(Self::Unmapped),
            1 => Some(Self::Uncompressed),
            n => Some(Self::Compressed(n - 2)),
        }
    }

    /// Encode to the 4-bit on-disk nibble.
    #[must_use]
    pub fn to_nibble(self) -> u8 {
        match self {
            Self::Unmapped => 0,
            Self::Uncompressed => 1,
            Self::Compressed(slot) => 2 + (slot & 0x0f),
        }
    }

    #[must_use]
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    /// Construct the state for a compressed fragment, checking the slot.
    pub fn for_slot(slot: u8) -> Result<Self> {
        if slot >= MAX_COMPRESSION_SLOTS {
            return Err(VoptError::InvalidArgument(format!(
                "compression slot {slot} out of range"
            )));
        }
        Ok(Self::Compressed(slot))
    }
}

/// A (PBN, state) pair: one block map entry, one piece of dedupe advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataLocation {
    pub pbn: Pbn,
    pub state: MappingState,
}

impl DataLocation {
    pub const UNMAPPED: Self = Self {
        pbn: ZERO_BLOCK,
        state: MappingState::Unmapped,
    };

    /// The mapping recorded for a block of all zeros: the zero block,
    /// nominally uncompressed.
    pub const ZERO: Self = Self {
        pbn: ZERO_BLOCK,
        state: MappingState::Uncompressed,
    };

    #[must_use]
    pub fn new(pbn: Pbn, state: MappingState) -> Self {
        Self { pbn, state }
    }

    #[must_use]
    pub fn is_mapped(self) -> bool {
        self.state != MappingState::Unmapped
    }

    /// True when this mapping names the reserved zero block.
    #[must_use]
    pub fn is_zero_block(self) -> bool {
        self.is_mapped() && self.pbn.is_zero_block()
    }

    /// A location is valid when unmapped entries carry no PBN and mapped
    /// entries fit the 36-bit entry encoding.
    #[must_use]
    pub fn is_valid(self) -> bool {
        match self.state {
            MappingState::Unmapped => self.pbn == ZERO_BLOCK,
            MappingState::Uncompressed => self.pbn.0 <= MAX_BLOCK_MAP_PBN,
            MappingState::Compressed(slot) => {
                slot < MAX_COMPRESSION_SLOTS && self.pbn.0 <= MAX_BLOCK_MAP_PBN
            }
        }
    }
}

/// Size of a packed block map entry.
pub const BLOCK_MAP_ENTRY_SIZE: usize = 5;

/// Pack a mapping into its 5-byte on-disk form.
///
/// Byte 0 holds the 4-bit mapping state (low nibble) and the four highest
/// bits of the 36-bit PBN (high nibble); bytes 1..5 are the 32 low-order
/// PBN bits, little-endian.
#[must_use]
pub fn pack_block_map_entry(location: DataLocation) -> [u8; BLOCK_MAP_ENTRY_SIZE] {
    let pbn = location.pbn.0 & MAX_BLOCK_MAP_PBN;
    let mut packed = [0u8; BLOCK_MAP_ENTRY_SIZE];
    packed[0] = location.state.to_nibble() | (((pbn >> 32) as u8) << 4);
    packed[1..5].copy_from_slice(&((pbn & 0xffff_ffff) as u32).to_le_bytes());
    packed
}

/// Unpack a 5-byte block map entry.
#[must_use]
pub fn unpack_block_map_entry(packed: &[u8; BLOCK_MAP_ENTRY_SIZE]) -> DataLocation {
    let state = MappingState::from_nibble(packed[0] & 0x0f).unwrap_or(MappingState::Unmapped);
    let high = u64::from(packed[0] >> 4);
    let low = u64::from(u32::from_le_bytes([packed[1], packed[2], packed[3], packed[4]]));
    DataLocation {
        pbn: Pbn((high << 32) | low),
        state,
    }
}

/// The operation on a physical block, from the point of view of the
/// recovery journal, slab journals, and reference counts. Two bits on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JournalOperation {
    DataDecrement = 0,
    DataIncrement = 1,
    BlockMapDecrement = 2,
    BlockMapIncrement = 3,
}

impl JournalOperation {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::DataDecrement,
            1 => Self::DataIncrement,
            2 => Self::BlockMapDecrement,
            _ => Self::BlockMapIncrement,
        }
    }

    #[must_use]
    pub fn is_increment(self) -> bool {
        matches!(self, Self::DataIncrement | Self::BlockMapIncrement)
    }

    #[must_use]
    pub fn is_block_map(self) -> bool {
        matches!(self, Self::BlockMapIncrement | Self::BlockMapDecrement)
    }
}

/// The absolute position of an entry in a recovery or slab journal.
///
/// The derived ordering (sequence first, then entry count) is the strict
/// total order the durability rules are phrased in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct JournalPoint {
    pub sequence_number: SequenceNumber,
    pub entry_count: u16,
}

impl JournalPoint {
    #[must_use]
    pub fn new(sequence_number: SequenceNumber, entry_count: u16) -> Self {
        Self {
            sequence_number,
            entry_count,
        }
    }

    /// A point is valid once its journal has issued sequence one.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.sequence_number > 0
    }

    /// Move forward by one entry, rolling into the next block at
    /// `entries_per_block`.
    pub fn advance(&mut self, entries_per_block: u16) {
        self.entry_count += 1;
        if self.entry_count == entries_per_block {
            self.sequence_number += 1;
            self.entry_count = 0;
        }
    }

    #[must_use]
    pub fn before(self, other: Self) -> bool {
        self < other
    }
}

impl fmt::Display for JournalPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence_number, self.entry_count)
    }
}

/// Pack a journal point to its 8-byte on-disk form: the little-endian u64
/// `(sequence_number << 16) | entry_count`. Only the low 48 bits of the
/// sequence number survive the encoding.
#[must_use]
pub fn pack_journal_point(point: JournalPoint) -> [u8; 8] {
    let encoded = (point.sequence_number << 16) | u64::from(point.entry_count);
    encoded.to_le_bytes()
}

/// Unpack an 8-byte packed journal point.
#[must_use]
pub fn unpack_journal_point(packed: &[u8; 8]) -> JournalPoint {
    let encoded = u64::from_le_bytes(*packed);
    JournalPoint {
        sequence_number: encoded >> 16,
        entry_count: (encoded & 0xffff) as u16,
    }
}

/// The block map page and slot a recovery journal entry addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockMapSlot {
    /// PBN of the block map tree page (36 bits in the packed entry).
    pub pbn: Pbn,
    /// Slot index within the page (10 bits on disk).
    pub slot: u16,
}

/// One recovery journal entry: the page slot acquiring or releasing a
/// reference, the mapping stored there, and the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryJournalEntry {
    pub operation: JournalOperation,
    pub slot: BlockMapSlot,
    pub mapping: DataLocation,
}

/// Size of a packed recovery journal entry.
pub const RECOVERY_JOURNAL_ENTRY_SIZE: usize = 11;

/// Pack a recovery journal entry to its 11-byte on-disk form.
///
/// Byte 0: bits 1..0 operation, bits 7..2 the low six slot bits.
/// Byte 1: bits 3..0 the high four slot bits, bits 7..4 the PBN high nibble.
/// Bytes 2..6: the 32 low-order PBN bits, little-endian.
/// Bytes 6..11: the packed block map entry for the mapping.
#[must_use]
pub fn pack_recovery_journal_entry(
    entry: &RecoveryJournalEntry,
) -> [u8; RECOVERY_JOURNAL_ENTRY_SIZE] {
    let mut packed = [0u8; RECOVERY_JOURNAL_ENTRY_SIZE];
    let slot = entry.slot.slot & 0x3ff;
    let pbn = entry.slot.pbn.0 & MAX_BLOCK_MAP_PBN;
    packed[0] = (entry.operation as u8) | (((slot & 0x3f) as u8) << 2);
    packed[1] = ((slot >> 6) as u8) | ((((pbn >> 32) & 0x0f) as u8) << 4);
    packed[2..6].copy_from_slice(&((pbn & 0xffff_ffff) as u32).to_le_bytes());
    packed[6..11].copy_from_slice(&pack_block_map_entry(entry.mapping));
    packed
}

/// Unpack an 11-byte recovery journal entry.
#[must_use]
pub fn unpack_recovery_journal_entry(
    packed: &[u8; RECOVERY_JOURNAL_ENTRY_SIZE],
) -> RecoveryJournalEntry {
    let operation = JournalOperation::from_bits(packed[0]);
    let slot = u16::from(packed[0] >> 2) | (u16::from(packed[1] & 0x0f) << 6);
    let high = u64::from(packed[1] >> 4);
    let low = u64::from(u32::from_le_bytes([packed[2], packed[3], packed[4], packed[5]]));
    let mut entry_bytes = [0u8; BLOCK_MAP_ENTRY_SIZE];
    entry_bytes.copy_from_slice(&packed[6..11]);
    RecoveryJournalEntry {
        operation,
        slot: BlockMapSlot {
            pbn: Pbn((high << 32) | low),
            slot,
        },
        mapping: unpack_block_map_entry(&entry_bytes),
    }
}

/// A 16-byte content fingerprint of one 4 KiB block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkName(pub [u8; CHUNK_NAME_SIZE]);

impl ChunkName {
    /// Route this name to one of `zone_count` hash/index zones by its low
    /// bits. `zone_count` must be nonzero.
    #[must_use]
    pub fn select_zone(&self, zone_count: usize) -> usize {
        let low = u16::from_le_bytes([self.0[0], self.0[1]]);
        usize::from(low) % zone_count
    }

    /// Derive the open-chapter hash-table slot for this name, for a
    /// power-of-two `slot_count`.
    #[must_use]
    pub fn hash_slot(&self, slot_count: usize) -> usize {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[8..16]);
        (u64::from_le_bytes(bytes) as usize) & (slot_count - 1)
    }
}

impl fmt::Debug for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkName(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Check that a buffer is exactly one block of zeros.
#[must_use]
pub fn is_all_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_state_nibble_round_trip() {
        for nibble in 0u8..16 {
            let state = MappingState::from_nibble(nibble).unwrap();
            assert_eq!(state.to_nibble(), nibble);
        }
        assert_eq!(MappingState::from_nibble(2), Some(MappingState::Compressed(0)));
        assert_eq!(MappingState::from_nibble(15), Some(MappingState::Compressed(13)));
        assert!(MappingState::for_slot(13).is_ok());
        assert!(MappingState::for_slot(14).is_err());
    }

    #[test]
    fn block_map_entry_round_trip() {
        let cases = [
            DataLocation::UNMAPPED,
            DataLocation::ZERO,
            DataLocation::new(Pbn(1), MappingState::Uncompressed),
            DataLocation::new(Pbn(MAX_BLOCK_MAP_PBN), MappingState::Uncompressed),
            DataLocation::new(Pbn(0x0_1234_5678), MappingState::Compressed(13)),
        ];
        for location in cases {
            let packed = pack_block_map_entry(location);
            assert_eq!(unpack_block_map_entry(&packed), location, "{location:?}");
        }
    }

    #[test]
    fn journal_point_pack_is_identity() {
        let cases = [
            JournalPoint::new(1, 0),
            JournalPoint::new(1, 310),
            JournalPoint::new(0xffff_ffff_ffff, 0xffff),
            JournalPoint::new(12345, 42),
        ];
        for point in cases {
            assert_eq!(unpack_journal_point(&pack_journal_point(point)), point);
        }
    }

    #[test]
    fn journal_point_ordering_is_strict() {
        let p = JournalPoint::new(3, 7);
        let same_seq_later = JournalPoint::new(3, 8);
        let later_seq = JournalPoint::new(4, 0);
        assert!(p.before(same_seq_later));
        assert!(p.before(later_seq));
        assert!(same_seq_later.before(later_seq));
        assert!(!p.before(p));
    }

    #[test]
    fn journal_point_advance_rolls_over() {
        let mut point = JournalPoint::new(5, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK - 1);
        point.advance(RECOVERY_JOURNAL_ENTRIES_PER_BLOCK);
        assert_eq!(point, JournalPoint::new(6, 0));
    }

    #[test]
    fn recovery_journal_entry_round_trip() {
        let entry = RecoveryJournalEntry {
            operation: JournalOperation::DataIncrement,
            slot: BlockMapSlot {
                pbn: Pbn(0xf_8765_4321),
                slot: 0x3ff,
            },
            mapping: DataLocation::new(Pbn(0xa_5a5a_5a5a), MappingState::Compressed(5)),
        };
        let packed = pack_recovery_journal_entry(&entry);
        assert_eq!(unpack_recovery_journal_entry(&packed), entry);

        let decrement = RecoveryJournalEntry {
            operation: JournalOperation::BlockMapDecrement,
            slot: BlockMapSlot {
                pbn: Pbn(12),
                slot: 0,
            },
            mapping: DataLocation::UNMAPPED,
        };
        let packed = pack_recovery_journal_entry(&decrement);
        assert_eq!(unpack_recovery_journal_entry(&packed), decrement);
    }

    #[test]
    fn chunk_name_zone_routing_is_stable() {
        let name = ChunkName([7; CHUNK_NAME_SIZE]);
        assert_eq!(name.select_zone(1), 0);
        let zone = name.select_zone(4);
        assert!(zone < 4);
        assert_eq!(zone, name.select_zone(4));
    }

    #[test]
    fn zero_detection() {
        assert!(is_all_zero(&[0u8; BLOCK_SIZE]));
        let mut data = vec![0u8; BLOCK_SIZE];
        data[4095] = 1;
        assert!(!is_all_zero(&data));
        assert!(DataLocation::ZERO.is_zero_block());
        assert!(!DataLocation::UNMAPPED.is_zero_block());
    }
}

//! Per-slab reference counters.
//!
//! Each data block in a slab has one 8-bit counter: `0` free, `1..=253` an
//! exact count, `254` a provisional reference held during allocation, `255`
//! shared ("too many to count" — saturating and non-decreasing once
//! reached). The four classes are modeled as a sum type with an explicit
//! codec rather than raw integers.

use vopt_error::{Result, VoptError};
use vopt_types::{
    JournalOperation, JournalPoint, SlabBlockNumber, EMPTY_REFERENCE_COUNT,
    MAXIMUM_REFERENCE_COUNT, PROVISIONAL_REFERENCE_COUNT, SHARED_REFERENCE_COUNT,
};

/// The decoded state of one reference counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefStatus {
    Free,
    Provisional,
    Count(u8),
    Shared,
}

impl RefStatus {
    /// Decode the 8-bit on-disk value.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            EMPTY_REFERENCE_COUNT => Self::Free,
            PROVISIONAL_REFERENCE_COUNT => Self::Provisional,
            SHARED_REFERENCE_COUNT => Self::Shared,
            count => Self::Count(count),
        }
    }

    /// Encode to the 8-bit on-disk value.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Free => EMPTY_REFERENCE_COUNT,
            Self::Provisional => PROVISIONAL_REFERENCE_COUNT,
            Self::Shared => SHARED_REFERENCE_COUNT,
            Self::Count(count) => count,
        }
    }

    /// Whether any reference (provisional included) is held.
    #[must_use]
    pub fn is_referenced(self) -> bool {
        self != Self::Free
    }
}

/// The reference counter array of one slab.
#[derive(Debug, Clone)]
pub struct RefCounts {
    counters: Vec<u8>,
    free_blocks: u64,
    /// The last slab journal point applied; replays at or before this are
    /// skipped, making replay idempotent.
    slab_journal_point: JournalPoint,
}

impl RefCounts {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            counters: vec![EMPTY_REFERENCE_COUNT; block_count as usize],
            free_blocks: block_count,
            slab_journal_point: JournalPoint::default(),
        }
    }

    /// Rebuild from a persisted counter array.
    pub fn from_bytes(counters: Vec<u8>, slab_journal_point: JournalPoint) -> Self {
        let free_blocks = counters
            .iter()
            .filter(|&&c| c == EMPTY_REFERENCE_COUNT)
            .count() as u64;
        Self {
            counters,
            free_blocks,
            slab_journal_point,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.counters
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.counters.len() as u64
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    #[must_use]
    pub fn slab_journal_point(&self) -> JournalPoint {
        self.slab_journal_point
    }

    pub fn status(&self, sbn: SlabBlockNumber) -> Result<RefStatus> {
        let byte = self
            .counters
            .get(sbn.0 as usize)
            .ok_or_else(|| VoptError::InvalidArgument(format!("sbn {} out of slab", sbn.0)))?;
        Ok(RefStatus::from_byte(*byte))
    }

    fn set(&mut self, sbn: SlabBlockNumber, status: RefStatus) {
        let old = RefStatus::from_byte(self.counters[sbn.0 as usize]);
        match (old, status) {
            (RefStatus::Free, RefStatus::Free) => {}
            (RefStatus::Free, _) => self.free_blocks -= 1,
            (_, RefStatus::Free) => self.free_blocks += 1,
            _ => {}
        }
        self.counters[sbn.0 as usize] = status.to_byte();
    }

    /// Reserve a free block during allocation.
    pub fn provisionally_reference(&mut self, sbn: SlabBlockNumber) -> Result<()> {
        match self.status(sbn)? {
            RefStatus::Free => {
                self.set(sbn, RefStatus::Provisional);
                Ok(())
            }
            other => Err(VoptError::BadState(format!(
                "provisional reference on {other:?} block {}",
                sbn.0
            ))),
        }
    }

    /// Drop a provisional reference that never committed.
    pub fn release_provisional(&mut self, sbn: SlabBlockNumber) -> Result<()> {
        match self.status(sbn)? {
            RefStatus::Provisional => {
                self.set(sbn, RefStatus::Free);
                Ok(())
            }
            other => Err(VoptError::BadState(format!(
                "releasing non-provisional {other:?} block {}",
                sbn.0
            ))),
        }
    }

    /// Apply one journal operation to a counter.
    pub fn adjust(&mut self, sbn: SlabBlockNumber, operation: JournalOperation) -> Result<RefStatus> {
        let old = self.status(sbn)?;
        let new = match (operation, old) {
            // A provisional reference commits to an exact count of one; a
            // fresh dedupe increment on a free block (replay) does the same.
            (JournalOperation::DataIncrement, RefStatus::Free | RefStatus::Provisional) => {
                RefStatus::Count(1)
            }
            (JournalOperation::DataIncrement, RefStatus::Count(MAXIMUM_REFERENCE_COUNT)) => {
                RefStatus::Shared
            }
            (JournalOperation::DataIncrement, RefStatus::Count(count)) => {
                RefStatus::Count(count + 1)
            }
            (JournalOperation::DataIncrement | JournalOperation::DataDecrement, RefStatus::Shared) => {
                RefStatus::Shared
            }
            (JournalOperation::DataDecrement, RefStatus::Count(1)) => RefStatus::Free,
            (JournalOperation::DataDecrement, RefStatus::Count(count)) => {
                RefStatus::Count(count - 1)
            }
            (JournalOperation::DataDecrement, RefStatus::Provisional) => RefStatus::Free,
            (JournalOperation::DataDecrement, RefStatus::Free) => {
                return Err(VoptError::BadState(format!(
                    "decrement of free block {}",
                    sbn.0
                )));
            }
            // Tree pages hold exactly one reference.
            (JournalOperation::BlockMapIncrement, RefStatus::Free | RefStatus::Provisional) => {
                RefStatus::Count(1)
            }
            (JournalOperation::BlockMapIncrement, other) => {
                return Err(VoptError::BadState(format!(
                    "block map increment of {other:?} block {}",
                    sbn.0
                )));
            }
            (JournalOperation::BlockMapDecrement, RefStatus::Count(1)) => RefStatus::Free,
            (JournalOperation::BlockMapDecrement, other) => {
                return Err(VoptError::BadState(format!(
                    "block map decrement of {other:?} block {}",
                    sbn.0
                )));
            }
        };
        self.set(sbn, new);
        Ok(new)
    }

    /// Apply a journalled change if it has not been applied yet. Entries at
    /// or before the last applied point are skipped, so replaying the same
    /// range twice is a no-op.
    pub fn replay_reference_count_change(
        &mut self,
        point: JournalPoint,
        sbn: SlabBlockNumber,
        operation: JournalOperation,
    ) -> Result<bool> {
        if point <= self.slab_journal_point {
            return Ok(false);
        }
        self.adjust(sbn, operation)?;
        self.slab_journal_point = point;
        Ok(true)
    }

    /// Record that runtime application has caught up to `point`.
    pub fn advance_journal_point(&mut self, point: JournalPoint) {
        if self.slab_journal_point < point {
            self.slab_journal_point = point;
        }
    }

    /// Find a free block at or after `hint`, wrapping once.
    #[must_use]
    pub fn find_free_block(&self, hint: SlabBlockNumber) -> Option<SlabBlockNumber> {
        let len = self.counters.len();
        if len == 0 || self.free_blocks == 0 {
            return None;
        }
        let start = (hint.0 as usize).min(len - 1);
        (start..len)
            .chain(0..start)
            .find(|&i| self.counters[i] == EMPTY_REFERENCE_COUNT)
            .map(|i| SlabBlockNumber(i as u32))
    }
}

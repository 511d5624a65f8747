#![forbid(unsafe_code)]
//! Recovery journal for VOpt: a circular, sequenced write-ahead log of
//! logical-to-physical mapping changes. Every mutation of the block map or
//! of reference counts is admitted here first; per-sequence lock counts tie
//! reaping to block map writeback and slab journal durability.

pub mod format;
pub mod journal;
pub mod recovery;

pub use format::{
    compute_check_byte, pack_block, unpack_block_entries, unpack_block_header, BlockHeader,
    BLOCK_HEADER_SIZE,
};
pub use journal::{JournalConfig, JournalLock, JournalStats, RecoveryJournal};
pub use recovery::{
    find_head_and_tail, load_journal_region, replay, validate_entry, EntryBounds, HeadAndTail,
    ReplayStats,
};

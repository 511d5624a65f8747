#![forbid(unsafe_code)]
//! Slab depot for VOpt: reference counts, per-slab journals, the slab
//! summary, zone-partitioned block allocation, and post-crash scrubbing.

pub mod depot;
pub mod ref_counts;
pub mod scrubber;
pub mod slab_journal;
pub mod summary;

pub use depot::{DepotConfig, DepotStats, Slab, SlabDepot, SlabState};
pub use ref_counts::{RefCounts, RefStatus};
pub use scrubber::{ScrubberState, SlabScrubber};
pub use slab_journal::{
    scan_region, SlabJournal, SlabJournalBlockHeader, SlabJournalConfig, SlabJournalEntry,
    SLAB_JOURNAL_ENTRIES_PER_BLOCK, SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK,
};
pub use summary::{compute_fullness_hint, SlabSummary, SlabSummaryEntry};

//! Index geometry: how fingerprint records are divided into chapters,
//! zones, and on-disk pages.

use vopt_error::{Result, VoptError};
use vopt_types::{ChunkName, BLOCK_SIZE, CHUNK_NAME_SIZE};

/// Bytes per record page entry: the chunk name plus packed advice, padded.
pub const RECORD_SIZE: usize = CHUNK_NAME_SIZE + 8;

/// Records per on-disk record page.
pub const RECORDS_PER_PAGE: usize = BLOCK_SIZE / RECORD_SIZE;

/// The shape of the index, fixed at format time.
#[derive(Debug, Clone, Copy)]
pub struct IndexGeometry {
    /// Records buffered across all zones before a chapter closes.
    pub records_per_chapter: u32,
    /// Chapters in the volume ring.
    pub chapters: u64,
    /// The oldest chapters of the ring keep only cached access (records
    /// evicted from memory, read back on demand).
    pub sparse_chapters: u64,
    pub zone_count: u32,
    /// Hash table slots per record, rounded up to a power of two.
    pub open_chapter_load_ratio: u32,
}

impl IndexGeometry {
    pub fn validate(&self) -> Result<()> {
        if self.zone_count == 0 {
            return Err(VoptError::BadConfiguration(
                "index zone count must be nonzero".to_owned(),
            ));
        }
        if self.open_chapter_load_ratio <= 1 {
            return Err(VoptError::BadConfiguration(
                "open chapter hash table is too small".to_owned(),
            ));
        }
        if self.records_per_chapter < self.zone_count {
            return Err(VoptError::InvalidArgument(format!(
                "zone count {} larger than records per chapter {}",
                self.zone_count, self.records_per_chapter
            )));
        }
        if self.chapters == 0 || self.sparse_chapters >= self.chapters {
            return Err(VoptError::BadConfiguration(format!(
                "{} sparse of {} chapters",
                self.sparse_chapters, self.chapters
            )));
        }
        Ok(())
    }

    /// Open-chapter capacity of one zone's shard.
    #[must_use]
    pub fn zone_capacity(&self) -> u32 {
        self.records_per_chapter / self.zone_count
    }

    /// Record pages per chapter on disk.
    #[must_use]
    pub fn pages_per_chapter(&self) -> u64 {
        u64::from(self.records_per_chapter).div_ceil(RECORDS_PER_PAGE as u64)
    }

    /// The ring slot a virtual chapter occupies.
    #[must_use]
    pub fn physical_chapter(&self, virtual_chapter: u64) -> u64 {
        virtual_chapter % self.chapters
    }

    /// Route a name to its index zone by the fingerprint's low bits.
    #[must_use]
    pub fn zone_for(&self, name: &ChunkName) -> usize {
        name.select_zone(self.zone_count as usize)
    }

    /// Whether `virtual_chapter` falls in the sparse tail of the ring,
    /// given the newest closed chapter.
    #[must_use]
    pub fn is_sparse(&self, virtual_chapter: u64, newest_closed: u64) -> bool {
        newest_closed.saturating_sub(virtual_chapter) >= self.chapters - self.sparse_chapters
    }

    /// Oldest virtual chapter still in the ring once `newest_closed` has
    /// been written.
    #[must_use]
    pub fn oldest_retained(&self, newest_closed: u64) -> u64 {
        (newest_closed + 1).saturating_sub(self.chapters)
    }
}

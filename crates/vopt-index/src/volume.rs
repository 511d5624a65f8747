//! The chapter volume: closed chapters on disk.
//!
//! A closed chapter is its records sorted by name and packed into record
//! pages at the chapter's ring slot. Recent chapters are *dense* — searched
//! by reading their pages directly. The oldest chapters are *sparse* —
//! searched only through the shared chapter cache, which is populated under
//! a cross-zone barrier so every zone agrees on cache contents.

use crate::geometry::{IndexGeometry, RECORDS_PER_PAGE, RECORD_SIZE};
use crate::open_chapter::OpenChapterRecord;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};
use vopt_block::{BlockIo, IoPriority};
use vopt_error::{Result, VoptError};
use vopt_types::{
    pack_block_map_entry, unpack_block_map_entry, ChunkName, DataLocation, Pbn, BLOCK_SIZE,
    BLOCK_MAP_ENTRY_SIZE, CHUNK_NAME_SIZE,
};

/// Classification of a chapter cache / page probe, for hit-rate telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheProbeType {
    IndexFirst,
    IndexRetry,
    RecordFirst,
    RecordRetry,
}

/// Classify a probe: first attempt or post-requeue retry, index page or
/// record page.
#[must_use]
pub fn cache_probe_type(requeued: bool, is_index_page: bool) -> CacheProbeType {
    match (requeued, is_index_page) {
        (true, true) => CacheProbeType::IndexRetry,
        (true, false) => CacheProbeType::RecordRetry,
        (false, true) => CacheProbeType::IndexFirst,
        (false, false) => CacheProbeType::RecordFirst,
    }
}

/// Probe counters by classification.
#[derive(Debug, Default, Clone, Copy)]
pub struct VolumeStats {
    pub index_first: u64,
    pub index_retry: u64,
    pub record_first: u64,
    pub record_retry: u64,
    pub chapters_written: u64,
    pub cache_fills: u64,
}

impl VolumeStats {
    fn count(&mut self, probe: CacheProbeType) {
        match probe {
            CacheProbeType::IndexFirst => self.index_first += 1,
            CacheProbeType::IndexRetry => self.index_retry += 1,
            CacheProbeType::RecordFirst => self.record_first += 1,
            CacheProbeType::RecordRetry => self.record_retry += 1,
        }
    }
}

/// Outcome of a volume search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(DataLocation),
    NotFound,
    /// The chapter is sparse and not cached; the caller must fence a cache
    /// fill across all zones, then requeue.
    NeedsCacheBarrier(u64),
}

/// Bounded cache of sparse chapters' records.
struct ChapterCache {
    chapters: HashMap<u64, Arc<Vec<OpenChapterRecord>>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl ChapterCache {
    fn new(capacity: usize) -> Self {
        Self {
            chapters: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, virtual_chapter: u64) -> Option<&Arc<Vec<OpenChapterRecord>>> {
        self.chapters.get(&virtual_chapter)
    }

    fn insert(&mut self, virtual_chapter: u64, records: Arc<Vec<OpenChapterRecord>>) {
        if self.chapters.contains_key(&virtual_chapter) {
            return;
        }
        while self.chapters.len() >= self.capacity {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.chapters.remove(&evicted);
        }
        self.chapters.insert(virtual_chapter, records);
        self.order.push_back(virtual_chapter);
    }

    fn forget(&mut self, virtual_chapter: u64) {
        self.chapters.remove(&virtual_chapter);
        self.order.retain(|&v| v != virtual_chapter);
    }
}

/// The on-disk chapter ring plus the sparse chapter cache.
pub struct Volume {
    geometry: IndexGeometry,
    origin: Pbn,
    device: Arc<dyn BlockIo>,
    /// Newest closed chapter, if any chapter has ever closed.
    newest_closed: Option<u64>,
    cache: ChapterCache,
    stats: VolumeStats,
}

const CACHED_SPARSE_CHAPTERS: usize = 4;

impl Volume {
    pub fn new(geometry: IndexGeometry, origin: Pbn, device: Arc<dyn BlockIo>) -> Self {
        Self {
            geometry,
            origin,
            device,
            newest_closed: None,
            cache: ChapterCache::new(CACHED_SPARSE_CHAPTERS),
            stats: VolumeStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        self.stats
    }

    #[must_use]
    pub fn newest_closed(&self) -> Option<u64> {
        self.newest_closed
    }

    /// Adopt the newest-closed chapter recorded by a saved device, so a
    /// reloaded index keeps answering from its on-disk chapters.
    pub fn restore_newest_closed(&mut self, newest: u64) {
        self.newest_closed = Some(newest);
    }

    /// Blocks the volume region occupies.
    #[must_use]
    pub fn region_blocks(geometry: &IndexGeometry) -> u64 {
        geometry.chapters * geometry.pages_per_chapter()
    }

    fn page_pbn(&self, virtual_chapter: u64, page: u64) -> Pbn {
        let physical = self.geometry.physical_chapter(virtual_chapter);
        Pbn(self.origin.0 + physical * self.geometry.pages_per_chapter() + page)
    }

    /// Write a closed chapter's records, hash-ordered, to its ring slot.
    /// The chapter previously occupying the slot is forgotten.
    pub fn write_chapter(
        &mut self,
        virtual_chapter: u64,
        mut records: Vec<OpenChapterRecord>,
    ) -> Result<()> {
        records.sort_by(|a, b| a.name.0.cmp(&b.name.0));
        if records.len() > self.geometry.records_per_chapter as usize {
            return Err(VoptError::VolumeOverflow);
        }
        let pages = self.geometry.pages_per_chapter();
        for page in 0..pages {
            let mut block = vec![0u8; BLOCK_SIZE];
            let base = page as usize * RECORDS_PER_PAGE;
            let in_page = records.len().saturating_sub(base).min(RECORDS_PER_PAGE);
            block[0..2].copy_from_slice(&(in_page as u16).to_le_bytes());
            for (i, record) in records[base..base + in_page].iter().enumerate() {
                let offset = 4 + i * RECORD_SIZE;
                block[offset..offset + CHUNK_NAME_SIZE].copy_from_slice(&record.name.0);
                block[offset + CHUNK_NAME_SIZE..offset + CHUNK_NAME_SIZE + BLOCK_MAP_ENTRY_SIZE]
                    .copy_from_slice(&pack_block_map_entry(record.advice));
            }
            self.device.write_block(
                IoPriority::Metadata,
                self.page_pbn(virtual_chapter, page),
                &block,
            )?;
        }
        // The slot's previous occupant (one full ring ago) is gone now.
        if virtual_chapter >= self.geometry.chapters {
            self.cache.forget(virtual_chapter - self.geometry.chapters);
        }
        self.newest_closed = Some(self.newest_closed.map_or(virtual_chapter, |n| n.max(virtual_chapter)));
        self.stats.chapters_written += 1;
        debug!(
            target: "vopt::index::volume",
            event = "chapter_written",
            virtual_chapter,
            records = records.len(),
        );
        Ok(())
    }

    fn read_chapter_records(&mut self, virtual_chapter: u64) -> Result<Vec<OpenChapterRecord>> {
        let pages = self.geometry.pages_per_chapter();
        let mut records = Vec::new();
        for page in 0..pages {
            let block = self
                .device
                .read_block(IoPriority::Metadata, self.page_pbn(virtual_chapter, page))?;
            let count = usize::from(u16::from_le_bytes([block[0], block[1]]));
            for i in 0..count.min(RECORDS_PER_PAGE) {
                let offset = 4 + i * RECORD_SIZE;
                let mut name = [0u8; CHUNK_NAME_SIZE];
                name.copy_from_slice(&block[offset..offset + CHUNK_NAME_SIZE]);
                let mut packed = [0u8; BLOCK_MAP_ENTRY_SIZE];
                packed.copy_from_slice(
                    &block[offset + CHUNK_NAME_SIZE..offset + CHUNK_NAME_SIZE + BLOCK_MAP_ENTRY_SIZE],
                );
                records.push(OpenChapterRecord {
                    name: ChunkName(name),
                    advice: unpack_block_map_entry(&packed),
                });
            }
        }
        Ok(records)
    }

    fn search_records(records: &[OpenChapterRecord], name: &ChunkName) -> Option<DataLocation> {
        records
            .binary_search_by(|record| record.name.0.cmp(&name.0))
            .ok()
            .map(|i| records[i].advice)
    }

    /// Whether `virtual_chapter` is still in the ring.
    #[must_use]
    pub fn is_retained(&self, virtual_chapter: u64) -> bool {
        match self.newest_closed {
            Some(newest) => {
                virtual_chapter <= newest
                    && virtual_chapter >= self.geometry.oldest_retained(newest)
            }
            None => false,
        }
    }

    /// Search one closed chapter.
    pub fn search_chapter(
        &mut self,
        virtual_chapter: u64,
        name: &ChunkName,
        requeued: bool,
    ) -> Result<SearchOutcome> {
        let Some(newest) = self.newest_closed else {
            return Ok(SearchOutcome::NotFound);
        };
        if !self.is_retained(virtual_chapter) {
            return Ok(SearchOutcome::NotFound);
        }
        if self.geometry.is_sparse(virtual_chapter, newest) {
            self.stats.count(cache_probe_type(requeued, true));
            if let Some(records) = self.cache.get(virtual_chapter) {
                let records = records.clone();
                return Ok(Self::search_records(&records, name)
                    .map_or(SearchOutcome::NotFound, SearchOutcome::Found));
            }
            return Ok(SearchOutcome::NeedsCacheBarrier(virtual_chapter));
        }
        self.stats.count(cache_probe_type(requeued, false));
        let records = self.read_chapter_records(virtual_chapter)?;
        Ok(Self::search_records(&records, name)
            .map_or(SearchOutcome::NotFound, SearchOutcome::Found))
    }

    /// Search every retained closed chapter, newest first.
    pub fn search(&mut self, name: &ChunkName, requeued: bool) -> Result<SearchOutcome> {
        let Some(newest) = self.newest_closed else {
            return Ok(SearchOutcome::NotFound);
        };
        let oldest = self.geometry.oldest_retained(newest);
        let mut chapter = newest;
        loop {
            match self.search_chapter(chapter, name, requeued)? {
                SearchOutcome::NotFound => {}
                outcome => return Ok(outcome),
            }
            if chapter == oldest {
                return Ok(SearchOutcome::NotFound);
            }
            chapter -= 1;
        }
    }

    /// Load a sparse chapter into the cache. Runs only once every zone has
    /// fenced at the sparse-cache barrier.
    pub fn cache_sparse_chapter(&mut self, virtual_chapter: u64) -> Result<()> {
        if self.cache.get(virtual_chapter).is_some() {
            return Ok(());
        }
        let records = self.read_chapter_records(virtual_chapter)?;
        trace!(
            target: "vopt::index::volume",
            event = "sparse_chapter_cached",
            virtual_chapter,
            records = records.len(),
        );
        self.cache.insert(virtual_chapter, Arc::new(records));
        self.stats.cache_fills += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vopt_block::RamDevice;
    use vopt_types::MappingState;

    fn geometry() -> IndexGeometry {
        IndexGeometry {
            records_per_chapter: 8,
            chapters: 4,
            sparse_chapters: 1,
            zone_count: 2,
            open_chapter_load_ratio: 4,
        }
    }

    fn name(seed: u8) -> ChunkName {
        let mut bytes = [0u8; CHUNK_NAME_SIZE];
        bytes[0] = seed;
        bytes[9] = seed.wrapping_mul(7);
        ChunkName(bytes)
    }

    fn record(seed: u8) -> OpenChapterRecord {
        OpenChapterRecord {
            name: name(seed),
            advice: DataLocation::new(Pbn(u64::from(seed) + 100), MappingState::Uncompressed),
        }
    }

    fn volume() -> Volume {
        let device: Arc<dyn BlockIo> = RamDevice::new(1024);
        Volume::new(geometry(), Pbn(16), device)
    }

    #[test]
    fn chapter_round_trips_sorted() {
        let mut volume = volume();
        volume
            .write_chapter(0, vec![record(9), record(3), record(5)])
            .unwrap();
        match volume.search(&name(5), false).unwrap() {
            SearchOutcome::Found(advice) => assert_eq!(advice.pbn, Pbn(105)),
            other => panic!("expected found, got {other:?}"),
        }
        assert_eq!(volume.search(&name(4), false).unwrap(), SearchOutcome::NotFound);
    }

    #[test]
    fn newest_chapter_wins_the_search() {
        let mut volume = volume();
        volume.write_chapter(0, vec![record(1)]).unwrap();
        let newer = OpenChapterRecord {
            name: name(1),
            advice: DataLocation::new(Pbn(999), MappingState::Uncompressed),
        };
        volume.write_chapter(1, vec![newer]).unwrap();
        match volume.search(&name(1), false).unwrap() {
            SearchOutcome::Found(advice) => assert_eq!(advice.pbn, Pbn(999)),
            other => panic!("expected newest advice, got {other:?}"),
        }
    }

    #[test]
    fn sparse_chapters_demand_the_barrier_then_hit_cache() {
        let mut volume = volume();
        // With 4 chapters (1 sparse), once chapter 3 closes chapter 0 is
        // sparse.
        for chapter in 0..4u64 {
            volume
                .write_chapter(chapter, vec![record(chapter as u8 + 1)])
                .unwrap();
        }
        assert_eq!(
            volume.search_chapter(0, &name(1), false).unwrap(),
            SearchOutcome::NeedsCacheBarrier(0)
        );
        volume.cache_sparse_chapter(0).unwrap();
        match volume.search_chapter(0, &name(1), true).unwrap() {
            SearchOutcome::Found(advice) => assert_eq!(advice.pbn, Pbn(101)),
            other => panic!("expected cached hit, got {other:?}"),
        }
        let stats = volume.stats();
        assert_eq!(stats.index_first, 1);
        assert_eq!(stats.index_retry, 1);
        assert_eq!(stats.cache_fills, 1);
    }

    #[test]
    fn ring_wrap_forgets_the_oldest_chapter() {
        let mut volume = volume();
        for chapter in 0..5u64 {
            volume
                .write_chapter(chapter, vec![record(chapter as u8 + 1)])
                .unwrap();
        }
        // Chapter 0's slot was overwritten by chapter 4.
        assert!(!volume.is_retained(0));
        assert_eq!(volume.search_chapter(0, &name(1), false).unwrap(), SearchOutcome::NotFound);
        assert!(volume.is_retained(4));
    }

    #[test]
    fn probe_classification() {
        assert_eq!(cache_probe_type(false, true), CacheProbeType::IndexFirst);
        assert_eq!(cache_probe_type(true, true), CacheProbeType::IndexRetry);
        assert_eq!(cache_probe_type(false, false), CacheProbeType::RecordFirst);
        assert_eq!(cache_probe_type(true, false), CacheProbeType::RecordRetry);
    }
}

//! Per-zone tree page cache with era-based writeback.
//!
//! Each logical zone owns one cache; all access is `&mut self`. A page
//! dirtied while clean records the era (recovery journal sequence) of its
//! first dirtying and keeps it until written back, so the oldest dirty era
//! bounds how far the recovery journal head may advance.
//!
//! The storage provider completes reads and writes before returning, so the
//! `incoming` and `outgoing` page states are transient within a single call
//! and a missing-page reader is never left suspended; the dirty-era
//! bookkeeping and bounded residency are the load-bearing parts here.

use crate::page::TreePage;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};
use vopt_block::{BlockIo, IoPriority};
use vopt_error::Result;
use vopt_types::{Pbn, SequenceNumber};

/// Lifecycle state of a cached page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Incoming,
    Resident,
    Dirty,
    Outgoing,
}

#[derive(Debug)]
struct CachedPage {
    page: TreePage,
    state: PageState,
    /// Era of first dirtying; meaningful only while state is `Dirty`.
    era: SequenceNumber,
    last_use: u64,
}

/// Counters exposed through the stats interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub forced_writebacks: u64,
    pub pages_written: u64,
}

/// A bounded cache of tree pages.
pub struct PageCache {
    device: Arc<dyn BlockIo>,
    nonce: u64,
    capacity: usize,
    pages: HashMap<u64, CachedPage>,
    dirty_by_era: BTreeMap<SequenceNumber, HashSet<u64>>,
    clock: u64,
    stats: CacheStats,
}

impl PageCache {
    pub fn new(device: Arc<dyn BlockIo>, nonce: u64, capacity: usize) -> Self {
        Self {
            device,
            nonce,
            capacity: capacity.max(1),
            pages: HashMap::new(),
            dirty_by_era: BTreeMap::new(),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty_by_era.values().map(HashSet::len).sum()
    }

    /// Era of the oldest dirty page, if any. The recovery journal head may
    /// not pass this.
    #[must_use]
    pub fn oldest_dirty_era(&self) -> Option<SequenceNumber> {
        self.dirty_by_era.keys().next().copied()
    }

    /// Every era with at least one dirty page, ascending. The journal
    /// holds one block-map lock per era listed here.
    #[must_use]
    pub fn dirty_eras(&self) -> Vec<SequenceNumber> {
        self.dirty_by_era.keys().copied().collect()
    }

    fn touch(clock: &mut u64, cached: &mut CachedPage) {
        *clock += 1;
        cached.last_use = *clock;
    }

    fn load(&mut self, pbn: Pbn) -> Result<()> {
        if self.pages.contains_key(&pbn.0) {
            return Ok(());
        }
        self.make_room(1)?;
        self.stats.misses += 1;
        let raw = self.device.read_block(IoPriority::Metadata, pbn)?;
        let page = TreePage::from_block(pbn, self.nonce, raw)?;
        self.clock += 1;
        trace!(target: "vopt::map::cache", event = "page_load", pbn = pbn.0);
        self.pages.insert(
            pbn.0,
            CachedPage {
                page,
                state: PageState::Resident,
                era: 0,
                last_use: self.clock,
            },
        );
        Ok(())
    }

    /// Evict clean pages (oldest first) until `need` slots are free. When
    /// every resident page is dirty, the oldest dirty page is written back
    /// in place and evicted; the caller's journal lock for that era is
    /// released through `take_released`.
    fn make_room(&mut self, need: usize) -> Result<()> {
        while self.pages.len() + need > self.capacity {
            let clean_victim = self
                .pages
                .iter()
                .filter(|(_, c)| c.state == PageState::Resident)
                .min_by_key(|(_, c)| c.last_use)
                .map(|(&pbn, _)| pbn);
            let victim = match clean_victim {
                Some(pbn) => pbn,
                None => {
                    let dirty_victim = self
                        .pages
                        .iter()
                        .filter(|(_, c)| c.state == PageState::Dirty)
                        .min_by_key(|(_, c)| (c.era, c.last_use))
                        .map(|(&pbn, _)| pbn);
                    let Some(pbn) = dirty_victim else {
                        // Everything is in flight; nothing more to do.
                        return Ok(());
                    };
                    self.stats.forced_writebacks += 1;
                    self.write_back(Pbn(pbn))?;
                    pbn
                }
            };
            self.pages.remove(&victim);
            self.stats.evictions += 1;
            trace!(target: "vopt::map::cache", event = "page_evict", pbn = victim);
        }
        Ok(())
    }

    /// Read access to the page at `pbn`, loading it on a miss.
    pub fn page(&mut self, pbn: Pbn) -> Result<&TreePage> {
        if self.pages.contains_key(&pbn.0) {
            self.stats.hits += 1;
        }
        self.load(pbn)?;
        let cached = self.pages.get_mut(&pbn.0).expect("just loaded");
        Self::touch(&mut self.clock, cached);
        Ok(&cached.page)
    }

    /// Mutate the page at `pbn`, marking it dirty in `era`. A page already
    /// dirty keeps its original (older) era.
    pub fn update_page(
        &mut self,
        pbn: Pbn,
        era: SequenceNumber,
        mutate: impl FnOnce(&mut TreePage),
    ) -> Result<()> {
        if self.pages.contains_key(&pbn.0) {
            self.stats.hits += 1;
        }
        self.load(pbn)?;
        let cached = self.pages.get_mut(&pbn.0).expect("just loaded");
        Self::touch(&mut self.clock, cached);
        mutate(&mut cached.page);
        if cached.state != PageState::Dirty {
            cached.state = PageState::Dirty;
            cached.era = era;
            self.dirty_by_era.entry(era).or_default().insert(pbn.0);
        }
        Ok(())
    }

    /// Install a freshly created page (a newly allocated tree page),
    /// dirty in `era`.
    pub fn install_new_page(&mut self, page: TreePage, pbn: Pbn, era: SequenceNumber) -> Result<()> {
        self.make_room(1)?;
        self.clock += 1;
        match self.pages.entry(pbn.0) {
            Entry::Occupied(_) => {
                return Err(vopt_error::VoptError::BadState(format!(
                    "new tree page {pbn} already cached"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(CachedPage {
                    page,
                    state: PageState::Dirty,
                    era,
                    last_use: self.clock,
                });
            }
        }
        self.dirty_by_era.entry(era).or_default().insert(pbn.0);
        Ok(())
    }

    fn write_back(&mut self, pbn: Pbn) -> Result<()> {
        let cached = self.pages.get_mut(&pbn.0).expect("writeback of absent page");
        debug_assert_eq!(cached.state, PageState::Dirty);
        cached.state = PageState::Outgoing;
        let era = cached.era;
        let result = self
            .device
            .write_block(IoPriority::Metadata, pbn, cached.page.as_bytes());
        let cached = self.pages.get_mut(&pbn.0).expect("writeback of absent page");
        match result {
            Ok(()) => {
                cached.state = PageState::Resident;
                cached.era = 0;
                if let std::collections::btree_map::Entry::Occupied(mut eras) =
                    self.dirty_by_era.entry(era)
                {
                    eras.get_mut().remove(&pbn.0);
                    if eras.get().is_empty() {
                        eras.remove();
                    }
                }
                self.stats.pages_written += 1;
                Ok(())
            }
            Err(error) => {
                cached.state = PageState::Dirty;
                Err(error)
            }
        }
    }

    /// Write back every page dirtied in an era older than `cutoff`.
    /// Returns the eras whose last page was cleaned, so the caller can
    /// release the corresponding recovery journal locks.
    pub fn expire_before(&mut self, cutoff: SequenceNumber) -> Result<Vec<SequenceNumber>> {
        let expired: Vec<(SequenceNumber, Vec<u64>)> = self
            .dirty_by_era
            .range(..cutoff)
            .map(|(&era, pbns)| (era, pbns.iter().copied().collect()))
            .collect();
        let mut released = Vec::new();
        for (era, pbns) in expired {
            debug!(
                target: "vopt::map::cache",
                event = "era_writeback",
                era,
                pages = pbns.len()
            );
            for pbn in pbns {
                self.write_back(Pbn(pbn))?;
            }
            if !self.dirty_by_era.contains_key(&era) {
                released.push(era);
            }
        }
        Ok(released)
    }

    /// Write back every dirty page (drain / save).
    pub fn flush_all(&mut self) -> Result<Vec<SequenceNumber>> {
        self.expire_before(SequenceNumber::MAX)
    }
}

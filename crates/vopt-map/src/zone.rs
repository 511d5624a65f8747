//! One logical zone's view of the block map forest.
//!
//! The forest is `root_count` fixed-height trees. A logical block's page
//! index selects the tree by its low bits and the page within the tree by
//! its high bits, so consecutive leaves rotate across trees (and across the
//! logical zones that own them). Interior pages store child PBNs as mapped
//! entries; unmapped means "all descendants unmapped", and pages are
//! allocated only when a write descends through them.

use crate::cache::PageCache;
use crate::page::TreePage;
use std::sync::Arc;
use tracing::debug;
use vopt_block::BlockIo;
use vopt_error::{Result, VoptError};
use vopt_types::{
    BlockMapSlot, DataLocation, Lbn, MappingState, Pbn, SequenceNumber,
    BLOCK_MAP_ENTRIES_PER_PAGE,
};

/// Shape of the forest, fixed at format time.
#[derive(Debug, Clone, Copy)]
pub struct BlockMapGeometry {
    /// First block of the contiguous run of root pages (one per tree).
    pub root_origin: Pbn,
    pub root_count: u32,
    /// Tree height in levels; the root is level `height`, leaves level 1.
    pub height: u32,
    pub logical_blocks: u64,
    pub nonce: u64,
}

const EPP: u64 = BLOCK_MAP_ENTRIES_PER_PAGE as u64;

impl BlockMapGeometry {
    fn page_index(lbn: Lbn) -> u64 {
        lbn.0 / EPP
    }

    /// Which tree covers this LBN.
    #[must_use]
    pub fn tree_for(&self, lbn: Lbn) -> u32 {
        (Self::page_index(lbn) % u64::from(self.root_count)) as u32
    }

    /// Which logical zone owns this LBN: trees are distributed round-robin
    /// over the zones.
    #[must_use]
    pub fn zone_for(&self, lbn: Lbn, logical_zones: usize) -> usize {
        self.tree_for(lbn) as usize % logical_zones
    }

    fn leaf_index(&self, lbn: Lbn) -> u64 {
        Self::page_index(lbn) / u64::from(self.root_count)
    }

    fn leaf_slot(lbn: Lbn) -> u16 {
        (lbn.0 % EPP) as u16
    }

    #[must_use]
    pub fn root_pbn(&self, tree: u32) -> Pbn {
        Pbn(self.root_origin.0 + u64::from(tree))
    }

    /// Largest logical block count this geometry can address.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        EPP.saturating_pow(self.height) * u64::from(self.root_count)
    }
}

/// Minimum tree height able to address `logical_blocks` over `root_count`
/// trees.
#[must_use]
pub fn compute_height(logical_blocks: u64, root_count: u32) -> u32 {
    let leaf_pages = logical_blocks.div_ceil(EPP);
    let leaves_per_tree = leaf_pages.div_ceil(u64::from(root_count)).max(1);
    let mut height = 1;
    let mut coverage = 1u64;
    while coverage < leaves_per_tree {
        coverage = coverage.saturating_mul(EPP);
        height += 1;
    }
    height
}

/// A slight over-estimate of the forest's total page count, leaves
/// included, for sizing the block map partition.
#[must_use]
pub fn compute_forest_size(logical_blocks: u64, root_count: u32) -> u64 {
    let height = compute_height(logical_blocks, root_count);
    let leaf_pages = logical_blocks.div_ceil(EPP);
    let leaves_per_tree = leaf_pages.div_ceil(u64::from(root_count)).max(1);
    let mut total_per_tree = 0u64;
    let mut level_pages = leaves_per_tree;
    for _ in 0..height {
        total_per_tree += level_pages;
        level_pages = level_pages.div_ceil(EPP);
    }
    // One extra page per tree of slack for interior rounding.
    (total_per_tree + 1) * u64::from(root_count)
}

/// Supplies physical blocks for new tree pages. Implemented by the glue
/// that journals the allocation and takes the block-map-write lock.
pub trait TreePageAllocator {
    fn allocate_tree_page(&mut self) -> Result<Pbn>;
}

/// Record of a tree page allocated during a descent, for journaling.
#[derive(Debug, Clone, Copy)]
pub struct AllocatedTreePage {
    /// The interior slot now pointing at the new page.
    pub parent: BlockMapSlot,
    pub pbn: Pbn,
}

/// The block map state owned by one logical zone.
pub struct BlockMapZone {
    geometry: BlockMapGeometry,
    cache: PageCache,
}

impl BlockMapZone {
    pub fn new(device: Arc<dyn BlockIo>, geometry: BlockMapGeometry, cache_pages: usize) -> Self {
        let cache = PageCache::new(device, geometry.nonce, cache_pages);
        Self { geometry, cache }
    }

    #[must_use]
    pub fn geometry(&self) -> &BlockMapGeometry {
        &self.geometry
    }

    pub fn cache(&mut self) -> &mut PageCache {
        &mut self.cache
    }

    fn check_bounds(&self, lbn: Lbn) -> Result<()> {
        if lbn.0 >= self.geometry.logical_blocks {
            return Err(VoptError::InvalidArgument(format!(
                "{lbn} beyond logical size {}",
                self.geometry.logical_blocks
            )));
        }
        Ok(())
    }

    /// Walk from the root to the leaf covering `lbn`.
    ///
    /// Without an allocator, an unmapped interior entry short-circuits to
    /// `None`. With one, missing pages are allocated, installed dirty in
    /// `era`, and reported through `new_pages` so the caller can journal
    /// the block-map increments.
    pub fn resolve_slot(
        &mut self,
        lbn: Lbn,
        era: SequenceNumber,
        mut allocator: Option<&mut dyn TreePageAllocator>,
        new_pages: &mut Vec<AllocatedTreePage>,
    ) -> Result<Option<BlockMapSlot>> {
        self.check_bounds(lbn)?;
        let tree = self.geometry.tree_for(lbn);
        let leaf_index = self.geometry.leaf_index(lbn);
        let mut page_pbn = self.geometry.root_pbn(tree);
        for level in (2..=self.geometry.height).rev() {
            let divisor = EPP.pow(level - 2);
            let child_slot = ((leaf_index / divisor) % EPP) as usize;
            let entry = self.cache.page(page_pbn)?.entry(child_slot);
            if entry.is_mapped() {
                page_pbn = entry.pbn;
                continue;
            }
            let Some(alloc) = allocator.as_deref_mut() else {
                return Ok(None);
            };
            let child_pbn = alloc.allocate_tree_page()?;
            let child = TreePage::new(child_pbn, self.geometry.nonce);
            self.cache.install_new_page(child, child_pbn, era)?;
            self.cache.update_page(page_pbn, era, |page| {
                page.set_entry(
                    child_slot,
                    DataLocation::new(child_pbn, MappingState::Uncompressed),
                );
            })?;
            debug!(
                target: "vopt::map",
                event = "tree_page_allocated",
                tree,
                level,
                pbn = child_pbn.0
            );
            new_pages.push(AllocatedTreePage {
                parent: BlockMapSlot {
                    pbn: page_pbn,
                    slot: child_slot as u16,
                },
                pbn: child_pbn,
            });
            page_pbn = child_pbn;
        }
        Ok(Some(BlockMapSlot {
            pbn: page_pbn,
            slot: BlockMapGeometry::leaf_slot(lbn),
        }))
    }

    /// Read the mapping for `lbn`, `UNMAPPED` when no leaf exists.
    pub fn read_mapping(&mut self, lbn: Lbn) -> Result<DataLocation> {
        let mut none = Vec::new();
        match self.resolve_slot(lbn, 0, None, &mut none)? {
            Some(slot) => self.read_slot(slot),
            None => Ok(DataLocation::UNMAPPED),
        }
    }

    /// Read one leaf slot directly.
    pub fn read_slot(&mut self, slot: BlockMapSlot) -> Result<DataLocation> {
        Ok(self.cache.page(slot.pbn)?.entry(usize::from(slot.slot)))
    }

    /// Store `mapping` at `slot`, dirtying the page in `era`. Returns the
    /// previous mapping.
    pub fn update_slot(
        &mut self,
        slot: BlockMapSlot,
        mapping: DataLocation,
        era: SequenceNumber,
    ) -> Result<DataLocation> {
        let mut old = DataLocation::UNMAPPED;
        self.cache.update_page(slot.pbn, era, |page| {
            old = page.entry(usize::from(slot.slot));
            page.set_entry(usize::from(slot.slot), mapping);
        })?;
        Ok(old)
    }

    /// Visit every allocated tree page of the trees this zone owns (roots
    /// included), each exactly once.
    pub fn traverse(
        &mut self,
        logical_zones: usize,
        zone_index: usize,
        visitor: &mut dyn FnMut(Pbn) -> Result<()>,
    ) -> Result<()> {
        for tree in 0..self.geometry.root_count {
            if tree as usize % logical_zones != zone_index {
                continue;
            }
            let mut stack = vec![(self.geometry.root_pbn(tree), self.geometry.height)];
            while let Some((pbn, level)) = stack.pop() {
                visitor(pbn)?;
                if level <= 1 {
                    continue;
                }
                let children: Vec<Pbn> = self
                    .cache
                    .page(pbn)?
                    .mapped_entries()
                    .map(|(_, entry)| entry.pbn)
                    .collect();
                for child in children {
                    stack.push((child, level - 1));
                }
            }
        }
        Ok(())
    }

    /// Era-based writeback: flush pages dirtied before `cutoff`, returning
    /// the fully cleaned eras.
    pub fn expire_before(&mut self, cutoff: SequenceNumber) -> Result<Vec<SequenceNumber>> {
        self.cache.expire_before(cutoff)
    }

    pub fn flush_all(&mut self) -> Result<Vec<SequenceNumber>> {
        self.cache.flush_all()
    }

    #[must_use]
    pub fn oldest_dirty_era(&self) -> Option<SequenceNumber> {
        self.cache.oldest_dirty_era()
    }

    /// Extend the addressable logical space within the current height.
    pub fn grow_logical(&mut self, new_logical_blocks: u64) -> Result<()> {
        if new_logical_blocks < self.geometry.logical_blocks {
            return Err(VoptError::InvalidArgument(
                "logical size may not shrink".to_owned(),
            ));
        }
        if new_logical_blocks > self.geometry.capacity() {
            return Err(VoptError::BadConfiguration(format!(
                "logical size {new_logical_blocks} exceeds forest capacity {}",
                self.geometry.capacity()
            )));
        }
        self.geometry.logical_blocks = new_logical_blocks;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vopt_block::RamDevice;

    struct BumpAllocator {
        next: u64,
    }

    impl TreePageAllocator for BumpAllocator {
        fn allocate_tree_page(&mut self) -> Result<Pbn> {
            let pbn = Pbn(self.next);
            self.next += 1;
            Ok(pbn)
        }
    }

    fn zone_with_height(height: u32) -> (BlockMapZone, BumpAllocator) {
        let device = RamDevice::new(4096);
        let geometry = BlockMapGeometry {
            root_origin: Pbn(10),
            root_count: 2,
            height,
            logical_blocks: 3000,
            nonce: 0xabcd,
        };
        let io: Arc<dyn BlockIo> = device;
        (
            BlockMapZone::new(io, geometry, 16),
            BumpAllocator { next: 100 },
        )
    }

    #[test]
    fn height_and_forest_size() {
        assert_eq!(compute_height(100, 4), 1);
        assert_eq!(compute_height(EPP * 4, 4), 1);
        assert_eq!(compute_height(EPP * 4 + 1, 4), 2);
        assert_eq!(compute_height(EPP * EPP * 3, 1), 3);
        let size = compute_forest_size(EPP * 10, 2);
        assert!(size >= 10, "must include all leaves, got {size}");
    }

    #[test]
    fn unmapped_reads_without_allocation() {
        let (mut zone, _alloc) = zone_with_height(2);
        assert_eq!(zone.read_mapping(Lbn(0)).unwrap(), DataLocation::UNMAPPED);
        assert_eq!(zone.read_mapping(Lbn(2999)).unwrap(), DataLocation::UNMAPPED);
        assert!(zone.read_mapping(Lbn(3000)).is_err());
    }

    #[test]
    fn update_and_read_back() {
        let (mut zone, mut alloc) = zone_with_height(2);
        let mut new_pages = Vec::new();
        let slot = zone
            .resolve_slot(Lbn(5), 1, Some(&mut alloc), &mut new_pages)
            .unwrap()
            .expect("allocating resolve always yields a slot");
        assert_eq!(new_pages.len(), 1, "one leaf under the root");
        let mapping = DataLocation::new(Pbn(77), MappingState::Uncompressed);
        let old = zone.update_slot(slot, mapping, 1).unwrap();
        assert_eq!(old, DataLocation::UNMAPPED);
        assert_eq!(zone.read_mapping(Lbn(5)).unwrap(), mapping);
        // A second resolve of the same LBN allocates nothing further.
        let mut more = Vec::new();
        zone.resolve_slot(Lbn(5), 2, Some(&mut alloc), &mut more)
            .unwrap();
        assert!(more.is_empty());
    }

    #[test]
    fn mappings_survive_flush_and_reload() {
        let device = RamDevice::new(4096);
        let geometry = BlockMapGeometry {
            root_origin: Pbn(10),
            root_count: 2,
            height: 2,
            logical_blocks: 3000,
            nonce: 0xabcd,
        };
        let io: Arc<dyn BlockIo> = device.clone();
        let mut zone = BlockMapZone::new(io, geometry, 16);
        let mut alloc = BumpAllocator { next: 100 };
        let mut new_pages = Vec::new();
        let slot = zone
            .resolve_slot(Lbn(1700), 1, Some(&mut alloc), &mut new_pages)
            .unwrap()
            .unwrap();
        let mapping = DataLocation::new(Pbn(55), MappingState::Uncompressed);
        zone.update_slot(slot, mapping, 1).unwrap();
        zone.flush_all().unwrap();

        let io2: Arc<dyn BlockIo> = device;
        let mut reloaded = BlockMapZone::new(io2, geometry, 16);
        assert_eq!(reloaded.read_mapping(Lbn(1700)).unwrap(), mapping);
    }

    #[test]
    fn traverse_visits_each_allocated_page_once() {
        let (mut zone, mut alloc) = zone_with_height(2);
        let mut new_pages = Vec::new();
        for lbn in [0u64, 1, 900, 1700, 2500] {
            let slot = zone
                .resolve_slot(Lbn(lbn), 1, Some(&mut alloc), &mut new_pages)
                .unwrap()
                .unwrap();
            zone.update_slot(
                slot,
                DataLocation::new(Pbn(lbn + 1), MappingState::Uncompressed),
                1,
            )
            .unwrap();
        }
        let mut visited = Vec::new();
        zone.traverse(1, 0, &mut |pbn| {
            visited.push(pbn.0);
            Ok(())
        })
        .unwrap();
        let unique: std::collections::HashSet<_> = visited.iter().copied().collect();
        assert_eq!(unique.len(), visited.len(), "no page visited twice");
        // Two roots plus the allocated leaves.
        assert_eq!(visited.len(), 2 + new_pages.len());
    }

    #[test]
    fn grow_logical_bounds() {
        let (mut zone, _alloc) = zone_with_height(2);
        zone.grow_logical(4000).unwrap();
        assert!(zone.read_mapping(Lbn(3500)).is_ok());
        assert!(zone.grow_logical(100).is_err());
        assert!(zone.grow_logical(u64::MAX).is_err());
    }
}

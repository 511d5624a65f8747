//! The slab depot: zone-partitioned slabs, block allocation, and the
//! runtime reference-count update path.
//!
//! Every physical data block belongs to exactly one slab, and every slab to
//! exactly one physical zone (round-robin by slab number). A slab is laid
//! out as its data blocks, then a reference-count region (one header block
//! plus the counter array), then its journal region.

use crate::ref_counts::{RefCounts, RefStatus};
use crate::slab_journal::{AppendOutcome, SlabJournal, SlabJournalConfig, SlabJournalEntry};
use crate::summary::{compute_fullness_hint, SlabSummary, SlabSummaryEntry};
use std::sync::Arc;
use tracing::{debug, info, trace};
use vopt_block::{BlockIo, IoPriority};
use vopt_error::{Result, VoptError};
use vopt_types::{
    JournalOperation, JournalPoint, Pbn, SequenceNumber, SlabBlockNumber, SlabNumber, BLOCK_SIZE,
};

/// Where a slab is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabState {
    /// Reference counts on disk may lag the slab journal.
    Unrecovered,
    Scrubbing,
    /// Counters authoritative, journal reaped, no open block.
    Clean,
    /// Open for allocation with an active journal.
    Active,
    /// No free blocks remain.
    Full,
}

/// Depot geometry, fixed at format time.
#[derive(Debug, Clone, Copy)]
pub struct DepotConfig {
    /// First block of the first slab.
    pub origin: Pbn,
    pub slab_count: u32,
    /// Total blocks per slab.
    pub slab_size: u64,
    pub data_blocks: u64,
    /// Reference count region: one header block plus the counter blocks.
    pub ref_count_blocks: u64,
    pub journal_blocks: u64,
    /// First block of the slab summary region.
    pub summary_origin: Pbn,
    pub nonce: u64,
    pub physical_zones: u8,
}

impl DepotConfig {
    /// Split a slab of `slab_size` blocks into data, ref-count, and journal
    /// regions.
    pub fn partition_slab(slab_size: u64) -> Result<(u64, u64, u64)> {
        let journal_blocks = (slab_size / 16).clamp(2, 224);
        let remaining = slab_size.saturating_sub(journal_blocks);
        let counter_blocks = remaining.div_ceil(BLOCK_SIZE as u64 + 1).max(1);
        let ref_count_blocks = 1 + counter_blocks;
        let data_blocks = remaining
            .checked_sub(ref_count_blocks)
            .filter(|&d| d > 0)
            .ok_or_else(|| {
                VoptError::BadConfiguration(format!("slab size {slab_size} too small"))
            })?;
        Ok((data_blocks, ref_count_blocks, journal_blocks))
    }

    #[must_use]
    pub fn slab_origin(&self, slab: SlabNumber) -> Pbn {
        Pbn(self.origin.0 + u64::from(slab.0) * self.slab_size)
    }

    /// First block of a slab's reference count region.
    #[must_use]
    pub fn ref_count_origin(&self, slab: SlabNumber) -> Pbn {
        Pbn(self.slab_origin(slab).0 + self.data_blocks)
    }

    /// First block of a slab's journal region.
    #[must_use]
    pub fn journal_origin(&self, slab: SlabNumber) -> Pbn {
        Pbn(self.ref_count_origin(slab).0 + self.ref_count_blocks)
    }

    /// Resolve a PBN to its slab and data-block offset. Metadata blocks
    /// within a slab resolve to `None`.
    #[must_use]
    pub fn slab_for(&self, pbn: Pbn) -> Option<(SlabNumber, SlabBlockNumber)> {
        let offset = pbn.0.checked_sub(self.origin.0)?;
        let slab = offset / self.slab_size;
        if slab >= u64::from(self.slab_count) {
            return None;
        }
        let within = offset % self.slab_size;
        if within >= self.data_blocks {
            return None;
        }
        Some((SlabNumber(slab as u32), SlabBlockNumber(within as u32)))
    }

    #[must_use]
    pub fn zone_of(&self, slab: SlabNumber) -> usize {
        slab.0 as usize % usize::from(self.physical_zones.max(1))
    }

    /// One past the depot's last block.
    #[must_use]
    pub fn end(&self) -> Pbn {
        Pbn(self.origin.0 + u64::from(self.slab_count) * self.slab_size)
    }
}

const REF_HEADER_MAGIC: u32 = 0x5652_4643; // "CFRV"

/// One slab.
#[derive(Debug)]
pub struct Slab {
    pub number: SlabNumber,
    pub state: SlabState,
    pub ref_counts: RefCounts,
    pub journal: SlabJournal,
    next_free_hint: SlabBlockNumber,
}

impl Slab {
    fn new(number: SlabNumber, config: &DepotConfig, state: SlabState, tail: SequenceNumber) -> Self {
        Self {
            number,
            state,
            ref_counts: RefCounts::new(config.data_blocks),
            journal: SlabJournal::new(
                SlabJournalConfig {
                    origin: config.journal_origin(number),
                    size: config.journal_blocks,
                    nonce: config.nonce,
                },
                tail,
            ),
            next_free_hint: SlabBlockNumber(0),
        }
    }
}

/// Depot-wide counters for the stats interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct DepotStats {
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub slabs_scrubbed: u64,
}

/// The slab depot.
pub struct SlabDepot {
    config: DepotConfig,
    slabs: Vec<Slab>,
    summary: SlabSummary,
    /// Per-zone cursor for round-robin slab selection.
    open_slab: Vec<Option<SlabNumber>>,
    stats: DepotStats,
}

impl SlabDepot {
    /// Create a freshly formatted depot: all slabs clean and empty.
    pub fn format(config: DepotConfig, device: &Arc<dyn BlockIo>) -> Result<Self> {
        let slabs = (0..config.slab_count)
            .map(|i| Slab::new(SlabNumber(i), &config, SlabState::Clean, 1))
            .collect();
        let mut summary = SlabSummary::new(config.summary_origin, config.slab_count);
        summary.save(device)?;
        let mut depot = Self {
            config,
            slabs,
            summary,
            open_slab: vec![None; usize::from(config.physical_zones.max(1))],
            stats: DepotStats::default(),
        };
        depot.save_all(device)?;
        info!(
            target: "vopt::depot",
            event = "formatted",
            slabs = config.slab_count,
            data_blocks_per_slab = config.data_blocks,
        );
        Ok(depot)
    }

    /// Load the depot from disk. Slabs whose summary entry is dirty come up
    /// `Unrecovered` and must be scrubbed before allocation.
    pub fn load(config: DepotConfig, device: &Arc<dyn BlockIo>) -> Result<Self> {
        let summary = SlabSummary::load(device, config.summary_origin, config.slab_count)?;
        let mut slabs = Vec::with_capacity(config.slab_count as usize);
        for i in 0..config.slab_count {
            let number = SlabNumber(i);
            if summary.entry(number).is_clean {
                match Self::load_ref_counts(&config, device, number)? {
                    Some((ref_counts, journal_tail)) => {
                        let mut slab = Slab::new(number, &config, SlabState::Clean, journal_tail);
                        slab.ref_counts = ref_counts;
                        slabs.push(slab);
                    }
                    None => slabs.push(Slab::new(number, &config, SlabState::Clean, 1)),
                }
            } else {
                slabs.push(Slab::new(number, &config, SlabState::Unrecovered, 1));
            }
        }
        Ok(Self {
            config,
            slabs,
            summary,
            open_slab: vec![None; usize::from(config.physical_zones.max(1))],
            stats: DepotStats::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &DepotConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> DepotStats {
        self.stats
    }

    #[must_use]
    pub fn slab(&self, number: SlabNumber) -> &Slab {
        &self.slabs[number.0 as usize]
    }

    pub fn slab_mut(&mut self, number: SlabNumber) -> &mut Slab {
        &mut self.slabs[number.0 as usize]
    }

    #[must_use]
    pub fn slab_count(&self) -> u32 {
        self.config.slab_count
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.slabs.iter().map(|s| s.ref_counts.free_blocks()).sum()
    }

    /// Slabs needing scrubbing, per the summary.
    #[must_use]
    pub fn unrecovered_slabs(&self) -> Vec<SlabNumber> {
        self.slabs
            .iter()
            .filter(|s| s.state == SlabState::Unrecovered)
            .map(|s| s.number)
            .collect()
    }

    /// Allocate one data block in `zone`, leaving it provisionally
    /// referenced for the caller's PBN lock.
    pub fn allocate_block(&mut self, zone: usize) -> Result<Pbn> {
        let zone_count = self.open_slab.len();
        let candidates: Vec<SlabNumber> = (0..self.config.slab_count)
            .map(SlabNumber)
            .filter(|&s| self.config.zone_of(s) == zone)
            .collect();
        if candidates.is_empty() {
            return Err(VoptError::NoThreads("physical zone has no slabs"));
        }
        // Prefer the open slab, then round-robin the rest.
        let start = self.open_slab[zone]
            .and_then(|open| candidates.iter().position(|&s| s == open))
            .unwrap_or(0);
        for step in 0..candidates.len() {
            let number = candidates[(start + step) % candidates.len()];
            let slab = &mut self.slabs[number.0 as usize];
            match slab.state {
                SlabState::Unrecovered | SlabState::Scrubbing => continue,
                SlabState::Full => continue,
                SlabState::Clean | SlabState::Active => {}
            }
            let Some(sbn) = slab.ref_counts.find_free_block(slab.next_free_hint) else {
                slab.state = SlabState::Full;
                continue;
            };
            slab.ref_counts.provisionally_reference(sbn)?;
            slab.next_free_hint = SlabBlockNumber(sbn.0 + 1);
            slab.state = SlabState::Active;
            self.open_slab[zone] = Some(number);
            self.summary.mark_dirty(number);
            self.stats.blocks_allocated += 1;
            let pbn = Pbn(self.config.slab_origin(number).0 + u64::from(sbn.0));
            trace!(
                target: "vopt::depot",
                event = "block_allocated",
                zone,
                slab = number.0,
                pbn = pbn.0,
            );
            return Ok(pbn);
        }
        debug_assert!(zone < zone_count);
        Err(VoptError::NoSpace)
    }

    /// The physical zone that owns `pbn`'s slab.
    pub fn zone_for_pbn(&self, pbn: Pbn) -> Result<usize> {
        let (slab, _) = self.resolve(pbn)?;
        Ok(self.config.zone_of(slab))
    }

    fn resolve(&self, pbn: Pbn) -> Result<(SlabNumber, SlabBlockNumber)> {
        self.config.slab_for(pbn).ok_or_else(|| {
            VoptError::InvalidArgument(format!("{pbn} is not a depot data block"))
        })
    }

    /// Current reference status of a data block.
    pub fn ref_status(&self, pbn: Pbn) -> Result<RefStatus> {
        let (slab, sbn) = self.resolve(pbn)?;
        self.slabs[slab.0 as usize].ref_counts.status(sbn)
    }

    /// Apply one reference operation: journal it in the slab journal tagged
    /// with its recovery journal point, then update the counter.
    pub fn adjust_reference(
        &mut self,
        device: &Arc<dyn BlockIo>,
        pbn: Pbn,
        operation: JournalOperation,
        recovery_point: JournalPoint,
    ) -> Result<(RefStatus, Vec<SequenceNumber>)> {
        let (number, sbn) = self.resolve(pbn)?;
        let slab = &mut self.slabs[number.0 as usize];
        let AppendOutcome {
            point,
            released_recovery_sequences,
        } = slab
            .journal
            .append(device, SlabJournalEntry { sbn, operation }, recovery_point)?;
        let status = slab.ref_counts.adjust(sbn, operation)?;
        slab.ref_counts.advance_journal_point(point);
        self.summary.mark_dirty(number);
        if status == RefStatus::Free {
            self.stats.blocks_freed += 1;
            if slab.state == SlabState::Full {
                slab.state = SlabState::Active;
            }
        }
        Ok((status, released_recovery_sequences))
    }

    /// Drop an uncommitted provisional reference.
    pub fn release_provisional(&mut self, pbn: Pbn) -> Result<()> {
        let (number, sbn) = self.resolve(pbn)?;
        self.slabs[number.0 as usize]
            .ref_counts
            .release_provisional(sbn)
    }

    fn ref_header_block(config: &DepotConfig, slab: &Slab) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0..4].copy_from_slice(&REF_HEADER_MAGIC.to_le_bytes());
        block[4..12].copy_from_slice(&config.nonce.to_le_bytes());
        block[12..20].copy_from_slice(&vopt_types::pack_journal_point(
            slab.ref_counts.slab_journal_point(),
        ));
        block[20..28].copy_from_slice(&slab.journal.tail().to_le_bytes());
        block
    }

    /// Persist one slab: seal its journal, write the counter array, reap,
    /// and mark the summary clean. Returns recovery sequences released by
    /// the journal commit.
    pub fn save_slab(
        &mut self,
        device: &Arc<dyn BlockIo>,
        number: SlabNumber,
    ) -> Result<Vec<SequenceNumber>> {
        let config = self.config;
        let slab = &mut self.slabs[number.0 as usize];
        let released = slab.journal.commit(device)?;
        let header = Self::ref_header_block(&config, slab);
        let origin = config.ref_count_origin(number);
        device.write_block(IoPriority::Metadata, origin, &header)?;
        let counters = slab.ref_counts.as_bytes();
        for (i, chunk) in counters.chunks(BLOCK_SIZE).enumerate() {
            let mut block = vec![0u8; BLOCK_SIZE];
            block[..chunk.len()].copy_from_slice(chunk);
            device.write_block(
                IoPriority::Metadata,
                Pbn(origin.0 + 1 + i as u64),
                &block,
            )?;
        }
        slab.journal.reap_all();
        if slab.state == SlabState::Unrecovered || slab.state == SlabState::Scrubbing {
            slab.state = SlabState::Clean;
        }
        let free = slab.ref_counts.free_blocks();
        self.summary.update(
            number,
            SlabSummaryEntry {
                is_clean: true,
                fullness_hint: compute_fullness_hint(free, config.data_blocks),
                tail_block_offset: (slab.journal.tail() % config.journal_blocks) as u16,
            },
        );
        debug!(target: "vopt::depot", event = "slab_saved", slab = number.0, free);
        Ok(released)
    }

    fn load_ref_counts(
        config: &DepotConfig,
        device: &Arc<dyn BlockIo>,
        number: SlabNumber,
    ) -> Result<Option<(RefCounts, SequenceNumber)>> {
        let origin = config.ref_count_origin(number);
        let header = device.read_block(IoPriority::Metadata, origin)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        if magic != REF_HEADER_MAGIC {
            // Never saved; a formatted-but-untouched slab.
            return Ok(None);
        }
        let nonce = u64::from_le_bytes(header[4..12].try_into().expect("8 bytes"));
        if nonce != config.nonce {
            return Err(VoptError::BadState(format!(
                "slab {} reference counts carry nonce {nonce:#x}",
                number.0
            )));
        }
        let mut point = [0u8; 8];
        point.copy_from_slice(&header[12..20]);
        let point = vopt_types::unpack_journal_point(&point);
        let journal_tail = u64::from_le_bytes(header[20..28].try_into().expect("8 bytes"));
        let mut counters = Vec::with_capacity(config.data_blocks as usize);
        let counter_blocks = (config.data_blocks as usize).div_ceil(BLOCK_SIZE);
        for i in 0..counter_blocks {
            let block = device.read_block(IoPriority::Metadata, Pbn(origin.0 + 1 + i as u64))?;
            let take = (config.data_blocks as usize - counters.len()).min(BLOCK_SIZE);
            counters.extend_from_slice(&block[..take]);
        }
        Ok(Some((RefCounts::from_bytes(counters, point), journal_tail)))
    }

    /// Persist every slab and the summary. Returns all released recovery
    /// sequences.
    pub fn save_all(&mut self, device: &Arc<dyn BlockIo>) -> Result<Vec<SequenceNumber>> {
        let mut released = Vec::new();
        for i in 0..self.config.slab_count {
            released.extend(self.save_slab(device, SlabNumber(i))?);
        }
        self.summary.save(device)?;
        Ok(released)
    }

    /// The last saved counters and journal tail for a slab, if any save
    /// ever happened. Used by the scrubber as its replay baseline.
    pub fn load_saved_ref_counts(
        &self,
        device: &Arc<dyn BlockIo>,
        number: SlabNumber,
    ) -> Result<Option<(RefCounts, SequenceNumber)>> {
        Self::load_ref_counts(&self.config, device, number)
    }

    pub fn summary_mut(&mut self) -> &mut SlabSummary {
        &mut self.summary
    }

    #[must_use]
    pub fn summary(&self) -> &SlabSummary {
        &self.summary
    }

    pub(crate) fn note_scrubbed(&mut self) {
        self.stats.slabs_scrubbed += 1;
    }

    /// Add `count` fresh slabs (grow-physical). The new slabs are clean and
    /// empty.
    pub fn grow(&mut self, device: &Arc<dyn BlockIo>, count: u32) -> Result<()> {
        let old_count = self.config.slab_count;
        let new_count = old_count + count;
        let mut config = self.config;
        config.slab_count = new_count;
        // Rebuild the summary at the new width, preserving old entries.
        let mut summary = SlabSummary::new(config.summary_origin, new_count);
        for i in 0..old_count {
            summary.update(SlabNumber(i), self.summary.entry(SlabNumber(i)));
        }
        self.config = config;
        self.summary = summary;
        for i in old_count..new_count {
            let number = SlabNumber(i);
            self.slabs.push(Slab::new(number, &config, SlabState::Clean, 1));
            self.save_slab(device, number)?;
        }
        self.summary.save(device)?;
        info!(target: "vopt::depot", event = "grown", slabs = new_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_config(slab_count: u32, slab_size: u64) -> DepotConfig {
        let (data_blocks, ref_count_blocks, journal_blocks) =
            DepotConfig::partition_slab(slab_size).unwrap();
        DepotConfig {
            origin: Pbn(64),
            slab_count,
            slab_size,
            data_blocks,
            ref_count_blocks,
            journal_blocks,
            summary_origin: Pbn(8),
            nonce: 0x7777,
            physical_zones: 2,
        }
    }

    fn device_for(config: &DepotConfig) -> Arc<dyn BlockIo> {
        vopt_block::RamDevice::new(config.end().0 + 16)
    }

    #[test]
    fn slab_partition_adds_up() {
        let (data, refs, journal) = DepotConfig::partition_slab(256).unwrap();
        assert_eq!(data + refs + journal, 256);
        assert!(data > 0);
        assert!(refs >= 2);
        assert!(journal >= 2);
        assert!(DepotConfig::partition_slab(4).is_err());
    }

    #[test]
    fn pbn_resolution_skips_metadata_blocks() {
        let config = test_config(2, 64);
        let origin = config.origin.0;
        assert_eq!(
            config.slab_for(Pbn(origin)),
            Some((SlabNumber(0), SlabBlockNumber(0)))
        );
        // First block of slab 0's ref count region is not a data block.
        assert_eq!(config.slab_for(config.ref_count_origin(SlabNumber(0))), None);
        assert_eq!(
            config.slab_for(Pbn(origin + 64)),
            Some((SlabNumber(1), SlabBlockNumber(0)))
        );
        assert_eq!(config.slab_for(Pbn(origin + 128)), None);
        assert_eq!(config.slab_for(Pbn(0)), None);
    }

    #[test]
    fn allocation_partitions_by_zone() {
        let config = test_config(4, 64);
        let device = device_for(&config);
        let mut depot = SlabDepot::format(config, &device).unwrap();
        let pbn0 = depot.allocate_block(0).unwrap();
        let pbn1 = depot.allocate_block(1).unwrap();
        let (slab0, _) = config.slab_for(pbn0).unwrap();
        let (slab1, _) = config.slab_for(pbn1).unwrap();
        assert_eq!(config.zone_of(slab0), 0);
        assert_eq!(config.zone_of(slab1), 1);
        assert_eq!(depot.ref_status(pbn0).unwrap(), RefStatus::Provisional);
    }

    #[test]
    fn adjust_reference_journals_then_counts() {
        let config = test_config(2, 64);
        let device = device_for(&config);
        let mut depot = SlabDepot::format(config, &device).unwrap();
        let pbn = depot.allocate_block(0).unwrap();
        let (status, _) = depot
            .adjust_reference(&device, pbn, JournalOperation::DataIncrement, JournalPoint::new(1, 0))
            .unwrap();
        assert_eq!(status, RefStatus::Count(1));
        let (status, _) = depot
            .adjust_reference(&device, pbn, JournalOperation::DataIncrement, JournalPoint::new(1, 1))
            .unwrap();
        assert_eq!(status, RefStatus::Count(2));
        let (number, _) = config.slab_for(pbn).unwrap();
        assert!(!depot.summary().entry(number).is_clean);
    }

    #[test]
    fn saved_depot_reloads_clean() {
        let config = test_config(2, 64);
        let device = device_for(&config);
        let mut depot = SlabDepot::format(config, &device).unwrap();
        let pbn = depot.allocate_block(0).unwrap();
        depot
            .adjust_reference(&device, pbn, JournalOperation::DataIncrement, JournalPoint::new(1, 0))
            .unwrap();
        depot.save_all(&device).unwrap();

        let reloaded = SlabDepot::load(config, &device).unwrap();
        assert_eq!(reloaded.ref_status(pbn).unwrap(), RefStatus::Count(1));
        assert!(reloaded.unrecovered_slabs().is_empty());
        assert_eq!(reloaded.free_blocks(), depot.free_blocks());
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let config = test_config(1, 32);
        let device = device_for(&config);
        let mut config1 = config;
        config1.physical_zones = 1;
        let mut depot = SlabDepot::format(config1, &device).unwrap();
        let mut allocated: u64 = 0;
        loop {
            match depot.allocate_block(0) {
                Ok(_) => allocated += 1,
                Err(VoptError::NoSpace) => break,
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert_eq!(u64::from(allocated), config1.data_blocks);
    }

    #[test]
    fn grow_adds_clean_slabs() {
        let config = test_config(2, 64);
        // Leave room for the grown slabs.
        let device: Arc<dyn BlockIo> = vopt_block::RamDevice::new(config.end().0 + 64 * 3);
        let mut depot = SlabDepot::format(config, &device).unwrap();
        depot.grow(&device, 2).unwrap();
        assert_eq!(depot.slab_count(), 4);
        assert_eq!(
            depot.free_blocks(),
            4 * config.data_blocks
        );
        let reloaded = SlabDepot::load(*depot.config(), &device).unwrap();
        assert_eq!(reloaded.slab_count(), 4);
    }
}

//! The engine: zones, work queues, and the data-vio state machines.
//!
//! Work is partitioned into zones — logical (block map), physical (depot),
//! hash (dedupe index) — plus the journal, packer, dedupe, and admin
//! threads. Every mutable structure is owned by exactly one zone, and all
//! cross-zone effects travel as messages on the destination zone's queue.
//! The scheduler services every queue from the engine worker thread (the
//! small-device configuration); zone routing and message passing are
//! unchanged by that collapse, so each zone's effects stay serialized in
//! queue order.
//!
//! One deliberate exception to strict message passing: block map tree page
//! allocation reaches into the depot inline from the journal path. The
//! single scheduler serializes it; splitting it into a message round trip
//! would only add suspension points.

use crate::admin::{suspend_phases, AdminOperation, AdminState, AdminStateMachine, SuspendPhase};
use crate::config::DeviceConfig;
use crate::packer::{self, Packer, PackerVerdict};
use crate::read_only::ReadOnlyNotifier;
use crate::super_block::SuperBlock;
use crate::vio::{Allocation, Completion, CompressionState, DataVio, VioOperation, VioPool};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use vopt_block::{BlockIo, IoPriority};
use vopt_depot::{RefStatus, SlabDepot, SlabScrubber};
use vopt_error::{Result, VoptError};
use vopt_index::{
    fingerprint_block, IndexRequest, IndexRouter, RequestAction, Volume,
};
use vopt_journal::{
    find_head_and_tail, load_journal_region, replay, validate_entry, EntryBounds, JournalLock,
    RecoveryJournal,
};
use vopt_lock::{PbnLockIdx, PbnLockPool, PbnLockType, WaitQueue};
use vopt_map::{AllocatedTreePage, BlockMapZone, TreePageAllocator};
use vopt_types::{
    BlockMapSlot, DataLocation, JournalOperation, JournalPoint, Lbn, MappingState, Pbn,
    RecoveryJournalEntry, SequenceNumber, MAXIMUM_REFERENCE_COUNT,
};

/// Messages between zones. Each is processed on the queue of the zone that
/// owns the state it touches.
enum Message {
    /// Logical zone: acquire the logical lock and consult the block map.
    Launch(Box<DataVio>),
    /// Dedupe/cpu thread: fingerprint (and try to compress) the data.
    Hash(Box<DataVio>),
    /// Hash zone: query the index for advice.
    DedupeQuery(Box<DataVio>),
    /// Physical zone: verify an advised duplicate byte-for-byte.
    Verify(Box<DataVio>),
    /// Physical zone: allocate a block and write the data.
    Allocate(Box<DataVio>),
    /// Packer thread: bin a compressed fragment.
    Pack(Box<DataVio>),
    /// Journal thread: admit the mapping change and drive it downstream.
    Journal(Box<DataVio>),
    /// Physical zone: read mapped data for a read vio.
    ReadData(Box<DataVio>),
    /// Journal thread: flush barrier.
    Flush(Box<DataVio>),
}

/// One zone's single-consumer queue, two priorities, FIFO within each.
#[derive(Default)]
struct WorkQueue {
    high: VecDeque<Message>,
    normal: VecDeque<Message>,
}

impl WorkQueue {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn pop(&mut self) -> Option<Message> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }
}

/// Flat thread ids for the static thread layout.
#[derive(Debug, Clone, Copy)]
pub struct ThreadLayout {
    pub logical_zones: usize,
    pub physical_zones: usize,
    pub hash_zones: usize,
}

impl ThreadLayout {
    const ADMIN: usize = 0;
    const JOURNAL: usize = 1;
    const PACKER: usize = 2;
    const DEDUPE: usize = 3;
    const ZONE_BASE: usize = 4;

    fn logical(&self, zone: usize) -> usize {
        Self::ZONE_BASE + zone
    }

    fn physical(&self, zone: usize) -> usize {
        Self::ZONE_BASE + self.logical_zones + zone
    }

    fn hash(&self, zone: usize) -> usize {
        Self::ZONE_BASE + self.logical_zones + self.physical_zones + zone
    }

    fn total(&self) -> usize {
        Self::ZONE_BASE + self.logical_zones + self.physical_zones + self.hash_zones
    }
}

/// A logical (LBN) lock: one holder, FIFO waiters.
struct LogicalLock {
    holder: u64,
    waiters: WaitQueue<Box<DataVio>>,
}

/// One physical zone's PBN lock table.
struct PhysicalZoneLocks {
    pool: PbnLockPool,
    held: HashMap<u64, PbnLockIdx>,
}

impl PhysicalZoneLocks {
    fn new(capacity: usize) -> Self {
        Self {
            pool: PbnLockPool::new(capacity),
            held: HashMap::new(),
        }
    }
}

/// A submission parked on data-vio pool exhaustion.
struct PendingSubmission {
    operation: VioOperation,
    lbn: Lbn,
    data: Vec<u8>,
    completion: Completion,
}

/// Aggregated engine counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub writes: u64,
    pub reads: u64,
    pub discards: u64,
    pub flushes: u64,
    pub zero_block_writes: u64,
    pub dedupe_hits: u64,
    pub dedupe_verify_mismatches: u64,
    pub advice_timeouts: u64,
    pub late_advice: u64,
    pub compressed_fragments: u64,
    pub write_errors: u64,
}

/// Snapshot returned by the stats admin op.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub engine: EngineStats,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
    pub depot_free_blocks: u64,
    pub journal_blocks_committed: u64,
    pub journal_blocks_reaped: u64,
    pub index_hits: u64,
    pub index_chapters_closed: u64,
    pub in_flight: usize,
    pub read_only: bool,
}

struct DedupeWait {
    vio: Box<DataVio>,
    deadline: Instant,
}

/// Allocates depot blocks for block map tree pages.
struct DepotTreeAllocator<'a> {
    depot: &'a mut SlabDepot,
    zone_cursor: &'a mut usize,
    zones: usize,
}

impl TreePageAllocator for DepotTreeAllocator<'_> {
    fn allocate_tree_page(&mut self) -> Result<Pbn> {
        let start = *self.zone_cursor;
        for step in 0..self.zones {
            let zone = (start + step) % self.zones;
            match self.depot.allocate_block(zone) {
                Ok(pbn) => {
                    *self.zone_cursor = (zone + 1) % self.zones;
                    return Ok(pbn);
                }
                Err(VoptError::NoSpace) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(VoptError::NoSpace)
    }
}

/// The engine.
pub struct Engine {
    device: Arc<dyn BlockIo>,
    pub(crate) super_block: SuperBlock,
    config: DeviceConfig,
    layout: ThreadLayout,
    admin: AdminStateMachine,
    read_only: ReadOnlyNotifier,
    journal: RecoveryJournal,
    depot: SlabDepot,
    scrubber: SlabScrubber,
    map_zones: Vec<BlockMapZone>,
    /// Per logical zone: eras currently holding recovery journal locks.
    map_lock_eras: Vec<BTreeSet<SequenceNumber>>,
    index: IndexRouter,
    dedupe_enabled: bool,
    compression_enabled: bool,
    packer: Packer,
    pool: VioPool,
    pending_submissions: VecDeque<PendingSubmission>,
    logical_locks: Vec<HashMap<u64, LogicalLock>>,
    pbn_locks: Vec<PhysicalZoneLocks>,
    pending_dedupe: HashMap<u64, DedupeWait>,
    queues: Vec<WorkQueue>,
    alloc_cursor: usize,
    in_flight: usize,
    next_id: u64,
    super_block_dirtied: bool,
    stats: EngineStats,
}

const VIO_POOL_SIZE: usize = 256;

impl Engine {
    /// Format a fresh device and leave a clean super block behind.
    /// `physical_blocks` may be less than the underlying device for
    /// later growth.
    pub fn format(
        device: &Arc<dyn BlockIo>,
        physical_blocks: u64,
        logical_blocks: u64,
        params: &crate::super_block::FormatParams,
    ) -> Result<SuperBlock> {
        if physical_blocks > device.block_count() {
            return Err(VoptError::BadConfiguration(format!(
                "{physical_blocks} physical blocks exceed the backing device"
            )));
        }
        let super_block = SuperBlock::format(physical_blocks, logical_blocks, params)?;
        SlabDepot::format(super_block.depot_config()?, device)?;
        super_block.write(device)?;
        info!(
            target: "vopt::engine",
            event = "formatted",
            physical_blocks = super_block.physical_blocks,
            logical_blocks,
            slabs = super_block.slab_count,
        );
        Ok(super_block)
    }

    /// Load the device, recovering if the last shutdown was unclean.
    pub fn open(device: Arc<dyn BlockIo>, config: DeviceConfig) -> Result<Self> {
        let mut super_block = SuperBlock::read(&device)?;
        let (logical_zones, physical_zones, hash_zones) = config.threads.effective();
        let layout = ThreadLayout {
            logical_zones,
            physical_zones,
            hash_zones,
        };
        let mut admin = AdminStateMachine::new();
        admin.start_operation(AdminOperation::Load)?;

        let depot_config = super_block.depot_config_for(&config.threads)?;
        let mut depot = SlabDepot::load(depot_config, &device)?;
        let mut scrubber = SlabScrubber::new();
        let mut read_only = ReadOnlyNotifier::new(layout.total());

        let mut index_geometry = super_block.index;
        index_geometry.zone_count = hash_zones as u32;
        let mut volume = Volume::new(index_geometry, super_block.index_origin(), device.clone());
        if super_block.index_newest_closed != u64::MAX {
            volume.restore_newest_closed(super_block.index_newest_closed);
        }
        let index = IndexRouter::new(index_geometry, volume)?;

        let journal_config = super_block.journal_config();
        let mut journal = RecoveryJournal::new(
            device.clone(),
            journal_config,
            super_block.journal_start,
            super_block.recovery_count,
            super_block.logical_blocks_used,
            super_block.block_map_data_blocks,
        )?;

        let geometry = super_block.block_map_geometry();
        let cache_pages = (config.cache_size as usize / logical_zones).max(8);
        let map_zones: Vec<BlockMapZone> = (0..logical_zones)
            .map(|_| BlockMapZone::new(device.clone(), geometry, cache_pages))
            .collect();

        if !super_block.clean {
            admin.finish_operation(AdminState::Recovering);
            info!(target: "vopt::engine", event = "recovery_needed");
            match Self::recover(&device, &super_block, &mut depot, &mut scrubber) {
                Ok(recovered) => {
                    journal = RecoveryJournal::new(
                        device.clone(),
                        journal_config,
                        recovered.next_sequence,
                        super_block.recovery_count.wrapping_add(1),
                        recovered.logical_blocks_used,
                        recovered.block_map_data_blocks,
                    )?;
                    super_block.recovery_count = super_block.recovery_count.wrapping_add(1);
                }
                Err(error) => {
                    warn!(
                        target: "vopt::engine",
                        event = "recovery_failed",
                        error = %error,
                    );
                    read_only.enter_read_only(-(error_code(&error)));
                }
            }
        } else {
            // Any slabs the summary reports dirty on a clean load get
            // scrubbed in the background.
            for slab in depot.unrecovered_slabs() {
                scrubber.register_slab(slab, false);
            }
            let _ = scrubber.scrub_slabs(&mut depot, &device);
        }

        let pbn_locks = (0..physical_zones)
            .map(|_| PhysicalZoneLocks::new(VIO_POOL_SIZE * 2 + 16))
            .collect();

        let mut engine = Self {
            device,
            super_block,
            config,
            layout,
            admin,
            read_only,
            journal,
            depot,
            scrubber,
            map_zones,
            map_lock_eras: vec![BTreeSet::new(); logical_zones],
            index,
            dedupe_enabled: true,
            compression_enabled: false,
            packer: Packer::new(),
            pool: VioPool::new(VIO_POOL_SIZE),
            pending_submissions: VecDeque::new(),
            logical_locks: (0..logical_zones).map(|_| HashMap::new()).collect(),
            pbn_locks,
            pending_dedupe: HashMap::new(),
            queues: Vec::new(),
            alloc_cursor: 0,
            in_flight: 0,
            next_id: 1,
            super_block_dirtied: false,
            stats: EngineStats::default(),
        };
        engine.dedupe_enabled = engine.config.deduplication;
        engine.compression_enabled = engine.config.compression;
        engine.queues = (0..engine.layout.total()).map(|_| WorkQueue::default()).collect();
        let end_state = if engine.read_only.is_read_only_authoritative() {
            AdminState::ReadOnly
        } else {
            AdminState::Operating
        };
        engine.admin.finish_operation(end_state);
        info!(target: "vopt::engine", event = "loaded", state = ?end_state);
        Ok(engine)
    }

    // ── Submission ──────────────────────────────────────────────────────

    /// Accept one host operation. `data` must be one block for writes,
    /// empty otherwise.
    pub fn submit(
        &mut self,
        operation: VioOperation,
        lbn: Lbn,
        data: Vec<u8>,
        completion: Completion,
    ) {
        if !self.admin.is_operating() {
            completion(Err(VoptError::InvalidAdminState(format!(
                "submit while {:?}",
                self.admin.state()
            ))));
            return;
        }
        let Some(mut vio) = self.pool.acquire() else {
            self.pending_submissions.push_back(PendingSubmission {
                operation,
                lbn,
                data,
                completion,
            });
            return;
        };
        let id = self.next_id;
        self.next_id += 1;
        vio.reset(id, operation, lbn, data, completion);
        self.in_flight += 1;
        match operation {
            VioOperation::Flush => {
                self.stats.flushes += 1;
                // A flush covers fragments waiting in the packer; push them
                // ahead of the barrier on the journal queue.
                self.flush_packer();
                self.enqueue(ThreadLayout::JOURNAL, IoPriority::Data, Message::Flush(vio));
            }
            VioOperation::Read => {
                self.stats.reads += 1;
                let zone = self.logical_zone_for(lbn);
                vio.logical_zone = zone;
                self.enqueue(self.layout.logical(zone), IoPriority::Data, Message::Launch(vio));
            }
            VioOperation::Write { .. } | VioOperation::Discard => {
                if vio.is_write() {
                    self.stats.writes += 1;
                } else {
                    self.stats.discards += 1;
                }
                let zone = self.logical_zone_for(lbn);
                vio.logical_zone = zone;
                self.enqueue(self.layout.logical(zone), IoPriority::Data, Message::Launch(vio));
            }
        }
    }

    fn logical_zone_for(&self, lbn: Lbn) -> usize {
        self.map_zones[0]
            .geometry()
            .zone_for(lbn, self.layout.logical_zones)
    }

    fn enqueue(&mut self, thread: usize, priority: IoPriority, message: Message) {
        let queue = &mut self.queues[thread];
        match priority {
            IoPriority::Metadata => queue.high.push_back(message),
            IoPriority::Data => queue.normal.push_back(message),
        }
    }

    /// Service every zone queue until quiescent.
    pub fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for thread in 0..self.queues.len() {
                while let Some(message) = self.queues[thread].pop() {
                    self.dispatch(message);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Whether any work remains queued or in flight.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.in_flight == 0
            && self.pending_submissions.is_empty()
            && self.queues.iter().all(|q| q.len() == 0)
    }

    /// The soonest dedupe-advice deadline, for the scheduler's timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_dedupe.values().map(|w| w.deadline).min()
    }

    /// Time out dedupe waits whose deadline has passed; the writes proceed
    /// without advice.
    pub fn poll_timeouts(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending_dedupe
            .iter()
            .filter(|(_, wait)| wait.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(wait) = self.pending_dedupe.remove(&id) {
                self.stats.advice_timeouts += 1;
                debug!(target: "vopt::engine", event = "advice_timeout", vio = id);
                self.route_allocation(wait.vio);
            }
        }
        self.pump();
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::Launch(vio) => self.handle_launch(vio),
            Message::Hash(vio) => self.handle_hash(vio),
            Message::DedupeQuery(vio) => self.handle_dedupe_query(vio),
            Message::Verify(vio) => self.handle_verify(vio),
            Message::Allocate(vio) => self.handle_allocate(vio),
            Message::Pack(vio) => self.handle_pack(vio),
            Message::Journal(vio) => self.handle_journal(vio),
            Message::ReadData(vio) => self.handle_read_data(vio),
            Message::Flush(vio) => self.handle_flush(vio),
        }
    }

    // ── Logical zone ────────────────────────────────────────────────────

    fn handle_launch(&mut self, mut vio: Box<DataVio>) {
        let zone = vio.logical_zone;
        let lbn = vio.lbn;
        if lbn.0 >= self.super_block.logical_blocks {
            self.finish_vio(
                vio,
                Err(VoptError::InvalidArgument(format!(
                    "{lbn} beyond logical size"
                ))),
            );
            return;
        }
        if vio.operation == VioOperation::Read {
            match self.map_zones[zone].read_mapping(lbn) {
                Ok(mapping) if !mapping.is_mapped() || mapping.is_zero_block() => {
                    vio.fill_zeros();
                    self.finish_vio(vio, Ok(()));
                }
                Ok(mapping) => {
                    vio.mapped = mapping;
                    let physical = match self.depot.zone_for_pbn(mapping.pbn) {
                        Ok(zone) => zone,
                        Err(error) => {
                            self.finish_vio(vio, Err(error));
                            return;
                        }
                    };
                    self.enqueue(
                        self.layout.physical(physical),
                        IoPriority::Data,
                        Message::ReadData(vio),
                    );
                }
                Err(error) => self.finish_vio(vio, Err(error)),
            }
            return;
        }

        // Writes and discards fail fast once this thread has heard about
        // read-only mode.
        if self.read_only.is_read_only(self.layout.logical(zone)) {
            self.finish_vio(vio, Err(VoptError::ReadOnly));
            return;
        }

        // Logical lock: one mutator per LBN; later arrivals wait in FIFO
        // order.
        match self.logical_locks[zone].get_mut(&lbn.0) {
            Some(lock) => {
                trace!(target: "vopt::engine", event = "lbn_lock_wait", lbn = lbn.0);
                lock.waiters.enqueue(vio);
                return;
            }
            None => {
                self.logical_locks[zone].insert(
                    lbn.0,
                    LogicalLock {
                        holder: vio.id,
                        waiters: WaitQueue::new(),
                    },
                );
            }
        }

        vio.mapped = match self.map_zones[zone].read_mapping(lbn) {
            Ok(mapping) => mapping,
            Err(error) => {
                self.finish_vio(vio, Err(error));
                return;
            }
        };

        if vio.operation == VioOperation::Discard {
            if !vio.mapped.is_mapped() {
                self.finish_vio(vio, Ok(()));
                return;
            }
            vio.new_mapped = DataLocation::UNMAPPED;
            self.enqueue(ThreadLayout::JOURNAL, IoPriority::Data, Message::Journal(vio));
            return;
        }

        if vio.is_zero {
            self.stats.zero_block_writes += 1;
            vio.new_mapped = DataLocation::ZERO;
            self.enqueue(ThreadLayout::JOURNAL, IoPriority::Data, Message::Journal(vio));
            return;
        }
        self.enqueue(ThreadLayout::DEDUPE, IoPriority::Data, Message::Hash(vio));
    }

    // ── Dedupe/cpu thread ───────────────────────────────────────────────

    fn handle_hash(&mut self, mut vio: Box<DataVio>) {
        let name = fingerprint_block(&vio.data);
        vio.chunk_name = Some(name);
        vio.hash_zone = name.select_zone(self.layout.hash_zones);
        if self.compression_enabled {
            if let Some(fragment) = packer::compress_fragment(&vio.data) {
                vio.compression = CompressionState::Compressed(fragment);
            }
        }
        let hash_thread = self.layout.hash(vio.hash_zone);
        self.enqueue(hash_thread, IoPriority::Data, Message::DedupeQuery(vio));
    }

    // ── Hash zone ───────────────────────────────────────────────────────

    fn handle_dedupe_query(&mut self, vio: Box<DataVio>) {
        if !self.dedupe_enabled {
            self.route_allocation(vio);
            return;
        }
        let name = vio.chunk_name.expect("hashed before query");
        let id = vio.id;
        let deadline = Instant::now() + self.config.dedupe_timeout;
        self.pending_dedupe.insert(id, DedupeWait { vio, deadline });
        self.index.enqueue(IndexRequest {
            id,
            action: RequestAction::Query,
            name,
            advice: None,
            requeued: false,
        });
        self.pump_index();
    }

    fn pump_index(&mut self) {
        if let Err(error) = self.index.pump() {
            warn!(target: "vopt::engine", event = "index_error", error = %error);
        }
        for completed in self.index.drain_completed() {
            let Some(wait) = self.pending_dedupe.remove(&completed.id) else {
                if completed.action == RequestAction::Query {
                    self.stats.late_advice += 1;
                }
                continue;
            };
            let mut vio = wait.vio;
            let advice = completed
                .old_advice
                .filter(|a| a.is_mapped() && !a.is_zero_block());
            match advice {
                Some(advice) if self.depot.config().slab_for(advice.pbn).is_some() => {
                    vio.duplicate = Some(advice);
                    let zone = self
                        .depot
                        .zone_for_pbn(advice.pbn)
                        .expect("advice resolved to a slab");
                    self.enqueue(
                        self.layout.physical(zone),
                        IoPriority::Data,
                        Message::Verify(vio),
                    );
                }
                _ => self.route_allocation(vio),
            }
        }
    }

    fn route_allocation(&mut self, mut vio: Box<DataVio>) {
        if let CompressionState::Compressed(_) = vio.compression {
            if vio.duplicate.is_none() {
                self.enqueue(ThreadLayout::PACKER, IoPriority::Data, Message::Pack(vio));
                return;
            }
        }
        vio.compression = CompressionState::Skipped;
        let zone = self.alloc_cursor % self.layout.physical_zones;
        self.alloc_cursor = self.alloc_cursor.wrapping_add(1);
        self.enqueue(
            self.layout.physical(zone),
            IoPriority::Data,
            Message::Allocate(vio),
        );
    }

    // ── Physical zones ──────────────────────────────────────────────────

    /// Take or share a read lock on `pbn`, returning the lock index, or
    /// `None` when dedupe against this block is not currently possible.
    fn acquire_read_lock(&mut self, zone: usize, pbn: Pbn) -> Option<PbnLockIdx> {
        let status = self.depot.ref_status(pbn).ok()?;
        let increment_limit = match status {
            RefStatus::Count(count) => u32::from(MAXIMUM_REFERENCE_COUNT - count),
            RefStatus::Shared => u32::from(MAXIMUM_REFERENCE_COUNT),
            RefStatus::Free | RefStatus::Provisional => return None,
        };
        let locks = &mut self.pbn_locks[zone];
        if let Some(&idx) = locks.held.get(&pbn.0) {
            let lock = locks.pool.get_mut(idx);
            if !lock.is_read_lock() {
                // A writer owns this block; dedupe misses rather than
                // waiting out the writer.
                return None;
            }
            lock.holder_count += 1;
            return Some(idx);
        }
        let idx = locks.pool.borrow(PbnLockType::Read).ok()?;
        locks.pool.get_mut(idx).set_increment_limit(increment_limit);
        locks.held.insert(pbn.0, idx);
        Some(idx)
    }

    fn handle_verify(&mut self, mut vio: Box<DataVio>) {
        let advice = vio.duplicate.expect("verify without advice");
        let zone = self
            .depot
            .zone_for_pbn(advice.pbn)
            .expect("advice routed to its zone");
        let Some(idx) = self.acquire_read_lock(zone, advice.pbn) else {
            vio.duplicate = None;
            self.route_allocation(vio);
            return;
        };
        vio.held_locks.push((zone, advice.pbn));

        let matches = self
            .read_mapped_data(advice)
            .map(|data| data == vio.data)
            .unwrap_or(false);
        let claimed = matches && self.pbn_locks[zone].pool.get(idx).claim_increment();
        if claimed {
            vio.new_mapped = advice;
            self.stats.dedupe_hits += 1;
            self.enqueue(ThreadLayout::JOURNAL, IoPriority::Data, Message::Journal(vio));
            return;
        }
        if matches {
            trace!(target: "vopt::engine", event = "increment_limit_exhausted", pbn = advice.pbn.0);
        } else {
            self.stats.dedupe_verify_mismatches += 1;
        }
        vio.duplicate = None;
        self.release_pbn_lock(zone, advice.pbn, &mut vio);
        self.route_allocation(vio);
    }

    fn read_mapped_data(&mut self, location: DataLocation) -> Result<Vec<u8>> {
        let raw = self.device.read_block(IoPriority::Data, location.pbn)?;
        match location.state {
            MappingState::Compressed(slot) => packer::unpack_fragment(&raw, slot),
            _ => Ok(raw),
        }
    }

    fn handle_allocate(&mut self, mut vio: Box<DataVio>) {
        let zones = self.layout.physical_zones;
        let preferred = self.alloc_cursor % zones;
        let mut allocated = None;
        for step in 0..zones {
            let zone = (preferred + step) % zones;
            match self.depot.allocate_block(zone) {
                Ok(pbn) => {
                    allocated = Some((zone, pbn));
                    break;
                }
                Err(VoptError::NoSpace) => continue,
                Err(error) => {
                    self.finish_vio(vio, Err(error));
                    return;
                }
            }
        }
        let Some((zone, pbn)) = allocated else {
            self.finish_vio(vio, Err(VoptError::NoSpace));
            return;
        };

        let locks = &mut self.pbn_locks[zone];
        let idx = match locks.pool.borrow(PbnLockType::Write) {
            Ok(idx) => idx,
            Err(error) => {
                let _ = self.depot.release_provisional(pbn);
                self.finish_vio(vio, Err(error));
                return;
            }
        };
        if let Err(error) = locks.pool.get_mut(idx).assign_provisional_reference() {
            let _ = self.depot.release_provisional(pbn);
            self.finish_vio(vio, Err(error));
            return;
        }
        locks.held.insert(pbn.0, idx);
        vio.held_locks.push((zone, pbn));
        vio.allocation = Some(Allocation { pbn, zone });
        vio.new_mapped = DataLocation::new(pbn, MappingState::Uncompressed);

        if let Err(error) = self
            .device
            .write_block(IoPriority::Data, pbn, &vio.data)
        {
            self.stats.write_errors += 1;
            self.finish_vio(vio, Err(error));
            return;
        }
        self.enqueue(ThreadLayout::JOURNAL, IoPriority::Data, Message::Journal(vio));
    }

    fn handle_read_data(&mut self, mut vio: Box<DataVio>) {
        match self.read_mapped_data(vio.mapped) {
            Ok(data) => {
                vio.data = data;
                self.finish_vio(vio, Ok(()));
            }
            Err(error) => self.finish_vio(vio, Err(error)),
        }
    }

    // ── Packer thread ───────────────────────────────────────────────────

    fn handle_pack(&mut self, vio: Box<DataVio>) {
        let CompressionState::Compressed(ref fragment) = vio.compression else {
            self.route_allocation(vio);
            return;
        };
        let fragment_len = fragment.len();
        if !self.packer.fits(fragment_len) {
            self.flush_packer();
        }
        if let PackerVerdict::BinFull = self.packer.add(vio, fragment_len) {
            self.flush_packer();
        }
    }

    /// Write the packer's bin as one physical block, fragments sharing a
    /// compressed-write lock through claimed increments.
    pub(crate) fn flush_packer(&mut self) {
        let bin = self.packer.take_bin();
        if bin.is_empty() {
            return;
        }
        let zones = self.layout.physical_zones;
        let mut allocated = None;
        for step in 0..zones {
            let zone = (self.alloc_cursor + step) % zones;
            if let Ok(pbn) = self.depot.allocate_block(zone) {
                allocated = Some((zone, pbn));
                break;
            }
        }
        let Some((zone, pbn)) = allocated else {
            // No room for a shared block: fall each fragment back to its
            // own uncompressed allocation.
            for mut vio in bin {
                vio.compression = CompressionState::Skipped;
                self.route_allocation(vio);
            }
            return;
        };

        let fragments: Vec<Vec<u8>> = bin
            .iter()
            .map(|vio| match &vio.compression {
                CompressionState::Compressed(bytes) => bytes.clone(),
                CompressionState::Skipped => Vec::new(),
            })
            .collect();
        let packed = match packer::pack_fragments(&fragments) {
            Ok(packed) => packed,
            Err(error) => {
                warn!(target: "vopt::engine", event = "pack_failed", error = %error);
                let _ = self.depot.release_provisional(pbn);
                for mut vio in bin {
                    vio.compression = CompressionState::Skipped;
                    self.route_allocation(vio);
                }
                return;
            }
        };

        let locks = &mut self.pbn_locks[zone];
        let Ok(idx) = locks.pool.borrow(PbnLockType::CompressedWrite) else {
            let _ = self.depot.release_provisional(pbn);
            for mut vio in bin {
                vio.compression = CompressionState::Skipped;
                self.route_allocation(vio);
            }
            return;
        };
        {
            let lock = locks.pool.get_mut(idx);
            lock.holder_count = bin.len() as u32;
            lock.fragment_locks = bin.len() as u8;
            lock.set_increment_limit(bin.len() as u32);
            let _ = lock.assign_provisional_reference();
        }
        locks.held.insert(pbn.0, idx);

        if let Err(error) = self.device.write_block(IoPriority::Data, pbn, &packed) {
            self.stats.write_errors += 1;
            let locks = &mut self.pbn_locks[zone];
            if let Some(idx) = locks.held.remove(&pbn.0) {
                locks.pool.get_mut(idx).unassign_provisional_reference();
                locks.pool.give_back(idx);
            }
            let _ = self.depot.release_provisional(pbn);
            for mut vio in bin {
                vio.compression = CompressionState::Skipped;
                self.route_allocation(vio);
            }
            let _ = error;
            return;
        }

        for (slot, mut vio) in bin.into_iter().enumerate() {
            let lock = self.pbn_locks[zone].pool.get(self.pbn_locks[zone].held[&pbn.0]);
            let claimed = lock.claim_increment();
            debug_assert!(claimed, "fragment increments fit the limit by construction");
            vio.held_locks.push((zone, pbn));
            vio.new_mapped = DataLocation::new(pbn, MappingState::Compressed(slot as u8));
            self.stats.compressed_fragments += 1;
            self.enqueue(ThreadLayout::JOURNAL, IoPriority::Data, Message::Journal(vio));
        }
    }

    // ── Journal thread ──────────────────────────────────────────────────

    /// Before the first mutation after a clean load, mark the super block
    /// dirty so an interrupted run is recovered on the next load.
    fn ensure_super_dirtied(&mut self) -> Result<()> {
        if self.super_block_dirtied {
            return Ok(());
        }
        let mut dirty = self.super_block;
        dirty.clean = false;
        dirty.write(&self.device)?;
        self.super_block.clean = false;
        self.super_block_dirtied = true;
        Ok(())
    }

    /// The slab summary must say "dirty" on disk before the slab's journal
    /// grows past its last save.
    fn ensure_slab_marked_dirty(&mut self, pbn: Pbn) -> Result<()> {
        let Some((slab, _)) = self.depot.config().slab_for(pbn) else {
            return Ok(());
        };
        if self.depot.summary().entry(slab).is_clean {
            self.depot.summary_mut().mark_dirty(slab);
            self.depot.summary_mut().save(&self.device)?;
        }
        Ok(())
    }

    fn enter_read_only(&mut self, error: &VoptError) {
        self.journal.discard_pending();
        self.read_only.enter_read_only(-error_code(error));
        self.admin.finish_operation(AdminState::ReadOnly);
    }

    /// Append a journal entry, relieving space pressure once by flushing
    /// the downstream lock holders (slab journals and block map pages).
    fn append_with_pressure(&mut self, entry: RecoveryJournalEntry) -> Result<JournalPoint> {
        match self.journal.append(entry) {
            Err(VoptError::ComponentBusy(_)) => {
                self.relieve_journal_pressure()?;
                self.journal.append(entry)
            }
            other => other,
        }
    }

    /// Flush slab journals and block map pages so their recovery journal
    /// locks release and the head can advance.
    fn relieve_journal_pressure(&mut self) -> Result<()> {
        for index in 0..self.depot.slab_count() {
            let released = self
                .depot
                .slab_mut(vopt_types::SlabNumber(index))
                .journal
                .commit(&self.device)?;
            for sequence in released {
                self.journal.release_lock(sequence, JournalLock::SlabJournal);
            }
        }
        for zone in 0..self.map_zones.len() {
            self.map_zones[zone].flush_all()?;
            self.sync_map_locks(zone);
        }
        debug!(target: "vopt::engine", event = "journal_pressure_relieved");
        Ok(())
    }

    /// Apply one reference operation through the slab journal, releasing
    /// the recovery journal locks the commit freed.
    fn adjust_reference(
        &mut self,
        pbn: Pbn,
        operation: JournalOperation,
        point: JournalPoint,
    ) -> Result<()> {
        self.ensure_slab_marked_dirty(pbn)?;
        let (_status, released) = self
            .depot
            .adjust_reference(&self.device, pbn, operation, point)?;
        for sequence in released {
            self.journal.release_lock(sequence, JournalLock::SlabJournal);
        }
        Ok(())
    }

    fn sync_map_locks(&mut self, zone: usize) {
        let current: BTreeSet<SequenceNumber> =
            self.map_zones[zone].cache().dirty_eras().into_iter().collect();
        let held = std::mem::take(&mut self.map_lock_eras[zone]);
        for &era in current.difference(&held) {
            self.journal.acquire_lock(era, JournalLock::BlockMap);
        }
        for &era in held.difference(&current) {
            self.journal.release_lock(era, JournalLock::BlockMap);
        }
        self.map_lock_eras[zone] = current;
    }

    fn handle_journal(&mut self, mut vio: Box<DataVio>) {
        // The authoritative re-check: a write admitted under a stale
        // per-thread cache is discarded here instead of journalled.
        if self.read_only.is_read_only_authoritative() {
            self.journal.discard_pending();
            self.finish_vio(vio, Err(VoptError::ReadOnly));
            return;
        }
        if let Err(error) = self.ensure_super_dirtied() {
            self.enter_read_only(&error);
            self.finish_vio(vio, Err(VoptError::ReadOnly));
            return;
        }

        let zone = vio.logical_zone;
        // Resolve the leaf slot, allocating tree pages as needed; each
        // allocation is journalled as a block map increment before any
        // entry that uses the new page.
        let era_hint = self.journal.tail();
        let mut new_pages: Vec<AllocatedTreePage> = Vec::new();
        let slot = {
            let mut allocator = DepotTreeAllocator {
                depot: &mut self.depot,
                zone_cursor: &mut self.alloc_cursor,
                zones: self.layout.physical_zones,
            };
            match self.map_zones[zone].resolve_slot(
                vio.lbn,
                era_hint,
                Some(&mut allocator),
                &mut new_pages,
            ) {
                Ok(Some(slot)) => slot,
                Ok(None) => unreachable!("allocating resolve always returns a slot"),
                Err(error) => {
                    self.enter_read_only(&error);
                    self.finish_vio(vio, Err(VoptError::ReadOnly));
                    return;
                }
            }
        };
        vio.tree_slot = Some(slot);

        for page in &new_pages {
            let entry = RecoveryJournalEntry {
                operation: JournalOperation::BlockMapIncrement,
                slot: page.parent,
                mapping: DataLocation::new(page.pbn, MappingState::Uncompressed),
            };
            let point = match self.append_with_pressure(entry) {
                Ok(point) => point,
                Err(error) => {
                    self.enter_read_only(&error);
                    self.finish_vio(vio, Err(VoptError::ReadOnly));
                    return;
                }
            };
            if let Err(error) =
                self.adjust_reference(page.pbn, JournalOperation::BlockMapIncrement, point)
            {
                self.enter_read_only(&error);
                self.finish_vio(vio, Err(VoptError::ReadOnly));
                return;
            }
            self.journal.block_map_data_blocks += 1;
        }

        // Decrement of the old mapping precedes the increment of the new,
        // so in-order replay converges on the final mapping.
        let old = vio.mapped;
        let new = vio.new_mapped;
        let mut dec_point = None;
        let mut inc_point = None;
        if old.is_mapped() {
            let entry = RecoveryJournalEntry {
                operation: JournalOperation::DataDecrement,
                slot,
                mapping: old,
            };
            match self.append_with_pressure(entry) {
                Ok(point) => dec_point = Some(point),
                Err(error) => {
                    self.enter_read_only(&error);
                    self.finish_vio(vio, Err(VoptError::ReadOnly));
                    return;
                }
            }
        }
        if new.is_mapped() {
            let entry = RecoveryJournalEntry {
                operation: JournalOperation::DataIncrement,
                slot,
                mapping: new,
            };
            match self.append_with_pressure(entry) {
                Ok(point) => inc_point = Some(point),
                Err(error) => {
                    self.enter_read_only(&error);
                    self.finish_vio(vio, Err(VoptError::ReadOnly));
                    return;
                }
            }
        }

        // Commit: the entries are durable before any downstream effect.
        let committed = match self.journal.commit(vio.requires_fua()) {
            Ok(sequence) => sequence,
            Err(error) => {
                self.enter_read_only(&error);
                self.finish_vio(vio, Err(VoptError::ReadOnly));
                return;
            }
        };

        // Block map update, dirtied in the era of its covering entry.
        let era = inc_point.or(dec_point).map_or(committed, |p| p.sequence_number);
        let previous = match self.map_zones[zone].update_slot(slot, new, era) {
            Ok(previous) => previous,
            Err(error) => {
                self.enter_read_only(&error);
                self.finish_vio(vio, Err(VoptError::ReadOnly));
                return;
            }
        };
        debug_assert_eq!(previous, old, "mapping changed under the logical lock");
        self.sync_map_locks(zone);

        // Reference count deltas through the slab journals.
        if let Some(point) = dec_point {
            if old.is_zero_block() || self.depot.config().slab_for(old.pbn).is_none() {
                self.journal
                    .release_lock(point.sequence_number, JournalLock::SlabJournal);
            } else if let Err(error) =
                self.adjust_reference(old.pbn, JournalOperation::DataDecrement, point)
            {
                self.enter_read_only(&error);
                self.finish_vio(vio, Err(VoptError::ReadOnly));
                return;
            }
        }
        if let Some(point) = inc_point {
            if new.is_zero_block() {
                self.journal
                    .release_lock(point.sequence_number, JournalLock::SlabJournal);
            } else if let Err(error) =
                self.adjust_reference(new.pbn, JournalOperation::DataIncrement, point)
            {
                self.enter_read_only(&error);
                self.finish_vio(vio, Err(VoptError::ReadOnly));
                return;
            } else if let Some(allocation) = vio.allocation {
                // The provisional reference just became a real count.
                let locks = &mut self.pbn_locks[allocation.zone];
                if let Some(&idx) = locks.held.get(&allocation.pbn.0) {
                    locks.pool.get_mut(idx).unassign_provisional_reference();
                }
            } else if new.state.is_compressed() {
                let zone = self
                    .depot
                    .zone_for_pbn(new.pbn)
                    .expect("compressed block lives in the depot");
                let locks = &mut self.pbn_locks[zone];
                if let Some(&idx) = locks.held.get(&new.pbn.0) {
                    locks.pool.get_mut(idx).unassign_provisional_reference();
                }
            }
        }

        // Logical space accounting.
        if !old.is_mapped() && new.is_mapped() {
            self.journal.logical_blocks_used += 1;
        } else if old.is_mapped() && !new.is_mapped() {
            self.journal.logical_blocks_used =
                self.journal.logical_blocks_used.saturating_sub(1);
        }

        // Era advance: age out block map pages dirtied too long ago.
        self.advance_era(committed);

        let name = vio.chunk_name;
        let duplicate = vio.duplicate.is_some();
        self.finish_vio(vio, Ok(()));

        // Record fresh advice for a write that created a new location.
        if self.dedupe_enabled && !duplicate {
            if let (Some(name), true) = (name, new.is_mapped() && !new.is_zero_block()) {
                let id = self.next_id;
                self.next_id += 1;
                self.index.enqueue(IndexRequest {
                    id,
                    action: RequestAction::Update,
                    name,
                    advice: Some(new),
                    requeued: false,
                });
                self.pump_index();
            }
        }
    }

    fn advance_era(&mut self, committed: SequenceNumber) {
        let cutoff = committed.saturating_sub(self.config.block_map_maximum_age);
        if cutoff == 0 {
            return;
        }
        for zone in 0..self.map_zones.len() {
            match self.map_zones[zone].expire_before(cutoff) {
                Ok(_released) => self.sync_map_locks(zone),
                Err(error) => {
                    warn!(
                        target: "vopt::engine",
                        event = "era_writeback_failed",
                        error = %error,
                    );
                    self.enter_read_only(&error);
                    return;
                }
            }
        }
    }

    fn handle_flush(&mut self, vio: Box<DataVio>) {
        if self.read_only.is_read_only_authoritative() {
            self.finish_vio(vio, Err(VoptError::ReadOnly));
            return;
        }
        let result = self
            .journal
            .commit(true)
            .and_then(|_| self.device.flush());
        match result {
            Ok(()) => self.finish_vio(vio, Ok(())),
            Err(error) => {
                self.enter_read_only(&error);
                self.finish_vio(vio, Err(VoptError::ReadOnly));
            }
        }
    }

    // ── Completion ──────────────────────────────────────────────────────

    fn release_pbn_lock(&mut self, zone: usize, pbn: Pbn, vio: &mut Box<DataVio>) {
        vio.held_locks.retain(|&(z, p)| !(z == zone && p == pbn));
        let locks = &mut self.pbn_locks[zone];
        let Some(&idx) = locks.held.get(&pbn.0) else {
            return;
        };
        let lock = locks.pool.get_mut(idx);
        lock.holder_count = lock.holder_count.saturating_sub(1);
        if lock.holder_count > 0 {
            return;
        }
        let provisional = lock.has_provisional_reference();
        lock.unassign_provisional_reference();
        locks.held.remove(&pbn.0);
        locks.pool.give_back(idx);
        if provisional {
            // The allocation never committed: drop the reservation.
            if let Err(error) = self.depot.release_provisional(pbn) {
                warn!(
                    target: "vopt::engine",
                    event = "provisional_release_failed",
                    pbn = pbn.0,
                    error = %error,
                );
            }
        }
    }

    fn finish_vio(&mut self, mut vio: Box<DataVio>, result: Result<()>) {
        // Drop PBN locks.
        while let Some(&(zone, pbn)) = vio.held_locks.last() {
            self.release_pbn_lock(zone, pbn, &mut vio);
        }
        // Drop the logical lock and wake the next writer in line.
        let zone = vio.logical_zone;
        let release_lbn = self.logical_locks[zone]
            .get(&vio.lbn.0)
            .is_some_and(|lock| lock.holder == vio.id);
        if release_lbn {
            if let Some(mut lock) = self.logical_locks[zone].remove(&vio.lbn.0) {
                let mut next = Vec::new();
                let mut collect = |waiter: Box<DataVio>| next.push(waiter);
                while lock.waiters.notify_next(&mut collect) {}
                for waiter in next {
                    let thread = self.layout.logical(waiter.logical_zone);
                    self.enqueue(thread, IoPriority::Data, Message::Launch(waiter));
                }
            }
        }
        if result.is_err() {
            trace!(
                target: "vopt::engine",
                event = "vio_failed",
                vio = vio.id,
                lbn = vio.lbn.0,
            );
        }
        vio.complete(result);
        self.in_flight -= 1;
        self.pool.release(vio);

        // A freed vio can admit a parked submission.
        if let Some(parked) = self.pending_submissions.pop_front() {
            self.submit(parked.operation, parked.lbn, parked.data, parked.completion);
        }
    }

    // ── Recovery ────────────────────────────────────────────────────────

    fn recover(
        device: &Arc<dyn BlockIo>,
        super_block: &SuperBlock,
        depot: &mut SlabDepot,
        scrubber: &mut SlabScrubber,
    ) -> Result<RecoveredState> {
        let journal_config = super_block.journal_config();
        let blocks = load_journal_region(device, &journal_config)?;
        let Some(found) = find_head_and_tail(&journal_config, &blocks) else {
            // Nothing was ever journalled; only summary-dirty slabs need
            // scrubbing.
            for slab in depot.unrecovered_slabs() {
                scrubber.register_slab(slab, true);
            }
            scrubber.set_high_priority_only(true);
            scrubber.scrub_slabs(depot, device)?;
            scrubber.set_high_priority_only(false);
            return Ok(RecoveredState {
                next_sequence: super_block.journal_start,
                logical_blocks_used: super_block.logical_blocks_used,
                block_map_data_blocks: super_block.block_map_data_blocks,
            });
        };
        info!(
            target: "vopt::engine",
            event = "recovery_scan",
            tail = found.tail,
            block_map_head = found.block_map_head,
            slab_journal_head = found.slab_journal_head,
        );

        // Last recovery point each slab journal has already admitted.
        let mut slab_points: HashMap<u32, JournalPoint> = HashMap::new();
        for slab_index in 0..depot.slab_count() {
            let number = vopt_types::SlabNumber(slab_index);
            let journal = vopt_depot::SlabJournalConfig {
                origin: depot.config().journal_origin(number),
                size: depot.config().journal_blocks,
                nonce: depot.config().nonce,
            };
            let scanned = vopt_depot::scan_region(device, &journal)?;
            if let Some((header, _)) = scanned.last() {
                slab_points.insert(slab_index, header.recovery_point);
                // Supplemental entries must append after the existing
                // blocks, never over them.
                depot.slab_mut(number).journal =
                    vopt_depot::SlabJournal::new(journal, header.sequence_number + 1);
            }
        }

        let bounds = EntryBounds {
            physical_blocks: super_block.physical_blocks,
            entries_per_page: vopt_types::BLOCK_MAP_ENTRIES_PER_PAGE as u16,
        };
        let geometry = super_block.block_map_geometry();
        let mut rebuild_zone = BlockMapZone::new(device.clone(), geometry, 64);
        let mut touched: BTreeSet<u32> = BTreeSet::new();
        // Replay from the older of the two heads, but never from a slot
        // already overwritten by a later lap of the circular region.
        let head = found
            .block_map_head
            .min(found.slab_journal_head)
            .max(found.tail.saturating_sub(journal_config.size - 1))
            .max(1);
        let depot_config = *depot.config();

        {
            let mut apply = |point: JournalPoint, entry: &RecoveryJournalEntry| -> Result<()> {
                validate_entry(entry, &bounds)?;
                // Block map effect: increments install the mapping,
                // decrements clear a still-matching slot.
                match entry.operation {
                    JournalOperation::DataIncrement | JournalOperation::BlockMapIncrement => {
                        rebuild_zone.update_slot(entry.slot, entry.mapping, 0)?;
                    }
                    JournalOperation::DataDecrement | JournalOperation::BlockMapDecrement => {
                        let current = rebuild_zone.read_slot(entry.slot)?;
                        if current == entry.mapping {
                            rebuild_zone.update_slot(entry.slot, DataLocation::UNMAPPED, 0)?;
                        }
                    }
                }
                // Slab journal effect: re-add entries the slab journals
                // never saw.
                if entry.mapping.is_mapped() && !entry.mapping.is_zero_block() {
                    if let Some((slab, sbn)) = depot_config.slab_for(entry.mapping.pbn) {
                        let seen = slab_points
                            .get(&slab.0)
                            .copied()
                            .unwrap_or_default();
                        if point > seen {
                            depot.slab_mut(slab).journal.append(
                                device,
                                vopt_depot::SlabJournalEntry {
                                    sbn,
                                    operation: entry.operation,
                                },
                                point,
                            )?;
                            touched.insert(slab.0);
                        }
                    }
                }
                Ok(())
            };
            replay(&journal_config, &blocks, head, found.tail, &bounds, &mut apply)?;
        }
        rebuild_zone.flush_all()?;

        // Seal the supplemented slab journals, then scrub everything
        // suspect.
        let mut to_scrub: BTreeSet<u32> = touched.clone();
        for slab in depot.unrecovered_slabs() {
            to_scrub.insert(slab.0);
        }
        for &slab in &touched {
            depot
                .slab_mut(vopt_types::SlabNumber(slab))
                .journal
                .commit(device)?;
        }
        scrubber.set_high_priority_only(true);
        for slab in &to_scrub {
            scrubber.register_slab(vopt_types::SlabNumber(*slab), true);
        }
        scrubber.scrub_slabs(depot, device)?;
        scrubber.set_high_priority_only(false);

        info!(
            target: "vopt::engine",
            event = "recovery_complete",
            scrubbed = to_scrub.len(),
            next_sequence = found.tail + 1,
        );
        Ok(RecoveredState {
            next_sequence: found.tail + 1,
            logical_blocks_used: found.logical_blocks_used,
            block_map_data_blocks: found.block_map_data_blocks,
        })
    }

    // ── Admin operations ────────────────────────────────────────────────

    /// Suspend: drain everything in phase order and persist a clean super
    /// block. A read-only outcome still reports success — the device is
    /// suspended either way.
    pub fn suspend(&mut self) -> Result<()> {
        if self.admin.is_suspended() {
            return Ok(());
        }
        self.admin.start_operation(AdminOperation::Suspend)?;
        for phase in suspend_phases() {
            debug!(target: "vopt::admin", event = "suspend_phase", phase = ?phase);
            match phase {
                SuspendPhase::Start => {}
                SuspendPhase::DrainPacker => {
                    self.flush_packer();
                    self.pump();
                }
                SuspendPhase::DrainDataVios => {
                    // Advice that has not arrived is forfeited.
                    let waiting: Vec<u64> = self.pending_dedupe.keys().copied().collect();
                    for id in waiting {
                        if let Some(wait) = self.pending_dedupe.remove(&id) {
                            self.stats.advice_timeouts += 1;
                            self.route_allocation(wait.vio);
                        }
                    }
                    self.pump();
                }
                SuspendPhase::DrainFlusher => {
                    if let Err(error) = self.device.flush() {
                        self.enter_read_only(&error);
                    }
                }
                SuspendPhase::DrainLogicalZones | SuspendPhase::DrainBlockMap => {
                    for zone in 0..self.map_zones.len() {
                        match self.map_zones[zone].flush_all() {
                            Ok(_) => self.sync_map_locks(zone),
                            Err(error) => {
                                self.enter_read_only(&error);
                                break;
                            }
                        }
                    }
                }
                SuspendPhase::DrainJournal => {
                    if !self.read_only.is_read_only_authoritative() {
                        if let Err(error) =
                            self.journal.commit(false).and_then(|_| self.device.flush())
                        {
                            self.enter_read_only(&error);
                        }
                    }
                }
                SuspendPhase::DrainDepot => {
                    if !self.read_only.is_read_only_authoritative() {
                        match self.depot.save_all(&self.device) {
                            Ok(released) => {
                                for sequence in released {
                                    self.journal
                                        .release_lock(sequence, JournalLock::SlabJournal);
                                }
                            }
                            Err(error) => self.enter_read_only(&error),
                        }
                    }
                }
                SuspendPhase::WaitReadOnly => {
                    // Listener walks happen inline on this thread.
                }
                SuspendPhase::WriteSuperBlock => {
                    if !self.read_only.is_read_only_authoritative() {
                        let mut saved = self.super_block;
                        saved.clean = true;
                        saved.journal_start = self.journal.tail();
                        saved.logical_blocks_used = self.journal.logical_blocks_used;
                        saved.block_map_data_blocks = self.journal.block_map_data_blocks;
                        saved.recovery_count = self.journal.recovery_count();
                        saved.index_newest_closed =
                            self.index.volume().newest_closed().unwrap_or(u64::MAX);
                        match saved.write(&self.device) {
                            Ok(()) => {
                                self.super_block = saved;
                                self.super_block_dirtied = false;
                            }
                            Err(error) => self.enter_read_only(&error),
                        }
                    }
                }
                SuspendPhase::End => {}
            }
        }
        self.admin.finish_operation(AdminState::Suspended);
        info!(
            target: "vopt::admin",
            event = "suspended",
            read_only = self.read_only.is_read_only_authoritative(),
        );
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.admin.start_operation(AdminOperation::Resume)?;
        let _ = self
            .scrubber
            .resume_scrubbing(&mut self.depot, &self.device);
        let state = if self.read_only.is_read_only_authoritative() {
            AdminState::ReadOnly
        } else {
            AdminState::Operating
        };
        self.admin.finish_operation(state);
        Ok(())
    }

    pub fn grow_logical(&mut self, new_logical_blocks: u64) -> Result<()> {
        self.admin.start_operation(AdminOperation::GrowLogical)?;
        let result = (|| -> Result<()> {
            for zone in self.map_zones.iter_mut() {
                zone.grow_logical(new_logical_blocks)?;
            }
            self.super_block.logical_blocks = new_logical_blocks;
            self.super_block.write(&self.device)
        })();
        self.admin.finish_operation(AdminState::Suspended);
        result
    }

    pub fn grow_physical(&mut self, added_slabs: u32) -> Result<()> {
        self.admin.start_operation(AdminOperation::GrowPhysical)?;
        let result = (|| -> Result<()> {
            // Every allocated tree page must stay accounted for in the
            // grown depot.
            let mut tree_pages = 0u64;
            for zone in 0..self.map_zones.len() {
                self.map_zones[zone].traverse(
                    self.layout.logical_zones,
                    zone,
                    &mut |_pbn| {
                        tree_pages += 1;
                        Ok(())
                    },
                )?;
            }
            debug!(
                target: "vopt::admin",
                event = "grow_physical_traverse",
                tree_pages,
            );
            self.depot.grow(&self.device, added_slabs)?;
            self.super_block.slab_count = self.depot.slab_count();
            self.super_block.physical_blocks = self
                .super_block
                .physical_blocks
                .max(self.depot.config().end().0);
            self.super_block.write(&self.device)
        })();
        self.admin.finish_operation(AdminState::Suspended);
        result
    }

    pub fn set_compression(&mut self, enabled: bool) {
        if !enabled {
            self.flush_packer();
            self.pump();
        }
        self.compression_enabled = enabled;
    }

    pub fn set_deduplication(&mut self, enabled: bool) {
        self.dedupe_enabled = enabled;
    }

    /// Stall or unstall the dedupe index (test and maintenance hook).
    pub fn set_index_stalled(&mut self, stalled: bool) {
        self.index.set_stalled(stalled);
        if !stalled {
            self.pump_index();
            self.pump();
        }
    }

    #[must_use]
    pub fn admin_state(&self) -> AdminState {
        self.admin.state()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.is_read_only_authoritative()
    }

    pub fn register_read_only_listener(
        &mut self,
        thread: usize,
        listener: crate::read_only::ReadOnlyListener,
    ) {
        self.read_only.register_listener(thread, listener);
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.layout.total()
    }

    /// Point-in-time counters.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            engine: self.stats,
            logical_blocks_used: self.journal.logical_blocks_used,
            block_map_data_blocks: self.journal.block_map_data_blocks,
            depot_free_blocks: self.depot.free_blocks(),
            journal_blocks_committed: self.journal.stats().blocks_committed,
            journal_blocks_reaped: self.journal.stats().blocks_reaped,
            index_hits: self.index.stats().hits,
            index_chapters_closed: self.index.stats().chapters_closed,
            in_flight: self.in_flight,
            read_only: self.read_only.is_read_only_authoritative(),
        }
    }

    /// Human-readable status dump.
    #[must_use]
    pub fn dump_status(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "admin state: {:?}", self.admin.state());
        let _ = writeln!(out, "read only: {}", self.read_only.is_read_only_authoritative());
        let _ = writeln!(
            out,
            "journal: head {} tail {} committed {} reaped {}",
            self.journal.head(),
            self.journal.tail(),
            self.journal.stats().blocks_committed,
            self.journal.stats().blocks_reaped,
        );
        let _ = writeln!(
            out,
            "depot: {} slabs, {} free blocks, {} scrubbed",
            self.depot.slab_count(),
            self.depot.free_blocks(),
            self.scrubber.slabs_scrubbed(),
        );
        let _ = writeln!(
            out,
            "index: {} closed chapters, {} hits, {} pending",
            self.index.stats().chapters_closed,
            self.index.stats().hits,
            self.index.pending_requests(),
        );
        let _ = writeln!(
            out,
            "vios: {} in flight, {} parked submissions, packer bin {}",
            self.in_flight,
            self.pending_submissions.len(),
            self.packer.pending(),
        );
        out
    }

    /// Per-thread queue depths.
    #[must_use]
    pub fn dump_work_queues(&self) -> String {
        let mut out = String::new();
        for (thread, queue) in self.queues.iter().enumerate() {
            let name = self.thread_name(thread);
            let _ = writeln!(
                out,
                "thread {thread} ({name}): {} high, {} normal",
                queue.high.len(),
                queue.normal.len(),
            );
        }
        out
    }

    fn thread_name(&self, thread: usize) -> String {
        match thread {
            ThreadLayout::ADMIN => "admin".to_owned(),
            ThreadLayout::JOURNAL => "journal".to_owned(),
            ThreadLayout::PACKER => "packer".to_owned(),
            ThreadLayout::DEDUPE => "dedupe".to_owned(),
            t if t < ThreadLayout::ZONE_BASE + self.layout.logical_zones => {
                format!("logical{}", t - ThreadLayout::ZONE_BASE)
            }
            t if t < ThreadLayout::ZONE_BASE
                + self.layout.logical_zones
                + self.layout.physical_zones =>
            {
                format!(
                    "physical{}",
                    t - ThreadLayout::ZONE_BASE - self.layout.logical_zones
                )
            }
            t => format!(
                "hash{}",
                t - ThreadLayout::ZONE_BASE
                    - self.layout.logical_zones
                    - self.layout.physical_zones
            ),
        }
    }

    // Test-facing accessors; the harness asserts invariants through these.

    pub fn ref_status_of(&self, pbn: Pbn) -> Result<RefStatus> {
        self.depot.ref_status(pbn)
    }

    pub fn mapping_of(&mut self, lbn: Lbn) -> Result<DataLocation> {
        let zone = self.logical_zone_for(lbn);
        self.map_zones[zone].read_mapping(lbn)
    }

    #[must_use]
    pub fn depot(&self) -> &SlabDepot {
        &self.depot
    }
}

struct RecoveredState {
    next_sequence: SequenceNumber,
    logical_blocks_used: u64,
    block_map_data_blocks: u64,
}

/// Map an error to the negative code surfaced through the read-only word.
fn error_code(error: &VoptError) -> i32 {
    match error {
        VoptError::Io(_) => 5,
        VoptError::CorruptJournal(_) => 74,
        VoptError::BadState(_) => 22,
        VoptError::NoSpace => 28,
        _ => 1,
    }
}

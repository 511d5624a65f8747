//! The request pipeline: triage → index → callback.
//!
//! Client requests are routed to an index zone by fingerprint low bits and
//! processed against that zone's open chapter shard, then the volume.
//! Control requests travel the same per-zone queues, distinguished by
//! variant: `announce-chapter-closed` collects every zone's shard before
//! the next chapter opens, and `sparse-cache-barrier` fences all zones
//! before a sparse chapter enters the shared cache.
//!
//! A zone that has contributed to a pending close, or fenced at a pending
//! barrier, parks its queue until the operation completes; close precedes
//! acknowledgement, so the next chapter opens only after every zone has
//! sealed its shard for the previous one.

use crate::geometry::IndexGeometry;
use crate::open_chapter::{OpenChapterRecord, OpenChapterZone};
use crate::volume::{SearchOutcome, Volume};
use std::collections::VecDeque;
use tracing::{debug, trace};
use vopt_error::Result;
use vopt_types::{ChunkName, DataLocation};

/// A client action on the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// Record new advice; returns prior advice when the name is known.
    Post,
    /// Overwrite advice for a name.
    Update,
    /// Remove a name from the open chapter.
    Delete,
    /// Look up advice without modifying anything.
    Query,
}

/// One client request.
#[derive(Debug, Clone, Copy)]
pub struct IndexRequest {
    pub id: u64,
    pub action: RequestAction,
    pub name: ChunkName,
    pub advice: Option<DataLocation>,
    /// Set when the request went around a sparse-cache barrier.
    pub requeued: bool,
}

/// A finished request, delivered by the callback stage.
#[derive(Debug, Clone, Copy)]
pub struct CompletedRequest {
    pub id: u64,
    pub action: RequestAction,
    pub name: ChunkName,
    /// Advice the index held for the name before this request took effect.
    pub old_advice: Option<DataLocation>,
}

/// Items on a zone's queue: client requests and control requests share it.
#[derive(Debug)]
enum ZoneItem {
    Client(IndexRequest),
    AnnounceChapterClosed { virtual_chapter: u64 },
    SparseCacheBarrier { virtual_chapter: u64 },
}

struct RouterZone {
    open: OpenChapterZone,
    virtual_chapter: u64,
    queue: VecDeque<ZoneItem>,
    waiting_close: bool,
    waiting_barrier: bool,
}

impl RouterZone {
    fn parked(&self) -> bool {
        self.waiting_close || self.waiting_barrier
    }
}

struct PendingClose {
    virtual_chapter: u64,
    records: Vec<OpenChapterRecord>,
    contributions: u32,
}

struct PendingBarrier {
    virtual_chapter: u64,
    request: IndexRequest,
    origin_zone: usize,
    fenced: u32,
}

/// Counters for the stats interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexStats {
    pub posts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub queries: u64,
    pub hits: u64,
    pub chapters_closed: u64,
    pub cache_barriers: u64,
}

/// The index router: all zones' shards, the volume, and the pipeline state.
pub struct IndexRouter {
    geometry: IndexGeometry,
    zones: Vec<RouterZone>,
    volume: Volume,
    completed: VecDeque<CompletedRequest>,
    pending_close: Option<PendingClose>,
    pending_barrier: Option<PendingBarrier>,
    stalled: bool,
    stats: IndexStats,
}

impl IndexRouter {
    pub fn new(geometry: IndexGeometry, volume: Volume) -> Result<Self> {
        geometry.validate()?;
        // A reloaded volume resumes filling the chapter after its newest
        // closed one.
        let open_chapter = volume.newest_closed().map_or(0, |n| n + 1);
        let zones = (0..geometry.zone_count)
            .map(|_| RouterZone {
                open: OpenChapterZone::new(
                    geometry.zone_capacity(),
                    geometry.open_chapter_load_ratio,
                ),
                virtual_chapter: open_chapter,
                queue: VecDeque::new(),
                waiting_close: false,
                waiting_barrier: false,
            })
            .collect();
        Ok(Self {
            geometry,
            zones,
            volume,
            completed: VecDeque::new(),
            pending_close: None,
            pending_barrier: None,
            stalled: false,
            stats: IndexStats::default(),
        })
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    #[must_use]
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Test and timeout hook: a stalled index accepts requests but
    /// processes nothing.
    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Requests queued and not yet completed.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.zones.iter().map(|z| z.queue.len()).sum::<usize>()
            + usize::from(self.pending_barrier.is_some())
    }

    /// Triage stage: route by fingerprint to the owning zone's queue.
    pub fn enqueue(&mut self, request: IndexRequest) {
        let zone = self.geometry.zone_for(&request.name);
        trace!(
            target: "vopt::index",
            event = "request_triaged",
            id = request.id,
            zone,
        );
        self.zones[zone].queue.push_back(ZoneItem::Client(request));
    }

    /// Callback stage: take everything that finished.
    pub fn drain_completed(&mut self) -> Vec<CompletedRequest> {
        self.completed.drain(..).collect()
    }

    /// Index stage: run queued work until quiescent (or stalled).
    pub fn pump(&mut self) -> Result<()> {
        if self.stalled {
            return Ok(());
        }
        loop {
            let mut progressed = false;
            for zone_index in 0..self.zones.len() {
                while !self.zones[zone_index].parked() && !self.stalled {
                    let Some(item) = self.zones[zone_index].queue.pop_front() else {
                        break;
                    };
                    self.process_item(zone_index, item)?;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn complete(&mut self, request: &IndexRequest, old_advice: Option<DataLocation>) {
        if old_advice.is_some() {
            self.stats.hits += 1;
        }
        self.completed.push_back(CompletedRequest {
            id: request.id,
            action: request.action,
            name: request.name,
            old_advice,
        });
    }

    fn process_item(&mut self, zone_index: usize, item: ZoneItem) -> Result<()> {
        match item {
            ZoneItem::Client(request) => self.process_client(zone_index, request),
            ZoneItem::AnnounceChapterClosed { virtual_chapter } => {
                if self.zones[zone_index].virtual_chapter == virtual_chapter {
                    self.contribute_to_close(zone_index)?;
                }
                // Else stale: the close already completed through another
                // path.
                Ok(())
            }
            ZoneItem::SparseCacheBarrier { virtual_chapter } => {
                self.fence_at_barrier(zone_index, virtual_chapter)
            }
        }
    }

    fn process_client(&mut self, zone_index: usize, request: IndexRequest) -> Result<()> {
        match request.action {
            RequestAction::Query => {
                self.stats.queries += 1;
                let open_hit = self.zones[zone_index].open.search(&request.name);
                if let Some(advice) = open_hit {
                    self.complete(&request, Some(advice));
                    return Ok(());
                }
                match self.volume.search(&request.name, request.requeued)? {
                    SearchOutcome::Found(advice) => self.complete(&request, Some(advice)),
                    SearchOutcome::NotFound => self.complete(&request, None),
                    SearchOutcome::NeedsCacheBarrier(chapter) => {
                        return self.begin_barrier(zone_index, chapter, request);
                    }
                }
                Ok(())
            }
            RequestAction::Post => {
                self.stats.posts += 1;
                let open_hit = self.zones[zone_index].open.search(&request.name);
                if let Some(advice) = open_hit {
                    self.complete(&request, Some(advice));
                    return Ok(());
                }
                match self.volume.search(&request.name, request.requeued)? {
                    SearchOutcome::Found(advice) => {
                        self.complete(&request, Some(advice));
                        Ok(())
                    }
                    SearchOutcome::NeedsCacheBarrier(chapter) => {
                        self.begin_barrier(zone_index, chapter, request)
                    }
                    SearchOutcome::NotFound => {
                        let advice = request.advice.unwrap_or(DataLocation::UNMAPPED);
                        let remaining =
                            self.zones[zone_index].open.put(request.name, advice)?;
                        self.complete(&request, None);
                        if remaining == 0 {
                            self.begin_close(zone_index)?;
                        }
                        Ok(())
                    }
                }
            }
            RequestAction::Update => {
                self.stats.updates += 1;
                let old = self.zones[zone_index].open.search(&request.name);
                let advice = request.advice.unwrap_or(DataLocation::UNMAPPED);
                let remaining = self.zones[zone_index].open.put(request.name, advice)?;
                self.complete(&request, old);
                if remaining == 0 {
                    self.begin_close(zone_index)?;
                }
                Ok(())
            }
            RequestAction::Delete => {
                self.stats.deletes += 1;
                let removed = self.zones[zone_index].open.remove(&request.name);
                let old = if removed {
                    request.advice
                } else {
                    None
                };
                self.complete(&request, old);
                Ok(())
            }
        }
    }

    /// A zone's shard filled: close this virtual chapter across all zones.
    fn begin_close(&mut self, zone_index: usize) -> Result<()> {
        let virtual_chapter = self.zones[zone_index].virtual_chapter;
        match &self.pending_close {
            None => {
                debug!(
                    target: "vopt::index",
                    event = "chapter_close_started",
                    virtual_chapter,
                    zone = zone_index,
                );
                self.pending_close = Some(PendingClose {
                    virtual_chapter,
                    records: Vec::new(),
                    contributions: 0,
                });
                for other in 0..self.zones.len() {
                    if other != zone_index {
                        self.zones[other]
                            .queue
                            .push_back(ZoneItem::AnnounceChapterClosed { virtual_chapter });
                    }
                }
                self.contribute_to_close(zone_index)
            }
            Some(pending) if pending.virtual_chapter == virtual_chapter => {
                // Another zone already announced; just seal this shard.
                self.contribute_to_close(zone_index)
            }
            Some(_) => Ok(()),
        }
    }

    fn contribute_to_close(&mut self, zone_index: usize) -> Result<()> {
        if self.zones[zone_index].waiting_close {
            return Ok(());
        }
        let records = self.zones[zone_index].open.close();
        self.zones[zone_index].waiting_close = true;
        let Some(pending) = self.pending_close.as_mut() else {
            return Ok(());
        };
        pending.records.extend(records);
        pending.contributions += 1;
        if pending.contributions == self.geometry.zone_count {
            self.finish_close()?;
        }
        Ok(())
    }

    fn finish_close(&mut self) -> Result<()> {
        let Some(pending) = self.pending_close.take() else {
            return Ok(());
        };
        self.volume
            .write_chapter(pending.virtual_chapter, pending.records)?;
        for zone in &mut self.zones {
            zone.virtual_chapter = pending.virtual_chapter + 1;
            zone.waiting_close = false;
        }
        self.stats.chapters_closed += 1;
        debug!(
            target: "vopt::index",
            event = "chapter_closed",
            virtual_chapter = pending.virtual_chapter,
        );
        Ok(())
    }

    /// Fence every zone, fill the sparse cache, then requeue the request.
    fn begin_barrier(
        &mut self,
        zone_index: usize,
        virtual_chapter: u64,
        request: IndexRequest,
    ) -> Result<()> {
        if self.pending_barrier.is_some() {
            // One barrier at a time; retry once the current one clears.
            self.zones[zone_index]
                .queue
                .push_back(ZoneItem::Client(request));
            return Ok(());
        }
        self.stats.cache_barriers += 1;
        self.pending_barrier = Some(PendingBarrier {
            virtual_chapter,
            request,
            origin_zone: zone_index,
            fenced: 0,
        });
        for other in 0..self.zones.len() {
            if other != zone_index {
                self.zones[other]
                    .queue
                    .push_back(ZoneItem::SparseCacheBarrier { virtual_chapter });
            }
        }
        self.fence_at_barrier(zone_index, virtual_chapter)
    }

    fn fence_at_barrier(&mut self, zone_index: usize, virtual_chapter: u64) -> Result<()> {
        let matches = self
            .pending_barrier
            .as_ref()
            .is_some_and(|b| b.virtual_chapter == virtual_chapter);
        if !matches {
            return Ok(());
        }
        if self.zones[zone_index].waiting_barrier {
            return Ok(());
        }
        self.zones[zone_index].waiting_barrier = true;
        let Some(pending) = self.pending_barrier.as_mut() else {
            return Ok(());
        };
        pending.fenced += 1;
        if pending.fenced == self.geometry.zone_count {
            let barrier = self.pending_barrier.take().expect("just observed");
            self.volume.cache_sparse_chapter(barrier.virtual_chapter)?;
            for zone in &mut self.zones {
                zone.waiting_barrier = false;
            }
            let mut request = barrier.request;
            request.requeued = true;
            self.zones[barrier.origin_zone]
                .queue
                .push_front(ZoneItem::Client(request));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vopt_block::{BlockIo, RamDevice};
    use vopt_types::{MappingState, Pbn, CHUNK_NAME_SIZE};

    fn geometry() -> IndexGeometry {
        IndexGeometry {
            records_per_chapter: 8,
            chapters: 6,
            sparse_chapters: 2,
            zone_count: 2,
            open_chapter_load_ratio: 4,
        }
    }

    fn router() -> IndexRouter {
        let device: Arc<dyn BlockIo> = RamDevice::new(1024);
        let volume = Volume::new(geometry(), Pbn(16), device);
        IndexRouter::new(geometry(), volume).unwrap()
    }

    /// A name routed to a chosen zone (zone routing uses the low 16 bits).
    fn zoned_name(zone: u8, seed: u8) -> ChunkName {
        let mut bytes = [0u8; CHUNK_NAME_SIZE];
        bytes[0] = zone % 2;
        bytes[1] = 0;
        bytes[8] = seed;
        bytes[9] = seed.wrapping_mul(13);
        ChunkName(bytes)
    }

    fn advice(pbn: u64) -> DataLocation {
        DataLocation::new(Pbn(pbn), MappingState::Uncompressed)
    }

    fn post(id: u64, name: ChunkName, pbn: u64) -> IndexRequest {
        IndexRequest {
            id,
            action: RequestAction::Post,
            name,
            advice: Some(advice(pbn)),
            requeued: false,
        }
    }

    #[test]
    fn post_then_post_returns_prior_advice() {
        let mut router = router();
        router.enqueue(post(1, zoned_name(0, 1), 100));
        router.pump().unwrap();
        let first = router.drain_completed();
        assert_eq!(first.len(), 1);
        assert!(first[0].old_advice.is_none());

        router.enqueue(post(2, zoned_name(0, 1), 200));
        router.pump().unwrap();
        let second = router.drain_completed();
        assert_eq!(second[0].old_advice, Some(advice(100)));
    }

    #[test]
    fn queries_see_open_and_closed_chapters() {
        let mut router = router();
        // Fill both zones to close chapter 0: capacity is 4 per zone.
        for seed in 0..4u8 {
            router.enqueue(post(u64::from(seed), zoned_name(0, seed), 100 + u64::from(seed)));
            router.enqueue(post(
                10 + u64::from(seed),
                zoned_name(1, seed),
                200 + u64::from(seed),
            ));
        }
        router.pump().unwrap();
        assert_eq!(router.stats().chapters_closed, 1);
        assert_eq!(router.volume().newest_closed(), Some(0));

        // A ninth post lands in the new chapter.
        router.enqueue(post(20, zoned_name(0, 9), 900));
        router.pump().unwrap();

        // A record from the closed chapter still answers from the volume.
        router.enqueue(IndexRequest {
            id: 21,
            action: RequestAction::Query,
            name: zoned_name(1, 2),
            advice: None,
            requeued: false,
        });
        router.pump().unwrap();
        let done = router.drain_completed();
        let query = done.iter().find(|c| c.id == 21).unwrap();
        assert_eq!(query.old_advice, Some(advice(202)));
    }

    #[test]
    fn chapter_close_waits_for_every_zone() {
        let mut router = router();
        // Fill only zone 0; zone 1 contributes its partial shard when the
        // close is announced.
        for seed in 0..3u8 {
            router.enqueue(post(u64::from(seed), zoned_name(0, seed), 100 + u64::from(seed)));
        }
        router.enqueue(post(7, zoned_name(1, 50), 500));
        router.pump().unwrap();
        assert_eq!(router.stats().chapters_closed, 0);

        router.enqueue(post(8, zoned_name(0, 3), 103));
        router.pump().unwrap();
        assert_eq!(router.stats().chapters_closed, 1);
        // Zone 1's partial record went with the chapter.
        router.enqueue(IndexRequest {
            id: 9,
            action: RequestAction::Query,
            name: zoned_name(1, 50),
            advice: None,
            requeued: false,
        });
        router.pump().unwrap();
        let done = router.drain_completed();
        let query = done.iter().find(|c| c.id == 9).unwrap();
        assert_eq!(query.old_advice, Some(advice(500)));
    }

    #[test]
    fn stalled_router_holds_requests() {
        let mut router = router();
        router.set_stalled(true);
        router.enqueue(post(1, zoned_name(0, 1), 100));
        router.pump().unwrap();
        assert!(router.drain_completed().is_empty());
        assert_eq!(router.pending_requests(), 1);
        router.set_stalled(false);
        router.pump().unwrap();
        assert_eq!(router.drain_completed().len(), 1);
    }

    #[test]
    fn sparse_query_goes_around_the_barrier() {
        let mut router = router();
        // Close enough chapters that chapter 0 becomes sparse:
        // 6 chapters, 2 sparse -> sparse once newest - v >= 4.
        for chapter in 0..5u64 {
            for seed in 0..4u8 {
                let tag = (chapter as u8) * 10 + seed;
                router.enqueue(post(chapter * 100 + u64::from(seed), zoned_name(0, tag), 1000 + u64::from(tag)));
                router.enqueue(post(
                    chapter * 100 + 10 + u64::from(seed),
                    zoned_name(1, tag),
                    2000 + u64::from(tag),
                ));
            }
            router.pump().unwrap();
        }
        assert_eq!(router.stats().chapters_closed, 5);
        router.drain_completed();

        // zoned_name(0, 2) was posted in chapter 0, now sparse.
        router.enqueue(IndexRequest {
            id: 999,
            action: RequestAction::Query,
            name: zoned_name(0, 2),
            advice: None,
            requeued: false,
        });
        router.pump().unwrap();
        let done = router.drain_completed();
        let query = done.iter().find(|c| c.id == 999).unwrap();
        assert_eq!(query.old_advice, Some(advice(1002)));
        assert_eq!(router.stats().cache_barriers, 1);
        let volume_stats = router.volume().stats();
        assert_eq!(volume_stats.cache_fills, 1);
        assert!(volume_stats.index_retry >= 1, "requeued probe classified");
    }
}

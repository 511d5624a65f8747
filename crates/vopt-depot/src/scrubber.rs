//! The slab scrubber: replaying slab journals into reference counts after
//! an unclean shutdown.
//!
//! Scrubbing works one slab at a time from two queues, high-priority first.
//! During recovery `high_priority_only` suppresses background work so
//! allocation-blocking slabs come first. Observers wanting "a clean slab"
//! park on the scrubber's wait queue and are notified as each slab
//! finishes.

use crate::depot::{SlabDepot, SlabState};
use crate::slab_journal::{scan_region, SlabJournal, SlabJournalConfig};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};
use vopt_block::BlockIo;
use vopt_error::{Result, VoptError};
use vopt_lock::WaitQueue;
use vopt_types::{JournalPoint, SlabNumber};

/// Administrative state of the scrubber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubberState {
    Normal,
    Suspended,
}

/// The scrubber.
pub struct SlabScrubber {
    normal: VecDeque<SlabNumber>,
    high_priority: VecDeque<SlabNumber>,
    in_flight: Option<SlabNumber>,
    waiters: WaitQueue<()>,
    state: ScrubberState,
    high_priority_only: bool,
    slabs_scrubbed: u64,
}

impl Default for SlabScrubber {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabScrubber {
    #[must_use]
    pub fn new() -> Self {
        Self {
            normal: VecDeque::new(),
            high_priority: VecDeque::new(),
            in_flight: None,
            waiters: WaitQueue::new(),
            state: ScrubberState::Normal,
            high_priority_only: false,
            slabs_scrubbed: 0,
        }
    }

    /// Queue a slab for scrubbing.
    pub fn register_slab(&mut self, slab: SlabNumber, high_priority: bool) {
        if high_priority {
            self.high_priority.push_back(slab);
        } else {
            self.normal.push_back(slab);
        }
    }

    /// Suppress or allow low-priority work.
    pub fn set_high_priority_only(&mut self, only: bool) {
        self.high_priority_only = only;
    }

    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.high_priority.is_empty() || (!self.high_priority_only && !self.normal.is_empty())
    }

    #[must_use]
    pub fn state(&self) -> ScrubberState {
        self.state
    }

    #[must_use]
    pub fn slabs_scrubbed(&self) -> u64 {
        self.slabs_scrubbed
    }

    /// Park an observer until some slab becomes clean.
    pub fn enqueue_clean_slab_waiter(&mut self, callback: Box<dyn FnOnce(()) + Send>) {
        self.waiters.enqueue_with((), callback);
    }

    /// Scrub the next queued slab, if any. Returns the slab scrubbed.
    pub fn scrub_next(
        &mut self,
        depot: &mut SlabDepot,
        device: &Arc<dyn BlockIo>,
    ) -> Result<Option<SlabNumber>> {
        if self.state == ScrubberState::Suspended {
            return Ok(None);
        }
        let next = self.high_priority.pop_front().or_else(|| {
            if self.high_priority_only {
                None
            } else {
                self.normal.pop_front()
            }
        });
        let Some(number) = next else {
            return Ok(None);
        };
        self.in_flight = Some(number);
        let result = scrub_slab(depot, device, number);
        self.in_flight = None;
        match result {
            Ok(()) => {
                self.slabs_scrubbed += 1;
                let mut fallthrough = |()| {};
                while self.waiters.notify_next(&mut fallthrough) {}
                Ok(Some(number))
            }
            Err(error) => {
                warn!(
                    target: "vopt::depot::scrub",
                    event = "scrub_failed",
                    slab = number.0,
                    error = %error,
                );
                Err(error)
            }
        }
    }

    /// Scrub until the queues are empty (or only low-priority work remains
    /// in `high_priority_only` mode). Any error aborts scrubbing; the
    /// caller escalates to read-only.
    pub fn scrub_slabs(
        &mut self,
        depot: &mut SlabDepot,
        device: &Arc<dyn BlockIo>,
    ) -> Result<u64> {
        let mut scrubbed = 0;
        while self.state == ScrubberState::Normal {
            match self.scrub_next(depot, device)? {
                Some(_) => scrubbed += 1,
                None => break,
            }
        }
        info!(target: "vopt::depot::scrub", event = "scrub_pass_done", scrubbed);
        Ok(scrubbed)
    }

    /// Suspend after the in-flight slab (scrubbing is synchronous per
    /// slab, so this takes effect immediately between slabs).
    pub fn stop_scrubbing(&mut self) {
        self.state = ScrubberState::Suspended;
    }

    /// Resume; a no-op when no work remains.
    pub fn resume_scrubbing(
        &mut self,
        depot: &mut SlabDepot,
        device: &Arc<dyn BlockIo>,
    ) -> Result<u64> {
        self.state = ScrubberState::Normal;
        if !self.has_work() {
            return Ok(0);
        }
        self.scrub_slabs(depot, device)
    }
}

/// Replay one slab's journal into its reference counts and persist them.
///
/// The baseline is the last saved counter array (when one exists); every
/// journal entry after the saved point is applied, idempotently. An entry
/// addressing a block beyond the slab's data region is corruption.
fn scrub_slab(
    depot: &mut SlabDepot,
    device: &Arc<dyn BlockIo>,
    number: SlabNumber,
) -> Result<()> {
    let data_blocks = depot.config().data_blocks;
    let journal_config = SlabJournalConfig {
        origin: depot.config().journal_origin(number),
        size: depot.config().journal_blocks,
        nonce: depot.config().nonce,
    };
    let baseline = depot.load_saved_ref_counts(device, number)?;
    {
        let slab = depot.slab_mut(number);
        slab.state = SlabState::Scrubbing;
        if let Some((ref_counts, _tail)) = baseline {
            slab.ref_counts = ref_counts;
        }
    }
    let blocks = scan_region(device, &journal_config)?;
    let mut last_sequence = 0;
    for (header, entries) in blocks {
        last_sequence = header.sequence_number;
        for (index, entry) in entries.iter().enumerate() {
            if u64::from(entry.sbn.0) >= data_blocks {
                return Err(VoptError::CorruptJournal(format!(
                    "slab {} journal entry addresses block {} beyond data region",
                    number.0, entry.sbn.0
                )));
            }
            let point = JournalPoint::new(header.sequence_number, index as u16);
            depot
                .slab_mut(number)
                .ref_counts
                .replay_reference_count_change(point, entry.sbn, entry.operation)?;
        }
    }
    // The journal restarts past everything replayed.
    depot.slab_mut(number).journal = SlabJournal::new(journal_config, last_sequence + 1);
    depot.save_slab(device, number)?;
    depot.note_scrubbed();
    info!(
        target: "vopt::depot::scrub",
        event = "slab_scrubbed",
        slab = number.0,
        through_sequence = last_sequence,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depot::DepotConfig;
    use crate::ref_counts::RefStatus;
    use vopt_block::RamDevice;
    use vopt_types::{JournalOperation, Pbn};

    fn test_config(slab_count: u32, slab_size: u64) -> DepotConfig {
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
            physical_zones: 1,
        }
    }

    /// Build a depot with journalled activity that was never saved, as an
    /// unclean shutdown leaves it.
    fn crashed_depot(config: DepotConfig) -> (Arc<dyn BlockIo>, Pbn) {
        let device: Arc<dyn BlockIo> = RamDevice::new(config.end().0 + 16);
        let mut depot = SlabDepot::format(config, &device).unwrap();
        let pbn = depot.allocate_block(0).unwrap();
        depot
            .adjust_reference(&device, pbn, JournalOperation::DataIncrement, JournalPoint::new(1, 0))
            .unwrap();
        depot
            .adjust_reference(&device, pbn, JournalOperation::DataIncrement, JournalPoint::new(1, 1))
            .unwrap();
        // Seal the journal so it is on disk, but do not save counters.
        let slab = config.slab_for(pbn).unwrap().0;
        depot.slab_mut(slab).journal.commit(&device).unwrap();
        depot.summary_mut().mark_dirty(slab);
        depot.summary_mut().save(&device).unwrap();
        (device, pbn)
    }

    #[test]
    fn scrubbing_rebuilds_reference_counts() {
        let config = test_config(2, 64);
        let (device, pbn) = crashed_depot(config);
        let mut depot = SlabDepot::load(config, &device).unwrap();
        assert_eq!(depot.ref_status(pbn).unwrap(), RefStatus::Free, "counts lost");
        let unrecovered = depot.unrecovered_slabs();
        assert_eq!(unrecovered.len(), 1);

        let mut scrubber = SlabScrubber::new();
        for slab in unrecovered {
            scrubber.register_slab(slab, true);
        }
        let scrubbed = scrubber.scrub_slabs(&mut depot, &device).unwrap();
        assert_eq!(scrubbed, 1);
        assert_eq!(depot.ref_status(pbn).unwrap(), RefStatus::Count(2));
        assert!(depot.unrecovered_slabs().is_empty());

        // Scrubbing again changes nothing (replay idempotence).
        let mut again = SlabScrubber::new();
        again.register_slab(config.slab_for(pbn).unwrap().0, false);
        again.scrub_slabs(&mut depot, &device).unwrap();
        assert_eq!(depot.ref_status(pbn).unwrap(), RefStatus::Count(2));
    }

    #[test]
    fn high_priority_runs_first_and_only_mode_defers_normal() {
        let config = test_config(2, 64);
        let device: Arc<dyn BlockIo> = RamDevice::new(config.end().0 + 16);
        let mut depot = SlabDepot::format(config, &device).unwrap();
        let mut scrubber = SlabScrubber::new();
        scrubber.register_slab(SlabNumber(0), false);
        scrubber.register_slab(SlabNumber(1), true);
        scrubber.set_high_priority_only(true);
        let first = scrubber.scrub_next(&mut depot, &device).unwrap();
        assert_eq!(first, Some(SlabNumber(1)));
        assert!(!scrubber.has_work(), "normal queue suppressed");
        scrubber.set_high_priority_only(false);
        assert!(scrubber.has_work());
        let second = scrubber.scrub_next(&mut depot, &device).unwrap();
        assert_eq!(second, Some(SlabNumber(0)));
    }

    #[test]
    fn stop_and_resume() {
        let config = test_config(2, 64);
        let device: Arc<dyn BlockIo> = RamDevice::new(config.end().0 + 16);
        let mut depot = SlabDepot::format(config, &device).unwrap();
        let mut scrubber = SlabScrubber::new();
        scrubber.register_slab(SlabNumber(0), false);
        scrubber.stop_scrubbing();
        assert_eq!(scrubber.scrub_next(&mut depot, &device).unwrap(), None);
        assert_eq!(scrubber.state(), ScrubberState::Suspended);
        let resumed = scrubber.resume_scrubbing(&mut depot, &device).unwrap();
        assert_eq!(resumed, 1);
        // Resume with no work is a no-op.
        assert_eq!(scrubber.resume_scrubbing(&mut depot, &device).unwrap(), 0);
    }

    #[test]
    fn clean_slab_waiters_are_notified() {
        let config = test_config(1, 64);
        let device: Arc<dyn BlockIo> = RamDevice::new(config.end().0 + 16);
        let mut depot = SlabDepot::format(config, &device).unwrap();
        let mut scrubber = SlabScrubber::new();
        let notified = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = notified.clone();
        scrubber.enqueue_clean_slab_waiter(Box::new(move |()| {
            flag.store(true, std::sync::atomic::Ordering::Relaxed);
        }));
        scrubber.register_slab(SlabNumber(0), false);
        scrubber.scrub_slabs(&mut depot, &device).unwrap();
        assert!(notified.load(std::sync::atomic::Ordering::Relaxed));
    }
}

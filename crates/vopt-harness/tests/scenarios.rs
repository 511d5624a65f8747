//! End-to-end scenarios: dedupe, zero elision, crash recovery, advice
//! timeout, chapter lifecycle, and read-only escalation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vopt_harness::{pattern_block, seeded_block, TestDevice, TestGeometry};
use vopt_types::{Lbn, Pbn};

/// The recovery journal's on-disk range, for targeted fault injection.
fn journal_region(fixture: &TestDevice) -> std::ops::Range<u64> {
    let storage: Arc<dyn vopt_block::BlockIo> = fixture.ram.clone();
    let super_block = vopt_core::SuperBlock::read(&storage).unwrap();
    let origin = super_block.journal_origin().0;
    origin..origin + super_block.journal_size
}

#[test]
fn s1_dedup_round_trip() {
    let fixture = TestDevice::create(TestGeometry::default()).unwrap();
    fixture.write(0, pattern_block(0x11)).unwrap();
    fixture.write(1, pattern_block(0x11)).unwrap();

    let first = fixture.device.mapping_of(Lbn(0)).unwrap();
    let second = fixture.device.mapping_of(Lbn(1)).unwrap();
    assert_eq!(first.pbn, second.pbn, "both LBNs share one physical block");
    assert_eq!(
        fixture.device.ref_count_of(first.pbn).unwrap(),
        2,
        "two references on the shared block"
    );
    assert_eq!(
        fixture.ram.data_writes(),
        1,
        "exactly one data write reached the backing device"
    );
    assert_eq!(fixture.read(0).unwrap(), pattern_block(0x11));
    assert_eq!(fixture.read(1).unwrap(), pattern_block(0x11));
}

#[test]
fn s2_zero_block_elision() {
    let fixture = TestDevice::create(TestGeometry::default()).unwrap();
    fixture.write(5, pattern_block(0x00)).unwrap();

    let mapping = fixture.device.mapping_of(Lbn(5)).unwrap();
    assert!(mapping.is_zero_block(), "mapped to the zero block");
    assert_eq!(mapping.pbn, Pbn(0));
    assert_eq!(fixture.ram.data_writes(), 0, "no slab allocation, no write");

    let data_reads_before = fixture.ram.data_reads();
    assert_eq!(fixture.read(5).unwrap(), pattern_block(0x00));
    assert_eq!(
        fixture.ram.data_reads(),
        data_reads_before,
        "zero reads never touch the backing device"
    );
}

#[test]
fn s3_crash_and_recover() {
    let fixture = TestDevice::create(TestGeometry::default()).unwrap();
    // The first 500 writes are acknowledged before the crash.
    for lbn in 0..500u64 {
        fixture.write(lbn, seeded_block(lbn)).unwrap();
    }
    // The rest are in flight when the power goes out.
    for lbn in 500..1000u64 {
        fixture.device.submit(
            vopt_core::VioOperation::Write { fua: false },
            Lbn(lbn),
            seeded_block(lbn),
            Box::new(|_| {}),
        );
    }
    let fixture = fixture.crash_and_restart().unwrap();

    for lbn in 0..500u64 {
        assert_eq!(
            fixture.read(lbn).unwrap(),
            seeded_block(lbn),
            "acknowledged write {lbn} survived the crash"
        );
    }
    for lbn in 500..1000u64 {
        let data = fixture.read(lbn).unwrap();
        assert!(
            data == seeded_block(lbn) || data == pattern_block(0x00),
            "unacknowledged write {lbn} is either new or prior, never torn"
        );
    }
    // Every recovered mapping carries a live reference.
    for lbn in 0..1000u64 {
        let mapping = fixture.device.mapping_of(Lbn(lbn)).unwrap();
        if mapping.is_mapped() && !mapping.is_zero_block() {
            let count = fixture.device.ref_count_of(mapping.pbn).unwrap();
            assert!(count >= 1, "lbn {lbn} maps an unreferenced block");
        }
    }
}

#[test]
fn s4_dedupe_index_timeout() {
    let geometry = TestGeometry {
        dedupe_timeout: Duration::from_millis(1),
        ..TestGeometry::default()
    };
    let fixture = TestDevice::create(geometry).unwrap();
    fixture
        .device
        .control(vopt_core::ControlOp::StallIndex(true))
        .unwrap();

    fixture.write(0, pattern_block(0x2a)).unwrap();
    fixture.write(1, pattern_block(0x2a)).unwrap();

    let stats = fixture.device.stats().unwrap();
    assert!(
        stats.engine.advice_timeouts >= 2,
        "both writes gave up on advice"
    );
    // Dedupe was missed, but mappings and references stay consistent.
    let first = fixture.device.mapping_of(Lbn(0)).unwrap();
    let second = fixture.device.mapping_of(Lbn(1)).unwrap();
    assert!(first.is_mapped() && second.is_mapped());
    for mapping in [first, second] {
        assert_eq!(fixture.device.ref_count_of(mapping.pbn).unwrap(), 1);
    }
    assert_eq!(fixture.read(0).unwrap(), pattern_block(0x2a));
    assert_eq!(fixture.read(1).unwrap(), pattern_block(0x2a));

    fixture
        .device
        .control(vopt_core::ControlOp::StallIndex(false))
        .unwrap();
}

/// S5 exercises the chapter lifecycle directly at the index layer: close
/// is announced to every zone, the next chapter opens after the barrier,
/// and closed-chapter records answer from the dense region.
#[test]
fn s5_open_chapter_close() {
    use vopt_block::{BlockIo, RamDevice};
    use vopt_index::{
        IndexGeometry, IndexRequest, IndexRouter, RequestAction, Volume,
    };
    use vopt_types::{ChunkName, DataLocation, MappingState, CHUNK_NAME_SIZE};

    // Per-zone capacity of four: close happens after the fourth record in
    // each zone.
    let geometry = IndexGeometry {
        records_per_chapter: 8,
        chapters: 6,
        sparse_chapters: 2,
        zone_count: 2,
        open_chapter_load_ratio: 4,
    };
    let store: Arc<dyn BlockIo> = RamDevice::new(256);
    let volume = Volume::new(geometry, Pbn(8), store);
    let mut router = IndexRouter::new(geometry, volume).unwrap();

    let name = |zone: u8, seed: u8| {
        let mut bytes = [0u8; CHUNK_NAME_SIZE];
        bytes[0] = zone % 2;
        bytes[8] = seed;
        ChunkName(bytes)
    };
    let advice = |pbn: u64| DataLocation::new(Pbn(pbn), MappingState::Uncompressed);

    // Eight unique fingerprints, four per zone.
    for seed in 0..4u8 {
        for zone in 0..2u8 {
            router.enqueue(IndexRequest {
                id: u64::from(seed) * 2 + u64::from(zone),
                action: RequestAction::Post,
                name: name(zone, seed),
                advice: Some(advice(100 + u64::from(seed) * 2 + u64::from(zone))),
                requeued: false,
            });
        }
    }
    router.pump().unwrap();
    assert_eq!(
        router.stats().chapters_closed,
        1,
        "each zone sealed its shard and the chapter closed"
    );
    assert_eq!(router.volume().newest_closed(), Some(0));

    // The ninth fingerprint lands in the freshly opened chapter.
    router.enqueue(IndexRequest {
        id: 900,
        action: RequestAction::Post,
        name: name(0, 99),
        advice: Some(advice(999)),
        requeued: false,
    });
    router.pump().unwrap();
    let completions = router.drain_completed();
    let ninth = completions.iter().find(|c| c.id == 900).unwrap();
    assert!(ninth.old_advice.is_none(), "new name in the new chapter");

    // A fingerprint from the closed chapter still answers, now from the
    // dense region.
    router.enqueue(IndexRequest {
        id: 901,
        action: RequestAction::Query,
        name: name(1, 2),
        advice: None,
        requeued: false,
    });
    router.pump().unwrap();
    let completions = router.drain_completed();
    let query = completions.iter().find(|c| c.id == 901).unwrap();
    assert_eq!(query.old_advice, Some(advice(105)));
}

#[test]
fn s6_read_only_escalation() {
    let fixture = TestDevice::create(TestGeometry::default()).unwrap();
    let notifications = Arc::new(AtomicU32::new(0));
    let listener_count = notifications.clone();
    fixture
        .device
        .register_read_only_listener(
            0,
            Box::new(move || {
                listener_count.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

    fixture.write(0, pattern_block(0x77)).unwrap();

    // Take out the journal region: the next journal write must fail.
    fixture.ram.fail_writes_in(journal_region(&fixture));
    let error = fixture.write(1, pattern_block(0x88)).unwrap_err();
    assert!(error.to_string().contains("read-only") || error.to_string().contains("I/O"));
    fixture.ram.clear_write_faults();

    // Every subsequent write fails fast with read-only.
    for lbn in 2..5u64 {
        let error = fixture.write(lbn, pattern_block(0x99)).unwrap_err();
        assert!(
            error.to_string().contains("read-only"),
            "write {lbn}: {error}"
        );
    }
    // Reads of established mappings continue to succeed.
    assert_eq!(fixture.read(0).unwrap(), pattern_block(0x77));
    // The listener fired exactly once.
    assert_eq!(notifications.load(Ordering::Relaxed), 1);
    let stats = fixture.device.stats().unwrap();
    assert!(stats.read_only);
}

/// Testable property: summing references over all reachable mappings
/// matches the depot's counters.
#[test]
fn reference_counts_match_reachable_mappings() {
    let fixture = TestDevice::create(TestGeometry::default()).unwrap();
    // A workload with sharing, overwrites, zeros, and discards.
    for lbn in 0..40u64 {
        fixture.write(lbn, seeded_block(lbn % 10)).unwrap();
    }
    for lbn in 0..10u64 {
        fixture.write(lbn, pattern_block(0)).unwrap();
    }
    for lbn in 30..35u64 {
        fixture.device.discard_block(Lbn(lbn)).unwrap();
    }

    let mut expected: std::collections::HashMap<u64, u8> = std::collections::HashMap::new();
    for lbn in 0..40u64 {
        let mapping = fixture.device.mapping_of(Lbn(lbn)).unwrap();
        if mapping.is_mapped() && !mapping.is_zero_block() {
            *expected.entry(mapping.pbn.0).or_insert(0) += 1;
        }
    }
    for (&pbn, &count) in &expected {
        assert_eq!(
            fixture.device.ref_count_of(Pbn(pbn)).unwrap(),
            count,
            "pbn {pbn}"
        );
    }
}

#[test]
fn clean_restart_preserves_dedupe_index() {
    let fixture = TestDevice::create(TestGeometry::default()).unwrap();
    // Enough distinct fingerprints to close at least one chapter
    // (records_per_chapter = 64 in the fixture geometry).
    for lbn in 0..100u64 {
        fixture.write(lbn, seeded_block(lbn)).unwrap();
    }
    let stats = fixture.device.stats().unwrap();
    assert!(stats.index_chapters_closed >= 1, "a chapter closed");

    let fixture = fixture.shutdown_and_restart().unwrap();
    let writes_before = fixture.ram.data_writes();
    // Rewriting old content dedupes against advice from the reloaded
    // dense chapters.
    fixture.write(200, seeded_block(3)).unwrap();
    let original = fixture.device.mapping_of(Lbn(3)).unwrap();
    let rewritten = fixture.device.mapping_of(Lbn(200)).unwrap();
    assert_eq!(original.pbn, rewritten.pbn, "advice survived the restart");
    assert_eq!(fixture.ram.data_writes(), writes_before, "no new data write");
}

#[test]
fn suspend_is_successful_even_when_read_only() {
    let fixture = TestDevice::create(TestGeometry::default()).unwrap();
    fixture.write(0, pattern_block(0x11)).unwrap();
    fixture.ram.fail_writes_in(journal_region(&fixture));
    let _ = fixture.write(1, pattern_block(0x22));
    fixture.ram.clear_write_faults();
    // The device is read-only now; suspend still reports success.
    fixture
        .device
        .control(vopt_core::ControlOp::Suspend)
        .unwrap();
}

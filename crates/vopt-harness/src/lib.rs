#![forbid(unsafe_code)]
//! End-to-end test fixture for VOpt.
//!
//! Builds a device over a counting, fault-injecting RAM store, with
//! blocking submit helpers, crash-and-restart support, and structured
//! JSON step logging for post-mortem reading of failed runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vopt_block::RamDevice;
use vopt_core::{DeviceConfig, FormatParams, VoptDevice};
use vopt_index::IndexGeometry;
use vopt_types::{Lbn, BLOCK_SIZE};

/// A structured log line for one test step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLog {
    pub test: String,
    pub step: String,
    pub detail: serde_json::Value,
    pub duration_us: u64,
    pub status: String,
}

impl StepLog {
    pub fn emit(test: &str, step: &str, detail: serde_json::Value, started: Instant, ok: bool) {
        let entry = Self {
            test: test.to_owned(),
            step: step.to_owned(),
            detail,
            duration_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            status: if ok { "ok" } else { "error" }.to_owned(),
        };
        if let Ok(line) = serde_json::to_string(&entry) {
            eprintln!("{line}");
        }
    }
}

/// Geometry knobs for a test device.
#[derive(Debug, Clone, Copy)]
pub struct TestGeometry {
    pub physical_blocks: u64,
    pub logical_blocks: u64,
    pub slab_size: u64,
    pub journal_size: u64,
    pub block_map_maximum_age: u64,
    pub dedupe_timeout: Duration,
}

impl Default for TestGeometry {
    fn default() -> Self {
        Self {
            physical_blocks: 16384,
            logical_blocks: 8000,
            slab_size: 128,
            journal_size: 32,
            block_map_maximum_age: 8,
            dedupe_timeout: Duration::from_millis(2000),
        }
    }
}

/// A formatted, running device plus its backing store.
pub struct TestDevice {
    pub ram: Arc<RamDevice>,
    pub device: VoptDevice,
    geometry: TestGeometry,
}

fn config_for(geometry: &TestGeometry) -> Result<DeviceConfig> {
    let line = format!(
        "V4 test-backing {} 4096 64 {}",
        geometry.physical_blocks, geometry.block_map_maximum_age
    );
    let mut config = DeviceConfig::parse(&line)
        .map_err(|e| anyhow::anyhow!("table line rejected: {e}"))?;
    config.dedupe_timeout = geometry.dedupe_timeout;
    Ok(config)
}

fn params_for(geometry: &TestGeometry) -> FormatParams {
    FormatParams {
        slab_size: geometry.slab_size,
        root_count: 4,
        journal_size: geometry.journal_size,
        index: IndexGeometry {
            records_per_chapter: 64,
            chapters: 8,
            sparse_chapters: 2,
            zone_count: 1,
            open_chapter_load_ratio: 4,
        },
        nonce: 0xe2e_0001,
    }
}

impl TestDevice {
    /// Format and start a fresh device.
    pub fn create(geometry: TestGeometry) -> Result<Self> {
        let ram = RamDevice::new(geometry.physical_blocks);
        let storage: Arc<dyn vopt_block::BlockIo> = ram.clone();
        VoptDevice::format(
            &storage,
            geometry.physical_blocks,
            geometry.logical_blocks,
            &params_for(&geometry),
        )
        .map_err(|e| anyhow::anyhow!("format failed: {e}"))?;
        let device = VoptDevice::start(storage, config_for(&geometry)?)
            .map_err(|e| anyhow::anyhow!("start failed: {e}"))?;
        Ok(Self {
            ram,
            device,
            geometry,
        })
    }

    /// Simulate power loss, then load the survivor from the same store.
    pub fn crash_and_restart(self) -> Result<Self> {
        let Self { ram, device, geometry } = self;
        device.crash();
        let storage: Arc<dyn vopt_block::BlockIo> = ram.clone();
        let device = VoptDevice::start(storage, config_for(&geometry)?)
            .context("restart after crash")?;
        Ok(Self {
            ram,
            device,
            geometry,
        })
    }

    /// Clean shutdown, then reload.
    pub fn shutdown_and_restart(self) -> Result<Self> {
        let Self { ram, device, geometry } = self;
        device
            .shutdown()
            .map_err(|e| anyhow::anyhow!("shutdown failed: {e}"))?;
        let storage: Arc<dyn vopt_block::BlockIo> = ram.clone();
        let device = VoptDevice::start(storage, config_for(&geometry)?)
            .context("restart after shutdown")?;
        Ok(Self {
            ram,
            device,
            geometry,
        })
    }

    pub fn write(&self, lbn: u64, data: Vec<u8>) -> Result<()> {
        self.device
            .write_block(Lbn(lbn), data)
            .map_err(|e| anyhow::anyhow!("write {lbn} failed: {e}"))
    }

    pub fn read(&self, lbn: u64) -> Result<Vec<u8>> {
        self.device
            .read_block(Lbn(lbn))
            .map_err(|e| anyhow::anyhow!("read {lbn} failed: {e}"))
    }
}

/// One block filled with `byte`.
#[must_use]
pub fn pattern_block(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

/// One block with content derived from a seed, distinct per seed.
#[must_use]
pub fn seeded_block(seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; BLOCK_SIZE];
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
    for chunk in data.chunks_mut(8) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let bytes = state.to_le_bytes();
        let n = chunk.len();
        chunk.copy_from_slice(&bytes[..n]);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_blocks_are_distinct_and_stable() {
        assert_eq!(seeded_block(1), seeded_block(1));
        assert_ne!(seeded_block(1), seeded_block(2));
        assert_ne!(seeded_block(0), pattern_block(0));
    }

    #[test]
    fn fixture_round_trips() {
        let fixture = TestDevice::create(TestGeometry::default()).unwrap();
        fixture.write(0, pattern_block(0x5a)).unwrap();
        assert_eq!(fixture.read(0).unwrap(), pattern_block(0x5a));
        let restarted = fixture.shutdown_and_restart().unwrap();
        assert_eq!(restarted.read(0).unwrap(), pattern_block(0x5a));
    }
}

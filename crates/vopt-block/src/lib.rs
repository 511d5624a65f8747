#![forbid(unsafe_code)]
//! Storage provider interface for VOpt.
//!
//! The engine core performs all metadata and data I/O through the
//! [`BlockIo`] trait, tagging each request with a priority. Two providers
//! live here: [`RamDevice`], a sparse in-memory device with operation
//! counters and write-fault injection for tests, and [`FileDevice`], a
//! file-backed device using positioned reads and writes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use vopt_error::{Result, VoptError};
use vopt_types::{Pbn, BLOCK_SIZE};

/// Priority class of an I/O request.
///
/// Metadata requests (journal, block map, reference counts, index pages)
/// are serviced ahead of data requests of equal age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoPriority {
    Metadata,
    Data,
}

/// The storage provider the core is injected with.
///
/// Whole-block reads and writes only; a written block is durable once
/// `write_block` returns, and `flush` orders previously returned writes
/// against later ones.
pub trait BlockIo: Send + Sync {
    fn read_block(&self, priority: IoPriority, pbn: Pbn) -> Result<Vec<u8>>;

    fn write_block(&self, priority: IoPriority, pbn: Pbn, data: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;

    /// Total physical blocks this device exposes.
    fn block_count(&self) -> u64;
}

/// A freshly zeroed block buffer.
#[must_use]
pub fn zeroed_block() -> Vec<u8> {
    vec![0u8; BLOCK_SIZE]
}

fn check_bounds(pbn: Pbn, count: u64) -> Result<()> {
    if pbn.0 >= count {
        return Err(VoptError::InvalidArgument(format!(
            "block {pbn} beyond device end {count}"
        )));
    }
    Ok(())
}

fn check_length(data: &[u8]) -> Result<()> {
    if data.len() != BLOCK_SIZE {
        return Err(VoptError::InvalidArgument(format!(
            "write of {} bytes is not one block",
            data.len()
        )));
    }
    Ok(())
}

/// Per-priority operation counters, all monotonic.
#[derive(Debug, Default)]
pub struct IoCounters {
    pub metadata_reads: AtomicU64,
    pub metadata_writes: AtomicU64,
    pub data_reads: AtomicU64,
    pub data_writes: AtomicU64,
    pub flushes: AtomicU64,
}

impl IoCounters {
    fn count_read(&self, priority: IoPriority) {
        match priority {
            IoPriority::Metadata => self.metadata_reads.fetch_add(1, Ordering::Relaxed),
            IoPriority::Data => self.data_reads.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn count_write(&self, priority: IoPriority) {
        match priority {
            IoPriority::Metadata => self.metadata_writes.fetch_add(1, Ordering::Relaxed),
            IoPriority::Data => self.data_writes.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// A sparse in-memory block device.
///
/// Unwritten blocks read back as zeros, so the device is thin by nature.
/// Tests can inject write failures over a PBN range and count I/O by
/// priority class.
pub struct RamDevice {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    block_count: u64,
    counters: IoCounters,
    fail_writes: Mutex<Option<std::ops::Range<u64>>>,
}

impl RamDevice {
    #[must_use]
    pub fn new(block_count: u64) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(HashMap::new()),
            block_count,
            counters: IoCounters::default(),
            fail_writes: Mutex::new(None),
        })
    }

    pub fn counters(&self) -> &IoCounters {
        &self.counters
    }

    #[must_use]
    pub fn data_writes(&self) -> u64 {
        self.counters.data_writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn data_reads(&self) -> u64 {
        self.counters.data_reads.load(Ordering::Relaxed)
    }

    /// Fail every write landing in `range` with an I/O error until cleared.
    pub fn fail_writes_in(&self, range: std::ops::Range<u64>) {
        *self.fail_writes.lock() = Some(range);
    }

    pub fn clear_write_faults(&self) {
        *self.fail_writes.lock() = None;
    }

    /// Number of blocks ever written (the device's physical footprint).
    #[must_use]
    pub fn written_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockIo for RamDevice {
    fn read_block(&self, priority: IoPriority, pbn: Pbn) -> Result<Vec<u8>> {
        check_bounds(pbn, self.block_count)?;
        self.counters.count_read(priority);
        let blocks = self.blocks.lock();
        Ok(blocks.get(&pbn.0).cloned().unwrap_or_else(zeroed_block))
    }

    fn write_block(&self, priority: IoPriority, pbn: Pbn, data: &[u8]) -> Result<()> {
        check_bounds(pbn, self.block_count)?;
        check_length(data)?;
        if let Some(range) = self.fail_writes.lock().as_ref() {
            if range.contains(&pbn.0) {
                warn!(target: "vopt::block", event = "injected_write_fault", pbn = pbn.0);
                return Err(VoptError::Io(std::io::Error::other(
                    "injected write fault",
                )));
            }
        }
        self.counters.count_write(priority);
        self.blocks.lock().insert(pbn.0, data.to_vec());
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// A file-backed block device using positioned I/O.
pub struct FileDevice {
    file: File,
    block_count: u64,
    counters: IoCounters,
}

impl FileDevice {
    /// Open (or create) a backing file sized to `block_count` blocks.
    pub fn open(path: &Path, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(block_count * BLOCK_SIZE as u64)?;
        debug!(
            target: "vopt::block",
            event = "file_device_open",
            path = %path.display(),
            blocks = block_count
        );
        Ok(Self {
            file,
            block_count,
            counters: IoCounters::default(),
        })
    }

    pub fn counters(&self) -> &IoCounters {
        &self.counters
    }
}

impl BlockIo for FileDevice {
    fn read_block(&self, priority: IoPriority, pbn: Pbn) -> Result<Vec<u8>> {
        check_bounds(pbn, self.block_count)?;
        self.counters.count_read(priority);
        let mut data = zeroed_block();
        self.file.read_exact_at(&mut data, pbn.0 * BLOCK_SIZE as u64)?;
        Ok(data)
    }

    fn write_block(&self, priority: IoPriority, pbn: Pbn, data: &[u8]) -> Result<()> {
        check_bounds(pbn, self.block_count)?;
        check_length(data)?;
        self.counters.count_write(priority);
        self.file.write_all_at(data, pbn.0 * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.file.sync_data()?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_device_reads_zeros_when_unwritten() {
        let dev = RamDevice::new(16);
        let data = dev.read_block(IoPriority::Data, Pbn(3)).unwrap();
        assert_eq!(data, zeroed_block());
        assert_eq!(dev.written_blocks(), 0);
    }

    #[test]
    fn ram_device_round_trips_and_counts() {
        let dev = RamDevice::new(16);
        let mut data = zeroed_block();
        data[0] = 0x11;
        dev.write_block(IoPriority::Data, Pbn(5), &data).unwrap();
        dev.write_block(IoPriority::Metadata, Pbn(1), &zeroed_block())
            .unwrap();
        assert_eq!(dev.read_block(IoPriority::Data, Pbn(5)).unwrap(), data);
        assert_eq!(dev.data_writes(), 1);
        assert_eq!(dev.counters().metadata_writes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn ram_device_bounds_and_length_checks() {
        let dev = RamDevice::new(4);
        assert!(dev.read_block(IoPriority::Data, Pbn(4)).is_err());
        assert!(dev
            .write_block(IoPriority::Data, Pbn(0), &[0u8; 100])
            .is_err());
    }

    #[test]
    fn injected_faults_hit_only_the_range() {
        let dev = RamDevice::new(16);
        dev.fail_writes_in(4..8);
        assert!(dev
            .write_block(IoPriority::Metadata, Pbn(5), &zeroed_block())
            .is_err());
        assert!(dev
            .write_block(IoPriority::Metadata, Pbn(3), &zeroed_block())
            .is_ok());
        dev.clear_write_faults();
        assert!(dev
            .write_block(IoPriority::Metadata, Pbn(5), &zeroed_block())
            .is_ok());
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        let dev = FileDevice::open(&path, 8).unwrap();
        let mut data = zeroed_block();
        data[100] = 0xab;
        dev.write_block(IoPriority::Data, Pbn(7), &data).unwrap();
        dev.flush().unwrap();
        assert_eq!(dev.read_block(IoPriority::Data, Pbn(7)).unwrap(), data);
        assert_eq!(dev.read_block(IoPriority::Data, Pbn(0)).unwrap(), zeroed_block());
    }
}

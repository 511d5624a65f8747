//! Data-vio: the in-memory state of one host block operation in flight,
//! and the fixed pool they are drawn from.

use std::time::Instant;
use vopt_error::Result;
use vopt_types::{BlockMapSlot, ChunkName, DataLocation, Lbn, Pbn, BLOCK_SIZE};

/// The host-visible operation classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioOperation {
    Read,
    Write { fua: bool },
    Discard,
    Flush,
}

/// Reply to the host: reads carry a data buffer.
#[derive(Debug, Default)]
pub struct IoReply {
    pub data: Option<Vec<u8>>,
}

/// Host completion callback.
pub type Completion = Box<dyn FnOnce(Result<IoReply>) + Send>;

/// An allocation made on behalf of a vio: the block is provisionally
/// referenced and write-locked until the reference commits.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub pbn: Pbn,
    pub zone: usize,
}

/// Compression progress of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionState {
    /// Not attempted or not profitable.
    Skipped,
    /// Compressed bytes waiting in (or headed to) the packer.
    Compressed(Vec<u8>),
}

/// One in-flight host operation.
pub struct DataVio {
    pub id: u64,
    pub operation: VioOperation,
    pub lbn: Lbn,
    /// Write payload (one block) or the buffer a read will fill.
    pub data: Vec<u8>,
    pub is_zero: bool,
    pub chunk_name: Option<ChunkName>,
    pub logical_zone: usize,
    pub hash_zone: usize,
    /// The mapping found in the block map at launch.
    pub mapped: DataLocation,
    /// The mapping this operation will install.
    pub new_mapped: DataLocation,
    pub tree_slot: Option<BlockMapSlot>,
    pub allocation: Option<Allocation>,
    /// Verified dedupe target, holding a claimed read-lock increment.
    pub duplicate: Option<DataLocation>,
    /// PBN locks held, as (physical zone, pbn) pairs.
    pub held_locks: Vec<(usize, Pbn)>,
    pub dedupe_deadline: Option<Instant>,
    pub compression: CompressionState,
    pub completion: Option<Completion>,
}

impl DataVio {
    fn blank() -> Self {
        Self {
            id: 0,
            operation: VioOperation::Flush,
            lbn: Lbn(0),
            data: Vec::new(),
            is_zero: false,
            chunk_name: None,
            logical_zone: 0,
            hash_zone: 0,
            mapped: DataLocation::UNMAPPED,
            new_mapped: DataLocation::UNMAPPED,
            tree_slot: None,
            allocation: None,
            duplicate: None,
            held_locks: Vec::new(),
            dedupe_deadline: None,
            compression: CompressionState::Skipped,
            completion: None,
        }
    }

    /// Prepare a pooled vio for a new operation.
    pub fn reset(
        &mut self,
        id: u64,
        operation: VioOperation,
        lbn: Lbn,
        data: Vec<u8>,
        completion: Completion,
    ) {
        self.id = id;
        self.operation = operation;
        self.lbn = lbn;
        self.is_zero = vopt_types::is_all_zero(&data) && !data.is_empty();
        self.data = data;
        self.chunk_name = None;
        self.logical_zone = 0;
        self.hash_zone = 0;
        self.mapped = DataLocation::UNMAPPED;
        self.new_mapped = DataLocation::UNMAPPED;
        self.tree_slot = None;
        self.allocation = None;
        self.duplicate = None;
        self.held_locks.clear();
        self.dedupe_deadline = None;
        self.compression = CompressionState::Skipped;
        self.completion = Some(completion);
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self.operation, VioOperation::Write { .. })
    }

    #[must_use]
    pub fn requires_fua(&self) -> bool {
        matches!(self.operation, VioOperation::Write { fua: true })
    }

    /// Deliver the completion. Reads hand their buffer back.
    pub fn complete(&mut self, result: Result<()>) {
        if let Some(completion) = self.completion.take() {
            let reply = match result {
                Ok(()) => Ok(IoReply {
                    data: if self.operation == VioOperation::Read {
                        Some(std::mem::take(&mut self.data))
                    } else {
                        None
                    },
                }),
                Err(error) => Err(error),
            };
            completion(reply);
        }
    }

    /// A read of an unmapped or zero-block LBN: all zeros, no device I/O.
    pub fn fill_zeros(&mut self) {
        self.data = vec![0u8; BLOCK_SIZE];
    }
}

impl std::fmt::Debug for DataVio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataVio")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("lbn", &self.lbn)
            .field("is_zero", &self.is_zero)
            .field("mapped", &self.mapped)
            .field("new_mapped", &self.new_mapped)
            .field("held_locks", &self.held_locks)
            .finish()
    }
}

/// Fixed pool of data-vios. Acquisition failure parks the submission on
/// the engine's pending queue until a vio frees.
pub struct VioPool {
    free: Vec<Box<DataVio>>,
    capacity: usize,
    outstanding: usize,
}

impl VioPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity).map(|_| Box::new(DataVio::blank())).collect(),
            capacity,
            outstanding: 0,
        }
    }

    pub fn acquire(&mut self) -> Option<Box<DataVio>> {
        let vio = self.free.pop()?;
        self.outstanding += 1;
        Some(vio)
    }

    pub fn release(&mut self, vio: Box<DataVio>) {
        debug_assert!(vio.completion.is_none(), "releasing an uncompleted vio");
        debug_assert!(vio.held_locks.is_empty(), "releasing a vio holding locks");
        self.outstanding -= 1;
        self.free.push(vio);
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

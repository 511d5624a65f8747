//! Per-physical-block locks and the fixed-capacity pool they are drawn from.
//!
//! A lock is owned by the physical zone covering its PBN; only the
//! `increments_claimed` counter may be touched from other threads, which is
//! why it alone is atomic.

use std::sync::atomic::{AtomicU32, Ordering};
use vopt_error::{Result, VoptError};

/// The type of a PBN lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PbnLockType {
    Read,
    Write,
    CompressedWrite,
    BlockMapWrite,
}

/// A PBN lock.
#[derive(Debug)]
pub struct PbnLock {
    kind: PbnLockType,
    /// The number of data-vios holding or sharing this lock.
    pub holder_count: u32,
    /// Compressed-block writers holding a share of this lock while they
    /// acquire a reference to the PBN.
    pub fragment_locks: u8,
    has_provisional_reference: bool,
    /// For read locks, the reference increments known available on the
    /// locked block when the lock was acquired.
    increment_limit: u32,
    /// Claims attempted over the lifetime of the lock. Incremented before
    /// the limit check, so it can exceed the limit.
    increments_claimed: AtomicU32,
}

impl PbnLock {
    #[must_use]
    pub fn new(kind: PbnLockType) -> Self {
        Self {
            kind,
            holder_count: 0,
            fragment_locks: 0,
            has_provisional_reference: false,
            increment_limit: 0,
            increments_claimed: AtomicU32::new(0),
        }
    }

    /// Re-initialize a pooled lock for a new acquisition.
    pub fn initialize(&mut self, kind: PbnLockType) {
        self.kind = kind;
        self.holder_count = 1;
        self.fragment_locks = 0;
        self.has_provisional_reference = false;
        self.increment_limit = 0;
        self.increments_claimed.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn kind(&self) -> PbnLockType {
        self.kind
    }

    #[must_use]
    pub fn is_read_lock(&self) -> bool {
        self.kind == PbnLockType::Read
    }

    /// Downgrade a write lock to a read lock. The holder count is cleared;
    /// the caller is responsible for setting the new count.
    pub fn downgrade_to_read(&mut self, increment_limit: u32) {
        debug_assert!(!self.is_read_lock());
        self.kind = PbnLockType::Read;
        self.holder_count = 0;
        self.increment_limit = increment_limit;
        self.increments_claimed.store(0, Ordering::Relaxed);
    }

    /// Record how many reference increments were available at acquisition.
    pub fn set_increment_limit(&mut self, limit: u32) {
        self.increment_limit = limit;
    }

    /// Try to claim one of the available reference increments on a read
    /// lock. May be called from any thread. A claim is valid only until the
    /// lock is released.
    pub fn claim_increment(&self) -> bool {
        let claim = self.increments_claimed.fetch_add(1, Ordering::AcqRel) + 1;
        claim <= self.increment_limit
    }

    #[must_use]
    pub fn has_provisional_reference(&self) -> bool {
        self.has_provisional_reference
    }

    /// Make this lock responsible for a provisional reference on its PBN.
    pub fn assign_provisional_reference(&mut self) -> Result<()> {
        if self.has_provisional_reference {
            return Err(VoptError::LockError(
                "lock already has a provisional reference",
            ));
        }
        self.has_provisional_reference = true;
        Ok(())
    }

    /// The lock is no longer responsible for a provisional reference.
    pub fn unassign_provisional_reference(&mut self) {
        self.has_provisional_reference = false;
    }
}

/// Index of a lock in its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PbnLockIdx(pub u32);

/// A fixed-capacity pool of PBN locks.
///
/// `borrow` never allocates: once the pool is empty it fails with a lock
/// error and the caller suspends on its zone's waiter machinery. Returned
/// locks are zeroed before going back on the free list.
pub struct PbnLockPool {
    locks: Vec<PbnLock>,
    free: Vec<PbnLockIdx>,
    capacity: usize,
}

impl PbnLockPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let locks = (0..capacity).map(|_| PbnLock::new(PbnLockType::Read)).collect();
        let free = (0..capacity)
            .rev()
            .map(|i| PbnLockIdx(i as u32))
            .collect();
        Self {
            locks,
            free,
            capacity,
        }
    }

    /// Borrow a lock, initialized to `kind` with one holder.
    pub fn borrow(&mut self, kind: PbnLockType) -> Result<PbnLockIdx> {
        let idx = self
            .free
            .pop()
            .ok_or(VoptError::LockError("pool-empty"))?;
        self.locks[idx.0 as usize].initialize(kind);
        Ok(idx)
    }

    /// Return a lock to the pool.
    pub fn give_back(&mut self, idx: PbnLockIdx) {
        let lock = &mut self.locks[idx.0 as usize];
        debug_assert!(
            !lock.has_provisional_reference(),
            "returned lock still holds a provisional reference"
        );
        lock.initialize(PbnLockType::Read);
        lock.holder_count = 0;
        self.free.push(idx);
    }

    #[must_use]
    pub fn get(&self, idx: PbnLockIdx) -> &PbnLock {
        &self.locks[idx.0 as usize]
    }

    pub fn get_mut(&mut self, idx: PbnLockIdx) -> &mut PbnLock {
        &mut self.locks[idx.0 as usize]
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

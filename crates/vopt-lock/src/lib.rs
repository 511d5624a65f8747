#![forbid(unsafe_code)]
//! Suspension and locking primitives for VOpt.
//!
//! [`WaitQueue`] is the FIFO every zone parks suspended operations on;
//! [`PbnLock`] and [`PbnLockPool`] provide per-physical-block locking with
//! a fixed-capacity, index-based pool.

pub mod pbn_lock;
pub mod wait_queue;

pub use pbn_lock::{PbnLock, PbnLockIdx, PbnLockPool, PbnLockType};
pub use wait_queue::{WaitQueue, Waiter, WaiterCallback};

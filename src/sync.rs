//! Basic synchronization primitives.
//!
//! Every module goes through these re-exports so the lock implementation is
//! chosen in exactly one place.
pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use std::sync::{
    atomic::{fence, AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

//! Chain-reentrant locking primitives and a lock-guarded hash map.
//!
//! Two layers, usable together or separately:
//!
//! - [`RwLock`]: a read-write lock serving async and blocking callers from
//!   one waiter queue, with write-preferring fairness, cancellation through
//!   [`Cx`], reentrancy keyed by call-chain identity, and idempotent
//!   terminal disposal.
//! - [`LockingMap`]: a hash map that runs every operation under that lock.
//!   Reads share, mutations exclude, values move by clone, and removal via
//!   [`try_take`](LockingMap::try_take) follows arrival order. Iteration
//!   holds a read guard for the iterator's whole lifetime.
//!
//! No runtime is assumed: async operations are plain futures polled by
//! whatever executor the caller uses, and every operation has a
//! `blocking_` twin that parks the calling thread under the same fairness
//! policy.
//!
//! # Example
//!
//! ```
//! use guardmap::{Cx, LockingMap};
//!
//! let map: LockingMap<String, u32> = LockingMap::new();
//! let cx = Cx::new();
//!
//! map.blocking_set(&cx, "alpha".to_string(), 1)?;
//! assert!(map.blocking_try_add(&cx, "beta".to_string(), 2)?);
//! assert!(!map.blocking_try_add(&cx, "beta".to_string(), 9)?);
//!
//! assert_eq!(map.blocking_get(&cx, "alpha")?, Some(1));
//! assert_eq!(map.blocking_try_take(&cx)?, Some(("alpha".to_string(), 1)));
//! # Ok::<(), guardmap::LockError>(())
//! ```
//!
//! With the `serde` feature enabled, [`LockingMap`] serializes its live
//! pairs in arrival order and deserializes into a fresh, open map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod cx;
pub mod map;
pub mod rwlock;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cx::{Cancelled, ChainId, Cx};
pub use map::{AddError, LockingIter, LockingMap};
pub use rwlock::{
    LockError, LockStats, ReadFuture, ReadGuard, RwLock, TryReadError, TryWriteError, WriteFuture,
    WriteGuard,
};

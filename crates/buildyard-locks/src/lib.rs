//! buildyard-locks — shared build locks.
//!
//! A lock is a named semaphore, counting (up to `max_count` concurrent
//! holders) or exclusive (one holder, excluding counting holders too).
//! Master-scoped locks have one instance shared by every build;
//! per-worker locks are lazily instantiated per worker name on first
//! access and cached.
//!
//! Builds hold a lock only between claim and release around their
//! execution span; locks never survive a process restart.

pub mod registry;

pub use registry::{LockAccess, LockRegistry};

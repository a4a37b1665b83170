//! buildyard-dispatch — the build-dispatch core.
//!
//! The `Dispatcher` runs a single activity loop that drains a
//! priority-sorted set of builder names; each drained name triggers one
//! matching pass on that `Builder`, which pairs available workers with
//! unclaimed requests, merges compatible requests, claims them
//! atomically against the request store, and hands the pair to the
//! execution primitive.
//!
//! # Architecture
//!
//! ```text
//! stimuli (request submitted, worker attached, timer fired)
//!   └── Dispatcher::notify ──> pending set (sorted by category)
//!         └── activity loop ──> Builder::attempt_dispatch
//!               ├── WorkerPool      (available snapshot)
//!               ├── SelectionPolicy (pick worker)
//!               ├── RequestStore    (fetch, claim, unclaim)
//!               ├── LockRegistry    (availability gate)
//!               └── BuildStarter    (hand-off, out of scope)
//! ```
//!
//! Exactly one matching pass runs at a time process-wide; at-most-once
//! execution of a request rests on the store's atomic claim, never on
//! in-process locking.

pub mod builder;
pub mod context;
pub mod dispatcher;
pub mod error;

pub use builder::{BuildHandle, BuildStarter, Builder, MergePredicate, RequestChooser};
pub use context::SchedulingContext;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};

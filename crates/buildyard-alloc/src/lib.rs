//! buildyard-alloc — deterministic worker-class allocation.
//!
//! Given disjoint named pools of workers, classes that each request a
//! number of workers from some subset of pools, and join memberships
//! linking keys (builder names) to classes, the allocator computes a
//! worker → class mapping. The previous run's persisted assignment is
//! re-used wherever still valid, so the same machine tends to serve the
//! same builder across master restarts.
//!
//! Everything is ordered collections and explicit sorts — two runs over
//! the same inputs always produce the same assignment.

pub mod allocator;
pub mod state;

pub use allocator::{AllocError, AllocResult, Allocation, Allocator, ClassConfig, ClassId, WorkerAssignment};
pub use state::{NO_SUBTYPE, PersistedState};

//! buildyard-store — the transactional store of pending build requests.
//!
//! The dispatch core never enforces at-most-once execution in process;
//! it relies on the store's atomic, all-or-nothing `claim` over a full
//! id set. Two implementations are provided:
//!
//! - [`MemoryRequestStore`] — mutex-guarded, for tests and
//!   single-process deployments
//! - [`RedbRequestStore`] — redb-backed, persistent, with claims
//!   recorded in their own table inside one write transaction
//!
//! # Architecture
//!
//! ```text
//! Builder ──> dyn RequestStore
//!               ├── get_unclaimed(builder)   (oldest first)
//!               ├── claim(ids)               (all-or-nothing)
//!               ├── unclaim(ids)             (hand-off failed)
//!               └── complete(ids, result)
//! ```

pub mod error;
pub mod memory;
pub mod redb_store;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryRequestStore;
pub use redb_store::RedbRequestStore;
pub use traits::RequestStore;

//! buildyard-pool — connected-worker state for the dispatch core.
//!
//! The pool tracks which statically configured workers are connected,
//! how many builds each is running, and which have requested graceful
//! shutdown. Transport tasks call `attach`/`detach`; the dispatch loop
//! reads availability snapshots. The wire protocol itself is a black
//! box behind [`WorkerTransport`].

pub mod pool;
pub mod transport;

pub use pool::{AttachOutcome, PoolSnapshot, WorkerPool, WorkerSnapshot};
pub use transport::{StaticTransport, WorkerTransport};

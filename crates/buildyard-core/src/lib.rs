//! buildyard-core — shared domain types for the build-dispatch control plane.
//!
//! Everything here is plain data: build requests, source stamps, builder
//! and worker configuration, lock specs, and the cross-builder priority
//! seam. The scheduling logic that consumes these types lives in
//! `buildyard-dispatch` and friends.

pub mod priority;
pub mod types;

pub use priority::{CategoryPrioritizer, Prioritizer};
pub use types::*;

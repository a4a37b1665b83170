//! The request store contract consumed by the dispatch core.

use std::collections::BTreeSet;

use buildyard_core::{BuildRequest, BuildResult, RequestId};

use crate::error::StoreResult;

/// Transactional store of pending and claimed build requests.
///
/// Methods are synchronous and expected to be brief; the dispatch loop
/// calls them from its single activity task. Implementations must make
/// `claim` atomic across the full id set — this is what gives the
/// system its at-most-once dispatch guarantee, not any in-process lock.
pub trait RequestStore: Send + Sync {
    /// Add a new pending request. Ids are caller-assigned and unique.
    fn submit(&self, request: BuildRequest) -> StoreResult<()>;

    /// All unclaimed requests for a builder, sorted ascending by
    /// `submitted_at`, ties broken by id.
    fn get_unclaimed(&self, builder: &str) -> StoreResult<Vec<BuildRequest>>;

    /// Atomically claim every id in the set, or none of them.
    ///
    /// Fails with [`StoreError::AlreadyClaimed`] if any id is already
    /// claimed, in which case no id in the set changes state.
    ///
    /// [`StoreError::AlreadyClaimed`]: crate::StoreError::AlreadyClaimed
    fn claim(&self, ids: &BTreeSet<RequestId>) -> StoreResult<()>;

    /// Release claims back to unclaimed (hand-off failed).
    fn unclaim(&self, ids: &BTreeSet<RequestId>) -> StoreResult<()>;

    /// Mark claimed requests completed with the given result.
    /// `Retry` puts them back in the unclaimed queue instead.
    fn complete(&self, ids: &BTreeSet<RequestId>, result: BuildResult) -> StoreResult<()>;

    /// Ids currently claimed (diagnostics and tests).
    fn claimed_ids(&self) -> StoreResult<BTreeSet<RequestId>>;
}

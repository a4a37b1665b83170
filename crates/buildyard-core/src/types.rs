//! Domain types for the build-dispatch control plane.
//!
//! These types are serializable so they can be persisted by the request
//! store and carried in daemon configuration files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a build request, assigned by the store.
pub type RequestId = u64;

/// Name of a worker machine.
pub type WorkerName = String;

/// Name of a builder (a named build type).
pub type BuilderName = String;

/// Free-form request properties. `BTreeMap` so equality and iteration
/// order are independent of insertion order.
pub type Properties = BTreeMap<String, String>;

// ── Build requests ─────────────────────────────────────────────────

/// What revision of what repository a request wants built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceStamp {
    pub repository: String,
    pub branch: String,
    pub revision: String,
    /// An uncommitted patch, if any. Patched stamps never merge.
    pub patch: Option<String>,
}

impl SourceStamp {
    /// Whether two stamps may share a single build.
    ///
    /// Same repository and branch, and neither side carries a patch.
    /// Revisions may differ — the merged build takes the newest.
    pub fn mergeable_with(&self, other: &SourceStamp) -> bool {
        self.repository == other.repository
            && self.branch == other.branch
            && self.patch.is_none()
            && other.patch.is_none()
    }
}

/// A queued unit of work awaiting a worker.
///
/// Immutable once claimed. Requests merged into a chosen primary share a
/// single claim but keep their own ids for result propagation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRequest {
    pub id: RequestId,
    pub builder: BuilderName,
    /// Unix timestamp (seconds) when the request was submitted.
    pub submitted_at: u64,
    pub source: SourceStamp,
    pub properties: Properties,
}

/// Final outcome of a completed build request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Success,
    Failure,
    /// The request should be re-queued and built again.
    Retry,
}

/// The default merge predicate: same builder, mergeable source stamps,
/// and identical properties.
pub fn default_merge_compatible(a: &BuildRequest, b: &BuildRequest) -> bool {
    a.builder == b.builder
        && a.source.mergeable_with(&b.source)
        && a.properties == b.properties
}

// ── Locks ──────────────────────────────────────────────────────────

/// How many concurrent holders a lock admits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Up to `max_count` concurrent holders.
    Counting,
    /// At most one holder, excluding all counting holders too.
    Exclusive,
}

/// Whether one lock instance is shared master-wide or instantiated
/// per worker name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    Master,
    PerWorker,
}

/// A lock a builder's builds must hold for their execution span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockSpec {
    pub name: String,
    pub scope: LockScope,
    pub mode: LockMode,
    /// Max concurrent counting holders. Ignored for exclusive access.
    #[serde(default = "default_max_count")]
    pub max_count: u32,
}

fn default_max_count() -> u32 {
    1
}

// ── Configuration ──────────────────────────────────────────────────

/// Static configuration for one worker machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    pub name: WorkerName,
    /// Cap on concurrent builds. `None` means one at a time.
    #[serde(default)]
    pub max_builds: Option<u32>,
}

/// Static configuration for one builder.
///
/// Essentially immutable at runtime — workers and requests flow through
/// it, the record itself only changes on reconfig.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuilderConfig {
    pub name: BuilderName,
    /// Free-form category string; the numeric-prefix convention
    /// ("0nightly" before "5android") drives cross-builder priority.
    #[serde(default)]
    pub category: String,
    /// Eligible worker names, in configured order.
    pub workers: Vec<WorkerName>,
    /// Whether compatible pending requests are merged into one build.
    #[serde(default)]
    pub merge_requests: bool,
    /// Locks every build on this builder must hold.
    #[serde(default)]
    pub locks: Vec<LockSpec>,
}

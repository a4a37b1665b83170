//! In-memory request store.
//!
//! A single mutex guards the whole request table, which makes the
//! all-or-nothing claim trivial. Used by tests and single-process
//! deployments that do not need requests to survive restarts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use tracing::debug;

use buildyard_core::{BuildRequest, BuildResult, RequestId};

use crate::error::{StoreError, StoreResult};
use crate::traits::RequestStore;

#[derive(Default)]
struct Inner {
    requests: BTreeMap<RequestId, BuildRequest>,
    claimed: BTreeSet<RequestId>,
}

/// Mutex-guarded in-memory implementation of [`RequestStore`].
#[derive(Default)]
pub struct MemoryRequestStore {
    inner: Mutex<Inner>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests still pending (unclaimed), across all builders.
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner.requests.len() - inner.claimed.len()
    }
}

impl RequestStore for MemoryRequestStore {
    fn submit(&self, request: BuildRequest) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        debug!(id = request.id, builder = %request.builder, "request submitted");
        inner.requests.insert(request.id, request);
        Ok(())
    }

    fn get_unclaimed(&self, builder: &str) -> StoreResult<Vec<BuildRequest>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut out: Vec<BuildRequest> = inner
            .requests
            .values()
            .filter(|r| r.builder == builder && !inner.claimed.contains(&r.id))
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.submitted_at, r.id));
        Ok(out)
    }

    fn claim(&self, ids: &BTreeSet<RequestId>) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        // Validate the whole set before mutating anything.
        for id in ids {
            if !inner.requests.contains_key(id) {
                return Err(StoreError::NotFound(*id));
            }
            if inner.claimed.contains(id) {
                return Err(StoreError::AlreadyClaimed(*id));
            }
        }
        inner.claimed.extend(ids.iter().copied());
        debug!(count = ids.len(), "requests claimed");
        Ok(())
    }

    fn unclaim(&self, ids: &BTreeSet<RequestId>) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        for id in ids {
            inner.claimed.remove(id);
        }
        debug!(count = ids.len(), "requests unclaimed");
        Ok(())
    }

    fn complete(&self, ids: &BTreeSet<RequestId>, result: BuildResult) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        for id in ids {
            match result {
                BuildResult::Retry => {
                    // Back into the unclaimed queue for the next pass.
                    inner.claimed.remove(id);
                }
                BuildResult::Success | BuildResult::Failure => {
                    inner.claimed.remove(id);
                    inner.requests.remove(id);
                }
            }
        }
        debug!(count = ids.len(), ?result, "requests completed");
        Ok(())
    }

    fn claimed_ids(&self) -> StoreResult<BTreeSet<RequestId>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.claimed.clone())
    }
}

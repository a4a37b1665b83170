//! Builder matching, merging, and claiming.
//!
//! One `Builder` owns one named build type. Its matching pass pairs
//! available workers with unclaimed requests until either side runs
//! out. A claim conflict (another master claimed first) restarts the
//! pass against freshly fetched requests; a policy returning something
//! outside its candidate set aborts the pass loudly — that is a
//! configuration bug, and other builders must keep running.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use buildyard_core::{
    BuildRequest, BuilderConfig, RequestId, WorkerName, default_merge_compatible,
};
use buildyard_locks::{LockAccess, LockRegistry};
use buildyard_pool::WorkerPool;
use buildyard_policy::SelectionPolicy;
use buildyard_store::RequestStore;

use crate::error::{DispatchError, DispatchResult};

/// Decides whether two pending requests may share one build.
pub type MergePredicate = Arc<dyn Fn(&BuildRequest, &BuildRequest) -> bool + Send + Sync>;

/// Picks the next request to build out of the unclaimed set (already
/// sorted oldest-first). Defaults to the head of the list.
pub type RequestChooser = Arc<dyn Fn(&[BuildRequest]) -> Option<RequestId> + Send + Sync>;

/// Receipt for a started build.
#[derive(Debug, Clone)]
pub struct BuildHandle {
    pub worker: WorkerName,
    pub request_ids: Vec<RequestId>,
}

/// The execution primitive: actually send work to a worker.
///
/// Failing before the worker acknowledges start makes the builder
/// unclaim the requests — they must never be silently dropped.
pub trait BuildStarter: Send + Sync {
    fn start_build(&self, worker: &WorkerName, requests: &[BuildRequest])
    -> anyhow::Result<BuildHandle>;
}

/// One named build type and its dispatch machinery.
pub struct Builder {
    config: BuilderConfig,
    policy: SelectionPolicy,
    merge_predicate: MergePredicate,
    request_chooser: RequestChooser,
    store: Arc<dyn RequestStore>,
    pool: Arc<WorkerPool>,
    locks: Arc<LockRegistry>,
    starter: Arc<dyn BuildStarter>,
}

impl Builder {
    pub fn new(
        config: BuilderConfig,
        policy: SelectionPolicy,
        store: Arc<dyn RequestStore>,
        pool: Arc<WorkerPool>,
        locks: Arc<LockRegistry>,
        starter: Arc<dyn BuildStarter>,
    ) -> Self {
        for spec in &config.locks {
            locks.register(spec);
        }
        Self {
            config,
            policy,
            merge_predicate: Arc::new(default_merge_compatible),
            request_chooser: Arc::new(|requests: &[BuildRequest]| {
                requests.first().map(|r| r.id)
            }),
            store,
            pool,
            locks,
            starter,
        }
    }

    /// Override the merge predicate (default: compatible source stamp
    /// and equal properties).
    pub fn with_merge_predicate(mut self, predicate: MergePredicate) -> Self {
        self.merge_predicate = predicate;
        self
    }

    /// Override the request chooser (default: oldest submitted first).
    pub fn with_request_chooser(mut self, chooser: RequestChooser) -> Self {
        self.request_chooser = chooser;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn category(&self) -> &str {
        &self.config.category
    }

    /// One matching pass: pair workers with requests until either side
    /// is exhausted. Returns the number of builds started.
    pub fn attempt_dispatch(&self) -> DispatchResult<u32> {
        let mut available = self.pool.available_for(&self.config.workers);
        let mut unclaimed = self.store.get_unclaimed(&self.config.name)?;
        let snapshot = self.pool.snapshot();
        let mut started = 0;

        while !available.is_empty() && !unclaimed.is_empty() {
            let now = Instant::now();
            let Some(worker) =
                self.policy
                    .choose(&self.config.name, &available, &snapshot, now)
            else {
                // Policy declined (e.g. floating policy waiting out a
                // grace period); it re-triggers us when ready.
                break;
            };
            if !available.contains(&worker) {
                error!(
                    builder = %self.config.name,
                    %worker,
                    "policy chose a worker outside the available set, aborting pass"
                );
                return Err(DispatchError::PolicyChoseUnavailableWorker(worker));
            }

            // All of the builder's locks must be grantable on this
            // worker, or it sits this round out.
            let accesses: Vec<LockAccess> = self
                .config
                .locks
                .iter()
                .map(|spec| LockAccess::for_spec(spec, &worker))
                .collect();
            if !accesses.iter().all(|a| self.locks.is_available(a)) {
                debug!(builder = %self.config.name, %worker, "locks unavailable, skipping worker");
                available.retain(|w| w != &worker);
                continue;
            }

            let Some(chosen_id) = (self.request_chooser)(&unclaimed) else {
                break;
            };
            let Some(chosen) = unclaimed.iter().find(|r| r.id == chosen_id).cloned() else {
                error!(
                    builder = %self.config.name,
                    request = chosen_id,
                    "chooser picked a request outside the unclaimed set, aborting pass"
                );
                return Err(DispatchError::ChoseUnknownRequest(chosen_id));
            };

            // Merge set: the chosen request plus every other unclaimed
            // request the predicate accepts against it.
            let mut merged = vec![chosen.clone()];
            if self.config.merge_requests {
                merged.extend(
                    unclaimed
                        .iter()
                        .filter(|r| r.id != chosen.id && (self.merge_predicate)(&chosen, r))
                        .cloned(),
                );
            }
            let ids: BTreeSet<RequestId> = merged.iter().map(|r| r.id).collect();

            match self.store.claim(&ids) {
                Ok(()) => {}
                Err(e) if e.is_claim_race() => {
                    // Another actor got there first. Discard stale local
                    // state and restart against fresh data — never
                    // retry the same ids blindly.
                    debug!(builder = %self.config.name, "claim race, re-fetching unclaimed requests");
                    unclaimed = self.store.get_unclaimed(&self.config.name)?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            unclaimed.retain(|r| !ids.contains(&r.id));
            available.retain(|w| w != &worker);

            let owner = lock_owner(&self.config.name, chosen.id);
            for access in &accesses {
                self.locks.claim(&owner, access);
            }
            self.pool.mark_building(&worker);

            match self.starter.start_build(&worker, &merged) {
                Ok(handle) => {
                    info!(
                        builder = %self.config.name,
                        %worker,
                        requests = handle.request_ids.len(),
                        "build dispatched"
                    );
                    started += 1;
                }
                Err(e) => {
                    // Hand-off failed before the worker acknowledged:
                    // roll everything back so the requests go to the
                    // next pass instead of vanishing.
                    warn!(
                        builder = %self.config.name,
                        %worker,
                        error = %e,
                        "build hand-off failed, unclaiming requests"
                    );
                    for access in &accesses {
                        self.locks.release(&owner, access);
                    }
                    self.pool.mark_finished(&worker);
                    self.store.unclaim(&ids)?;
                }
            }
        }

        Ok(started)
    }

    /// Release the locks a build claimed at dispatch time. Called by
    /// the execution subsystem when the build finishes.
    pub fn release_build_locks(&self, worker: &WorkerName, primary: RequestId) {
        let owner = lock_owner(&self.config.name, primary);
        for spec in &self.config.locks {
            let access = LockAccess::for_spec(spec, worker);
            self.locks.release(&owner, &access);
        }
    }
}

/// Lock-ownership token for one dispatched build.
fn lock_owner(builder: &str, primary: RequestId) -> String {
    format!("{builder}:{primary}")
}

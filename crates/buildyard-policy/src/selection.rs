//! The closed set of worker selection strategies.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use thiserror::Error;

use buildyard_core::WorkerName;
use buildyard_pool::PoolSnapshot;

use crate::floating::FloatingPolicy;

/// Errors in policy configuration or behavior.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("worker appears in both primary and floating sets: {0}")]
    OverlappingSets(WorkerName),

    /// A policy returned a worker that is not in the available set —
    /// a configuration bug that aborts the matching pass.
    #[error("policy chose worker not in the available set: {0}")]
    ChoseUnavailableWorker(WorkerName),
}

/// Signature for custom selection closures: given the available set,
/// pick one of its members (or decline).
pub type CustomChooser =
    Arc<dyn Fn(&[WorkerName]) -> Option<WorkerName> + Send + Sync>;

/// How a builder picks a worker from its available set.
#[derive(Clone)]
pub enum SelectionPolicy {
    /// Uniform-random choice.
    Default,
    /// Workers in `preferred` order first, random over the rest.
    Preferred { preferred: Vec<WorkerName> },
    /// Primary/backup failover with grace period (see [`FloatingPolicy`]).
    Floating(Arc<FloatingPolicy>),
    /// Caller-supplied closure.
    Custom(CustomChooser),
}

impl SelectionPolicy {
    /// Pick a worker from `available`, or decline for this invocation.
    ///
    /// Membership of the returned worker in `available` is validated by
    /// the builder, not here, so a buggy custom closure is surfaced as
    /// a loud abort of the matching pass.
    pub fn choose(
        &self,
        builder: &str,
        available: &[WorkerName],
        snapshot: &PoolSnapshot,
        now: Instant,
    ) -> Option<WorkerName> {
        if available.is_empty() {
            return None;
        }
        match self {
            SelectionPolicy::Default => pick_random(available),
            SelectionPolicy::Preferred { preferred } => {
                for name in preferred {
                    if available.contains(name) {
                        return Some(name.clone());
                    }
                }
                pick_random(available)
            }
            SelectionPolicy::Floating(policy) => {
                policy.next_worker(builder, available, snapshot, now)
            }
            SelectionPolicy::Custom(chooser) => chooser(available),
        }
    }
}

fn pick_random(available: &[WorkerName]) -> Option<WorkerName> {
    let idx = rand::rng().random_range(0..available.len());
    available.get(idx).cloned()
}

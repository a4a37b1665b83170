//! The worker pool.
//!
//! All mutation happens under one narrow mutex so that a transition
//! made by a transport task is observable by the next dispatch-loop
//! iteration. The dispatch loop itself never mutates worker state
//! except through `mark_building`/`mark_finished` after a successful
//! claim and hand-off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};

use buildyard_core::{WorkerConfig, WorkerName};

use crate::transport::WorkerTransport;

/// Outcome of an attach attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The worker is now connected.
    Attached,
    /// A duplicate connection arrived and the old one failed its
    /// liveness probe; the new connection took over.
    Replaced,
    /// A duplicate connection arrived but the existing one is still
    /// live; the new connection must be dropped by the transport.
    RejectedDuplicate,
    /// The name is not in the static configuration.
    Unknown,
}

struct WorkerState {
    connected: bool,
    building: u32,
    max_builds: Option<u32>,
    graceful_shutdown: bool,
    last_seen: Option<Instant>,
}

impl WorkerState {
    fn new(config: &WorkerConfig) -> Self {
        Self {
            connected: false,
            building: 0,
            max_builds: config.max_builds,
            graceful_shutdown: false,
            last_seen: None,
        }
    }

    fn can_accept_build(&self) -> bool {
        if !self.connected || self.graceful_shutdown {
            return false;
        }
        let cap = self.max_builds.unwrap_or(1);
        self.building < cap
    }
}

/// Read-only view of one worker, handed to selection policies.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSnapshot {
    pub connected: bool,
    pub building: u32,
    pub last_seen: Option<Instant>,
}

/// Snapshot of the whole pool at the start of a matching pass.
pub type PoolSnapshot = HashMap<WorkerName, WorkerSnapshot>;

/// Tracks connection and busy state for every configured worker.
pub struct WorkerPool {
    transport: Arc<dyn WorkerTransport>,
    workers: Mutex<HashMap<WorkerName, WorkerState>>,
}

impl WorkerPool {
    pub fn new(transport: Arc<dyn WorkerTransport>) -> Self {
        Self {
            transport,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a worker from static configuration. Workers are only
    /// ever created here; attach/detach flip the connected flag.
    pub fn register(&self, config: &WorkerConfig) {
        let mut workers = self.workers.lock().expect("pool mutex poisoned");
        workers
            .entry(config.name.clone())
            .or_insert_with(|| WorkerState::new(config));
    }

    /// A connection claiming this worker identity arrived.
    ///
    /// If the worker is already connected, the existing connection is
    /// probed first: it wins unless the probe fails, in which case the
    /// new connection takes over. A flaky network blip therefore never
    /// displaces a healthy connection.
    pub fn attach(&self, name: &WorkerName) -> AttachOutcome {
        let already_connected = {
            let workers = self.workers.lock().expect("pool mutex poisoned");
            match workers.get(name) {
                Some(state) => state.connected,
                None => {
                    warn!(worker = %name, "attach from unconfigured worker rejected");
                    return AttachOutcome::Unknown;
                }
            }
        };

        // Probe outside the pool lock; the transport may block on its
        // own timeout.
        if already_connected && self.transport.ping(name) {
            info!(worker = %name, "duplicate attach rejected, existing connection is live");
            return AttachOutcome::RejectedDuplicate;
        }

        let mut workers = self.workers.lock().expect("pool mutex poisoned");
        let Some(state) = workers.get_mut(name) else {
            return AttachOutcome::Unknown;
        };
        let outcome = if state.connected {
            info!(worker = %name, "existing connection failed probe, new connection wins");
            AttachOutcome::Replaced
        } else {
            debug!(worker = %name, "worker attached");
            AttachOutcome::Attached
        };
        state.connected = true;
        state.graceful_shutdown = false;
        state.last_seen = Some(Instant::now());
        outcome
    }

    /// The worker's connection dropped.
    pub fn detach(&self, name: &WorkerName) {
        let mut workers = self.workers.lock().expect("pool mutex poisoned");
        if let Some(state) = workers.get_mut(name) {
            state.connected = false;
            state.building = 0;
            state.last_seen = Some(Instant::now());
            debug!(worker = %name, "worker detached");
        }
    }

    /// Workers from `eligible` (a builder's configured list, in order)
    /// that can accept a build right now.
    pub fn available_for(&self, eligible: &[WorkerName]) -> Vec<WorkerName> {
        let workers = self.workers.lock().expect("pool mutex poisoned");
        eligible
            .iter()
            .filter(|name| {
                workers
                    .get(*name)
                    .is_some_and(|state| state.can_accept_build())
            })
            .cloned()
            .collect()
    }

    /// Account a build start on a worker.
    pub fn mark_building(&self, name: &WorkerName) {
        let mut workers = self.workers.lock().expect("pool mutex poisoned");
        if let Some(state) = workers.get_mut(name) {
            state.building += 1;
            state.last_seen = Some(Instant::now());
        }
    }

    /// Account a build finish on a worker.
    pub fn mark_finished(&self, name: &WorkerName) {
        let mut workers = self.workers.lock().expect("pool mutex poisoned");
        if let Some(state) = workers.get_mut(name) {
            state.building = state.building.saturating_sub(1);
            state.last_seen = Some(Instant::now());
        }
    }

    /// Administrative graceful shutdown: the worker finishes its
    /// current builds and then takes no more.
    pub fn request_graceful(&self, name: &WorkerName) {
        let mut workers = self.workers.lock().expect("pool mutex poisoned");
        if let Some(state) = workers.get_mut(name) {
            state.graceful_shutdown = true;
            info!(worker = %name, building = state.building, "graceful shutdown requested");
        }
    }

    /// Consistent snapshot for a matching pass.
    pub fn snapshot(&self) -> PoolSnapshot {
        let workers = self.workers.lock().expect("pool mutex poisoned");
        workers
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    WorkerSnapshot {
                        connected: state.connected,
                        building: state.building,
                        last_seen: state.last_seen,
                    },
                )
            })
            .collect()
    }

    /// Whether a worker is currently connected.
    pub fn is_connected(&self, name: &WorkerName) -> bool {
        let workers = self.workers.lock().expect("pool mutex poisoned");
        workers.get(name).is_some_and(|s| s.connected)
    }
}

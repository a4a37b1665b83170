//! The lock registry.
//!
//! `is_available` / `claim` are split rather than combined into one
//! atomic operation: the caller is the single dispatch loop, which
//! already guarantees no other matching pass runs concurrently. Waiters
//! queued behind a busy lock are woken on release by scanning the queue
//! head-to-tail and stopping at the first waiter that still cannot
//! proceed — deliberately not strict FIFO, since a counting waiter may
//! slip past a blocked exclusive one only if it sits ahead of it in the
//! queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use buildyard_core::{LockMode, LockScope, LockSpec, WorkerName};

/// One requested acquisition: which lock instance, in which mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockAccess {
    pub name: String,
    pub scope: LockScope,
    /// Worker the lock is instantiated for. Ignored for master scope.
    pub worker: Option<WorkerName>,
    pub mode: LockMode,
}

impl LockAccess {
    /// Build the access for a builder's lock spec against a chosen worker.
    pub fn for_spec(spec: &LockSpec, worker: &str) -> Self {
        Self {
            name: spec.name.clone(),
            scope: spec.scope,
            worker: match spec.scope {
                LockScope::Master => None,
                LockScope::PerWorker => Some(worker.to_string()),
            },
            mode: spec.mode,
        }
    }

    /// Key identifying the lock instance this access targets.
    fn instance_key(&self) -> (String, Option<WorkerName>) {
        (self.name.clone(), self.worker.clone())
    }
}

struct Waiter {
    mode: LockMode,
    wake: oneshot::Sender<()>,
}

/// One lock instance: holders plus the FIFO arrival queue of waiters.
struct LockState {
    max_count: u32,
    /// (owner, mode) pairs currently holding the lock.
    holders: Vec<(String, LockMode)>,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn new(max_count: u32) -> Self {
        Self {
            max_count,
            holders: Vec::new(),
            waiters: VecDeque::new(),
        }
    }

    fn would_admit(&self, mode: LockMode) -> bool {
        match mode {
            // Exclusive needs the lock completely free.
            LockMode::Exclusive => self.holders.is_empty(),
            // Counting must stay under max_count and never coexist
            // with an exclusive holder.
            LockMode::Counting => {
                (self.holders.len() as u32) < self.max_count
                    && !self.holders.iter().any(|(_, m)| *m == LockMode::Exclusive)
            }
        }
    }
}

/// Registry of all lock instances in one process.
///
/// Lock configurations (max counts) are taken from the first spec that
/// names each lock; per-worker instances are created lazily and cached.
#[derive(Default)]
pub struct LockRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Configured max_count per lock name.
    configs: HashMap<String, u32>,
    /// Live instances keyed by (name, worker).
    instances: HashMap<(String, Option<WorkerName>), LockState>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lock's configuration. First registration wins; a
    /// conflicting re-registration is a configuration bug and logged.
    pub fn register(&self, spec: &LockSpec) {
        let mut inner = self.inner.lock().expect("lock registry poisoned");
        match inner.configs.get(&spec.name) {
            Some(existing) if *existing != spec.max_count => {
                warn!(
                    lock = %spec.name,
                    existing,
                    requested = spec.max_count,
                    "conflicting max_count for lock, keeping existing"
                );
            }
            Some(_) => {}
            None => {
                inner.configs.insert(spec.name.clone(), spec.max_count);
            }
        }
    }

    /// Whether granting `access` right now would neither exceed the
    /// lock's max concurrent holders nor conflict with an exclusive one.
    pub fn is_available(&self, access: &LockAccess) -> bool {
        let mut inner = self.inner.lock().expect("lock registry poisoned");
        let state = instance_mut(&mut inner, access);
        state.would_admit(access.mode)
    }

    /// Record ownership. The caller must have checked `is_available`
    /// under the single-dispatch-loop invariant.
    pub fn claim(&self, owner: &str, access: &LockAccess) {
        let mut inner = self.inner.lock().expect("lock registry poisoned");
        let state = instance_mut(&mut inner, access);
        state.holders.push((owner.to_string(), access.mode));
        debug!(lock = %access.name, %owner, mode = ?access.mode, "lock claimed");
    }

    /// Remove ownership and wake any waiters that can now proceed.
    pub fn release(&self, owner: &str, access: &LockAccess) {
        let mut inner = self.inner.lock().expect("lock registry poisoned");
        let state = instance_mut(&mut inner, access);
        if let Some(pos) = state
            .holders
            .iter()
            .position(|(o, m)| o == owner && *m == access.mode)
        {
            state.holders.remove(pos);
        } else {
            warn!(lock = %access.name, %owner, "release by non-holder ignored");
            return;
        }
        debug!(lock = %access.name, %owner, "lock released");

        // Scan waiters head-to-tail, waking each whose own condition is
        // satisfiable, stopping at the first that still can't proceed.
        // Woken waiters re-attempt the claim themselves, so two counting
        // waiters may both wake for one freed slot.
        while let Some(front) = state.waiters.front() {
            if !state.would_admit(front.mode) {
                break;
            }
            let waiter = state.waiters.pop_front().expect("front checked");
            // The receiver may have been dropped; that just means the
            // build gave up waiting.
            let _ = waiter.wake.send(());
        }
    }

    /// Queue behind a busy lock. The returned receiver fires when the
    /// waiter should re-attempt `is_available` + `claim`.
    pub fn wait(&self, access: &LockAccess) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("lock registry poisoned");
        let state = instance_mut(&mut inner, access);
        state.waiters.push_back(Waiter {
            mode: access.mode,
            wake: tx,
        });
        rx
    }

    /// Current holder count for a lock instance (diagnostics).
    pub fn holder_count(&self, access: &LockAccess) -> usize {
        let mut inner = self.inner.lock().expect("lock registry poisoned");
        instance_mut(&mut inner, access).holders.len()
    }
}

/// Find or lazily create the lock instance an access targets.
fn instance_mut<'a>(inner: &'a mut Inner, access: &LockAccess) -> &'a mut LockState {
    let max_count = *inner.configs.get(&access.name).unwrap_or(&1);
    inner
        .instances
        .entry(access.instance_key())
        .or_insert_with(|| LockState::new(max_count))
}

//! The allocation algorithm.
//!
//! Three passes over the joined classes, in deterministic (sorted
//! class id) order:
//!
//! 1. re-apply the previous persisted assignment where still valid
//! 2. fill remaining finite-count classes
//! 3. fill unbounded classes
//!
//! Candidate workers for a class are drawn from its pools, minus
//! workers an exclusive class already consumed this run, ordered
//! not-recently-used first (each subset ascending by name). A class
//! nobody joins is skipped entirely; a joined class that cannot be
//! filled is a configuration error — pools are too small for the
//! declared demand — and fails loudly.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, info};

use buildyard_core::WorkerName;

use crate::state::PersistedState;

/// Result type alias for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors raised while declaring or computing an allocation.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("pool already defined: {0}")]
    DuplicatePool(String),

    #[error("worker {worker} appears in both pool {first} and pool {second}")]
    OverlappingPools {
        worker: WorkerName,
        first: String,
        second: String,
    },

    #[error("class {class} references undefined pool {pool}")]
    UndefinedPool { class: ClassId, pool: String },

    #[error("join references unknown class: {0}")]
    UnknownClass(ClassId),

    #[error("class {class} wanted {wanted} workers, only {got} available — pools too small for declared demand")]
    Unsatisfied {
        class: ClassId,
        wanted: String,
        got: usize,
    },

    #[error("allocation state file not found: {0}")]
    MissingState(std::path::PathBuf),

    #[error("failed to read allocation state: {0}")]
    StateIo(String),

    #[error("failed to parse allocation state: {0}")]
    StateParse(String),
}

/// A (name, subtype) pair identifying one pool-allocation unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId {
    pub name: String,
    pub subtype: Option<String>,
}

impl ClassId {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subtype: None,
        }
    }

    pub fn with_subtype(name: &str, subtype: &str) -> Self {
        Self {
            name: name.to_string(),
            subtype: Some(subtype.to_string()),
        }
    }
}

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.subtype {
            Some(sub) => write!(f, "{}/{}", self.name, sub),
            None => write!(f, "{}", self.name),
        }
    }
}

/// How many workers a class wants, and from where.
#[derive(Debug, Clone)]
pub struct ClassConfig {
    /// An exclusive class's workers are unavailable to every other
    /// class this run. Default.
    pub exclusive: bool,
    /// Pools the class may draw from. `None` means all pools.
    pub pools: Option<BTreeSet<String>>,
    /// Requested worker count. `None` means unbounded (take whatever
    /// remains).
    pub count: Option<u32>,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            exclusive: true,
            pools: None,
            count: Some(1),
        }
    }
}

/// The classes and keys one worker ended up serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAssignment {
    pub classes: BTreeSet<ClassId>,
    /// All keys joined to those classes, sorted.
    pub keys: Vec<String>,
}

/// Result of one allocation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub by_class: BTreeMap<ClassId, Vec<WorkerName>>,
    pub by_worker: BTreeMap<WorkerName, WorkerAssignment>,
    pub unallocated: BTreeSet<WorkerName>,
}

/// Declarative input: pools, classes, and join memberships.
#[derive(Default)]
pub struct Allocator {
    pools: BTreeMap<String, BTreeSet<WorkerName>>,
    classes: BTreeMap<ClassId, ClassConfig>,
    joins: BTreeMap<ClassId, BTreeSet<String>>,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a pool. Pools are disjoint — a worker in two pools is a
    /// configuration error, surfaced immediately.
    pub fn add_pool(
        &mut self,
        name: &str,
        workers: impl IntoIterator<Item = WorkerName>,
    ) -> AllocResult<()> {
        if self.pools.contains_key(name) {
            return Err(AllocError::DuplicatePool(name.to_string()));
        }
        let workers: BTreeSet<WorkerName> = workers.into_iter().collect();
        for (existing_name, existing) in &self.pools {
            if let Some(dup) = workers.intersection(existing).next() {
                return Err(AllocError::OverlappingPools {
                    worker: dup.clone(),
                    first: existing_name.clone(),
                    second: name.to_string(),
                });
            }
        }
        self.pools.insert(name.to_string(), workers);
        Ok(())
    }

    /// Declare a class.
    pub fn add_class(&mut self, id: ClassId, config: ClassConfig) {
        self.classes.insert(id, config);
    }

    /// Join a key (typically a builder name) to a class. Classes with
    /// no joined keys are skipped by the computation.
    pub fn join(&mut self, key: &str, class: &ClassId) -> AllocResult<()> {
        if !self.classes.contains_key(class) {
            return Err(AllocError::UnknownClass(class.clone()));
        }
        self.joins
            .entry(class.clone())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    /// Compute the assignment, biased toward `previous` where supplied.
    pub fn compute(&self, previous: Option<&PersistedState>) -> AllocResult<Allocation> {
        self.validate_pool_refs()?;

        let mut run = Run {
            allocator: self,
            assigned: BTreeMap::new(),
            exclusive_taken: BTreeSet::new(),
            used: BTreeSet::new(),
        };

        let joined: Vec<(&ClassId, &ClassConfig)> = self
            .classes
            .iter()
            .filter(|(id, _)| self.joins.get(id).is_some_and(|keys| !keys.is_empty()))
            .collect();

        // Pass 1: previous persisted state, for affinity.
        if let Some(previous) = previous {
            for (id, config) in &joined {
                if let Some(prev_workers) = previous.workers_for(id) {
                    run.allocate(id, config, Some(prev_workers));
                }
            }
        }

        // Pass 2: remaining finite-count classes.
        for (id, config) in &joined {
            if config.count.is_some() {
                run.allocate(id, config, None);
            }
        }

        // Pass 3: unbounded classes soak up what's left.
        for (id, config) in &joined {
            if config.count.is_none() {
                run.allocate(id, config, None);
            }
        }

        // Every joined class must have been satisfied.
        for (id, config) in &joined {
            let got = run.assigned.get(*id).map_or(0, Vec::len);
            let satisfied = match config.count {
                Some(count) => got == count as usize,
                None => got >= 1,
            };
            if !satisfied {
                return Err(AllocError::Unsatisfied {
                    class: (*id).clone(),
                    wanted: config
                        .count
                        .map_or_else(|| "unbounded".to_string(), |c| c.to_string()),
                    got,
                });
            }
        }

        Ok(self.build_output(run.assigned))
    }

    fn validate_pool_refs(&self) -> AllocResult<()> {
        for (id, config) in &self.classes {
            if let Some(pools) = &config.pools {
                for pool in pools {
                    if !self.pools.contains_key(pool) {
                        return Err(AllocError::UndefinedPool {
                            class: id.clone(),
                            pool: pool.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn build_output(&self, by_class: BTreeMap<ClassId, Vec<WorkerName>>) -> Allocation {
        let mut by_worker: BTreeMap<WorkerName, WorkerAssignment> = BTreeMap::new();
        for (id, workers) in &by_class {
            for worker in workers {
                let entry = by_worker
                    .entry(worker.clone())
                    .or_insert_with(|| WorkerAssignment {
                        classes: BTreeSet::new(),
                        keys: Vec::new(),
                    });
                entry.classes.insert(id.clone());
            }
        }
        for assignment in by_worker.values_mut() {
            let mut keys: BTreeSet<String> = BTreeSet::new();
            for class in &assignment.classes {
                if let Some(joined) = self.joins.get(class) {
                    keys.extend(joined.iter().cloned());
                }
            }
            assignment.keys = keys.into_iter().collect();
        }

        let unallocated: BTreeSet<WorkerName> = self
            .pools
            .values()
            .flatten()
            .filter(|w| !by_worker.contains_key(*w))
            .cloned()
            .collect();

        info!(
            classes = by_class.len(),
            workers = by_worker.len(),
            unallocated = unallocated.len(),
            "allocation computed"
        );

        Allocation {
            by_class,
            by_worker,
            unallocated,
        }
    }
}

/// Mutable state threaded through the allocation passes.
struct Run<'a> {
    allocator: &'a Allocator,
    assigned: BTreeMap<ClassId, Vec<WorkerName>>,
    exclusive_taken: BTreeSet<WorkerName>,
    /// Workers handed out so far this run; fresh workers are preferred.
    used: BTreeSet<WorkerName>,
}

impl Run<'_> {
    /// Allocate as much of `id`'s remaining demand as possible from the
    /// candidate ordering. `prev` restricts candidates to the previous
    /// run's assignment (the affinity pass).
    fn allocate(&mut self, id: &ClassId, config: &ClassConfig, prev: Option<&Vec<WorkerName>>) {
        let already: BTreeSet<WorkerName> = self
            .assigned
            .get(id)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();

        let remaining = match config.count {
            Some(count) => (count as usize).saturating_sub(already.len()),
            None => usize::MAX,
        };
        if remaining == 0 {
            return;
        }

        let mut candidates: BTreeSet<WorkerName> = match &config.pools {
            Some(pools) => pools
                .iter()
                .filter_map(|p| self.allocator.pools.get(p))
                .flatten()
                .cloned()
                .collect(),
            None => self.allocator.pools.values().flatten().cloned().collect(),
        };
        candidates.retain(|w| !self.exclusive_taken.contains(w) && !already.contains(w));
        if let Some(prev) = prev {
            let prev_set: BTreeSet<&WorkerName> = prev.iter().collect();
            candidates.retain(|w| prev_set.contains(w));
        }

        // Not-recently-used first; both subsets ascend by name (BTreeSet
        // iteration order).
        let fresh = candidates.iter().filter(|w| !self.used.contains(*w));
        let stale = candidates.iter().filter(|w| self.used.contains(*w));
        let ordered: Vec<WorkerName> = fresh.chain(stale).cloned().collect();

        for worker in ordered.into_iter().take(remaining) {
            debug!(class = %id, worker = %worker, "worker allocated");
            self.used.insert(worker.clone());
            if config.exclusive {
                self.exclusive_taken.insert(worker.clone());
            }
            self.assigned.entry(id.clone()).or_default().push(worker);
        }
    }
}

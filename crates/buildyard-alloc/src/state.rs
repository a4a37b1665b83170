//! Persisted allocation state.
//!
//! A small JSON document, grouped by class name then subtype, fed back
//! into the next run's affinity pass:
//!
//! ```json
//! {
//!   "class_map": {
//!     "build": { "<none>": ["vm10", "vm11"] },
//!     "test":  { "dbg": ["vm12"], "rel": ["vm13"] }
//!   },
//!   "unallocated": ["vm99"]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use buildyard_core::WorkerName;

use crate::allocator::{AllocError, AllocResult, Allocation, ClassId};

/// Marker used as the subtype key for classes without a subtype.
pub const NO_SUBTYPE: &str = "<none>";

/// The persisted class → subtype → workers mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub class_map: BTreeMap<String, BTreeMap<String, Vec<WorkerName>>>,
    /// Present only when the allocator is configured to report it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unallocated: Option<Vec<WorkerName>>,
}

impl PersistedState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture an allocation result for the next run.
    pub fn from_allocation(allocation: &Allocation, report_unallocated: bool) -> Self {
        let mut state = Self::empty();
        for (id, workers) in &allocation.by_class {
            state.record(id, workers);
        }
        if report_unallocated {
            state.unallocated = Some(allocation.unallocated.iter().cloned().collect());
        }
        state
    }

    /// Record one class's worker list (stored sorted).
    pub fn record(&mut self, class: &ClassId, workers: &[WorkerName]) {
        let subtype = class
            .subtype
            .clone()
            .unwrap_or_else(|| NO_SUBTYPE.to_string());
        let mut sorted = workers.to_vec();
        sorted.sort();
        self.class_map
            .entry(class.name.clone())
            .or_default()
            .insert(subtype, sorted);
    }

    /// The previous run's workers for a class, if recorded.
    pub fn workers_for(&self, class: &ClassId) -> Option<&Vec<WorkerName>> {
        let subtype = class.subtype.as_deref().unwrap_or(NO_SUBTYPE);
        self.class_map.get(&class.name)?.get(subtype)
    }

    /// Load from disk. A missing file is an error in strict mode and
    /// empty state in permissive mode; a malformed file is always an
    /// error.
    pub fn load(path: &Path, strict: bool) -> AllocResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if strict {
                    return Err(AllocError::MissingState(path.to_path_buf()));
                }
                debug!(?path, "no previous allocation state, starting empty");
                return Ok(Self::empty());
            }
            Err(e) => return Err(AllocError::StateIo(e.to_string())),
        };
        serde_json::from_str(&text).map_err(|e| AllocError::StateParse(e.to_string()))
    }

    /// Persist to disk as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> AllocResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| AllocError::StateParse(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| AllocError::StateIo(e.to_string()))?;
        debug!(?path, classes = self.class_map.len(), "allocation state saved");
        Ok(())
    }
}

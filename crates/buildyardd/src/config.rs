//! Daemon configuration.
//!
//! One TOML file describes the whole master: workers, builders with
//! their selection policies, and (optionally) the worker-class
//! allocator whose output seeds builder worker lists out of band.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use buildyard_alloc::{Allocator, ClassConfig, ClassId};
use buildyard_core::{BuilderConfig, WorkerConfig, WorkerName};
use buildyard_policy::FloatingConfig;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Directory holding the request database and allocation state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub workers: Vec<WorkerConfig>,

    #[serde(default)]
    pub builders: Vec<BuilderEntry>,

    pub allocator: Option<AllocatorSection>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/buildyard")
}

/// A builder plus its selection policy.
#[derive(Debug, Deserialize)]
pub struct BuilderEntry {
    #[serde(flatten)]
    pub config: BuilderConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Declarative form of [`SelectionPolicy`].
///
/// [`SelectionPolicy`]: buildyard_policy::SelectionPolicy
#[derive(Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfig {
    #[default]
    Random,
    Preferred {
        preferred: Vec<WorkerName>,
    },
    Floating {
        primary: Vec<WorkerName>,
        floating: Vec<WorkerName>,
        grace_period_secs: u64,
    },
}

impl PolicyConfig {
    /// The floating parameters, if this is a floating policy.
    pub fn floating_config(&self) -> Option<FloatingConfig> {
        match self {
            PolicyConfig::Floating {
                primary,
                floating,
                grace_period_secs,
            } => Some(FloatingConfig {
                primary: primary.clone(),
                floating: floating.clone(),
                grace_period: Duration::from_secs(*grace_period_secs),
            }),
            _ => None,
        }
    }
}

// ── Allocator section ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllocatorSection {
    /// File the class → workers mapping is persisted to, relative to
    /// `data_dir` unless absolute.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Include the leftover workers in the persisted state.
    #[serde(default)]
    pub report_unallocated: bool,

    #[serde(default)]
    pub pools: Vec<PoolEntry>,

    #[serde(default)]
    pub classes: Vec<ClassEntry>,

    #[serde(default)]
    pub joins: Vec<JoinEntry>,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("slave_pools.json")
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolEntry {
    pub name: String,
    pub workers: Vec<WorkerName>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassEntry {
    pub name: String,
    pub subtype: Option<String>,
    /// Exclusive classes consume their workers.
    #[serde(default = "default_true")]
    pub exclusive: bool,
    /// Pools the class may draw from; absent means all pools.
    pub pools: Option<Vec<String>>,
    /// Exact worker count; absent means "all remaining".
    pub count: Option<u32>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinEntry {
    pub builder: String,
    pub class: String,
    pub subtype: Option<String>,
}

impl ClassEntry {
    pub fn id(&self) -> ClassId {
        match &self.subtype {
            Some(sub) => ClassId::with_subtype(&self.name, sub),
            None => ClassId::new(&self.name),
        }
    }
}

impl AllocatorSection {
    /// Build the allocator from the declarative section.
    pub fn build(&self) -> anyhow::Result<Allocator> {
        let mut alloc = Allocator::new();
        for pool in &self.pools {
            alloc.add_pool(&pool.name, pool.workers.clone())?;
        }
        for class in &self.classes {
            alloc.add_class(
                class.id(),
                ClassConfig {
                    exclusive: class.exclusive,
                    pools: class
                        .pools
                        .as_ref()
                        .map(|names| names.iter().cloned().collect()),
                    count: class.count,
                },
            );
        }
        for join in &self.joins {
            let id = match &join.subtype {
                Some(sub) => ClassId::with_subtype(&join.class, sub),
                None => ClassId::new(&join.class),
            };
            alloc.join(&join.builder, &id)?;
        }
        Ok(alloc)
    }

    pub fn state_path(&self, data_dir: &Path) -> PathBuf {
        if self.state_file.is_absolute() {
            self.state_file.clone()
        } else {
            data_dir.join(&self.state_file)
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for entry in &self.builders {
            for worker in &entry.config.workers {
                anyhow::ensure!(
                    self.workers.iter().any(|w| &w.name == worker),
                    "builder {} references unconfigured worker {worker}",
                    entry.config.name
                );
            }
        }
        Ok(())
    }
}

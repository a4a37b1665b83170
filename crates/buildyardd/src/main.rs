//! buildyardd — the build-dispatch master daemon.
//!
//! Single binary that assembles the dispatch subsystems:
//! - Request store (redb)
//! - Worker pool
//! - Lock registry
//! - Selection policies (random / preferred / floating failover)
//! - Dispatcher activity loop
//!
//! # Usage
//!
//! ```text
//! buildyardd run --config /etc/buildyard/master.toml
//! buildyardd alloc-update --config /etc/buildyard/master.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use buildyard_alloc::PersistedState;
use buildyard_core::{BuildRequest, CategoryPrioritizer, WorkerName};
use buildyard_dispatch::{BuildHandle, BuildStarter, SchedulingContext};
use buildyard_locks::LockRegistry;
use buildyard_policy::{FloatingPolicy, SelectionPolicy};
use buildyard_pool::{StaticTransport, WorkerPool, WorkerTransport};
use buildyard_store::RedbRequestStore;

use config::{DaemonConfig, PolicyConfig};

#[derive(Parser)]
#[command(name = "buildyardd", about = "Buildyard dispatch master")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch master.
    Run {
        /// Path to the master configuration file.
        #[arg(long, default_value = "/etc/buildyard/master.toml")]
        config: PathBuf,
    },

    /// Recompute the worker-class allocation and persist it.
    AllocUpdate {
        /// Path to the master configuration file.
        #[arg(long, default_value = "/etc/buildyard/master.toml")]
        config: PathBuf,

        /// Override the allocation state file from the config.
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,buildyard=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(config).await,
        Command::AllocUpdate { config, state } => alloc_update(config, state),
    }
}

/// Placeholder execution layer: logs hand-offs. The real wire protocol
/// plugs in behind [`BuildStarter`] without touching dispatch.
struct LogStarter;

impl BuildStarter for LogStarter {
    fn start_build(
        &self,
        worker: &WorkerName,
        requests: &[BuildRequest],
    ) -> anyhow::Result<BuildHandle> {
        info!(
            %worker,
            builder = %requests[0].builder,
            requests = requests.len(),
            "build handed off"
        );
        Ok(BuildHandle {
            worker: worker.clone(),
            request_ids: requests.iter().map(|r| r.id).collect(),
        })
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    info!(
        workers = config.workers.len(),
        builders = config.builders.len(),
        "buildyard master starting"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let db_path = config.data_dir.join("requests.redb");
    let store = Arc::new(RedbRequestStore::open(&db_path)?);
    info!(path = ?db_path, "request store opened");

    let transport: Arc<dyn WorkerTransport> = Arc::new(StaticTransport::always_alive());
    let pool = Arc::new(WorkerPool::new(transport));
    for worker in &config.workers {
        pool.register(worker);
    }

    let ctx = SchedulingContext::new(
        store,
        pool,
        Arc::new(LockRegistry::new()),
        Arc::new(LogStarter),
        Box::new(CategoryPrioritizer),
    );

    for entry in &config.builders {
        let policy = match &entry.policy {
            PolicyConfig::Random => SelectionPolicy::Default,
            PolicyConfig::Preferred { preferred } => SelectionPolicy::Preferred {
                preferred: preferred.clone(),
            },
            PolicyConfig::Floating { .. } => {
                let floating_config = entry
                    .policy
                    .floating_config()
                    .context("floating policy without parameters")?;
                let policy =
                    FloatingPolicy::new(floating_config, ctx.dispatcher().notifier())
                        .with_context(|| {
                            format!("floating policy for builder {}", entry.config.name)
                        })?;
                SelectionPolicy::Floating(Arc::new(policy))
            }
        };
        ctx.add_builder(entry.config.clone(), policy);
    }

    ctx.start();
    info!("dispatch loop running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining dispatch loop");
    ctx.shutdown().await;
    info!("buildyard master stopped");
    Ok(())
}

fn alloc_update(config_path: PathBuf, state_override: Option<PathBuf>) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    let Some(section) = &config.allocator else {
        anyhow::bail!("configuration defines no allocator section, nothing to allocate");
    };
    if section.classes.is_empty() {
        anyhow::bail!("allocator section defines no worker classes, nothing to allocate");
    }

    let allocator = section.build()?;
    let state_path = state_override.unwrap_or_else(|| section.state_path(&config.data_dir));

    // Missing previous state just means a cold start.
    let previous = PersistedState::load(&state_path, false)?;
    let allocation = allocator.compute(Some(&previous))?;

    for (class, workers) in &allocation.by_class {
        info!(%class, workers = workers.len(), "class allocated");
    }
    if !allocation.unallocated.is_empty() {
        info!(unallocated = allocation.unallocated.len(), "workers left unallocated");
    }

    let next = PersistedState::from_allocation(&allocation, section.report_unallocated);
    next.save(&state_path)?;
    info!(path = ?state_path, "allocation state written");
    Ok(())
}

//! Wiring between the outside world and the dispatch core.
//!
//! `SchedulingContext` owns the shared subsystems (store, pool, locks,
//! dispatcher) and translates external events into store mutations plus
//! dispatcher notifications. Event entry points are cheap and
//! non-blocking; all actual matching happens on the dispatch task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use buildyard_core::{
    BuildRequest, BuildResult, BuilderConfig, BuilderName, Prioritizer, WorkerName,
};
use buildyard_locks::LockRegistry;
use buildyard_policy::SelectionPolicy;
use buildyard_pool::{AttachOutcome, WorkerPool};
use buildyard_store::RequestStore;

use crate::builder::{BuildHandle, BuildStarter, Builder};
use crate::dispatcher::Dispatcher;
use crate::error::DispatchResult;

/// Top-level handle to a running dispatch subsystem.
pub struct SchedulingContext {
    store: Arc<dyn RequestStore>,
    pool: Arc<WorkerPool>,
    locks: Arc<LockRegistry>,
    starter: Arc<dyn BuildStarter>,
    dispatcher: Arc<Dispatcher>,
    /// Which builders are eligible to use each worker, for targeted
    /// notification on attach/detach.
    by_worker: Mutex<HashMap<WorkerName, Vec<BuilderName>>>,
}

impl SchedulingContext {
    pub fn new(
        store: Arc<dyn RequestStore>,
        pool: Arc<WorkerPool>,
        locks: Arc<LockRegistry>,
        starter: Arc<dyn BuildStarter>,
        prioritizer: Box<dyn Prioritizer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            locks,
            starter,
            dispatcher: Arc::new(Dispatcher::new(prioritizer)),
            by_worker: Mutex::new(HashMap::new()),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Register a builder with its selection policy. Its lock specs are
    /// registered as a side effect of constructing the [`Builder`].
    pub fn add_builder(&self, config: BuilderConfig, policy: SelectionPolicy) {
        {
            let mut by_worker = self.by_worker.lock().expect("context mutex poisoned");
            for worker in &config.workers {
                by_worker
                    .entry(worker.clone())
                    .or_default()
                    .push(config.name.clone());
            }
        }
        info!(builder = %config.name, category = %config.category, "builder registered");
        let builder = Builder::new(
            config,
            policy,
            self.store.clone(),
            self.pool.clone(),
            self.locks.clone(),
            self.starter.clone(),
        );
        self.dispatcher.add_builder(Arc::new(builder));
    }

    pub fn start(&self) {
        // start() takes Arc<Self> on the dispatcher.
        Arc::clone(&self.dispatcher).start();
    }

    pub async fn shutdown(&self) {
        self.dispatcher.stop().await;
    }

    // ── Event entry points ──────────────────────────────────────────

    /// A new build request arrived from the outside.
    pub fn request_submitted(&self, request: BuildRequest) -> DispatchResult<()> {
        let builder = request.builder.clone();
        self.store.submit(request)?;
        self.dispatcher.notify(&[builder]);
        Ok(())
    }

    /// A worker connection came up. New capacity may unblock any
    /// builder configured to use it.
    pub fn worker_attached(&self, name: &WorkerName) -> AttachOutcome {
        let outcome = self.pool.attach(name);
        if matches!(outcome, AttachOutcome::Attached | AttachOutcome::Replaced) {
            self.notify_users_of(name);
        }
        outcome
    }

    /// A worker connection dropped. Floating policies re-evaluate their
    /// grace clocks on the next pass, so this notifies too.
    pub fn worker_detached(&self, name: &WorkerName) {
        self.pool.detach(name);
        self.notify_users_of(name);
    }

    /// A dispatched build finished. `Retry` puts the requests back in
    /// the queue; any other result completes them.
    pub fn build_finished(
        &self,
        builder: &str,
        handle: &BuildHandle,
        result: BuildResult,
    ) -> DispatchResult<()> {
        let ids = handle.request_ids.iter().copied().collect();
        self.store.complete(&ids, result)?;
        if let Some(b) = self.dispatcher.builder(builder) {
            // The first id is the primary request the locks were
            // claimed under at dispatch time.
            if let Some(primary) = handle.request_ids.first() {
                b.release_build_locks(&handle.worker, *primary);
            }
        }
        self.pool.mark_finished(&handle.worker);
        info!(
            builder,
            worker = %handle.worker,
            requests = handle.request_ids.len(),
            ?result,
            "build finished"
        );
        // Freed capacity (and possibly freed locks) for this builder.
        self.dispatcher.notify(&[builder.to_string()]);
        Ok(())
    }

    fn notify_users_of(&self, worker: &WorkerName) {
        let users = {
            let by_worker = self.by_worker.lock().expect("context mutex poisoned");
            by_worker.get(worker).cloned().unwrap_or_default()
        };
        self.dispatcher.notify(&users);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildyard_core::{CategoryPrioritizer, Properties, SourceStamp, WorkerConfig};
    use buildyard_pool::{StaticTransport, WorkerTransport};
    use buildyard_store::MemoryRequestStore;
    use std::time::Duration;

    struct CountingStarter {
        handles: Mutex<Vec<BuildHandle>>,
    }

    impl CountingStarter {
        fn new() -> Self {
            Self {
                handles: Mutex::new(Vec::new()),
            }
        }

        fn handles(&self) -> Vec<BuildHandle> {
            self.handles.lock().unwrap().clone()
        }
    }

    impl BuildStarter for CountingStarter {
        fn start_build(
            &self,
            worker: &WorkerName,
            requests: &[BuildRequest],
        ) -> anyhow::Result<BuildHandle> {
            let handle = BuildHandle {
                worker: worker.clone(),
                request_ids: requests.iter().map(|r| r.id).collect(),
            };
            self.handles.lock().unwrap().push(handle.clone());
            Ok(handle)
        }
    }

    fn context(workers: &[&str]) -> (Arc<SchedulingContext>, Arc<CountingStarter>) {
        let transport: Arc<dyn WorkerTransport> = Arc::new(StaticTransport::always_alive());
        let pool = Arc::new(WorkerPool::new(transport));
        for w in workers {
            pool.register(&WorkerConfig {
                name: w.to_string(),
                max_builds: None,
            });
        }
        let starter = Arc::new(CountingStarter::new());
        let ctx = SchedulingContext::new(
            Arc::new(MemoryRequestStore::new()),
            pool,
            Arc::new(LockRegistry::new()),
            starter.clone(),
            Box::new(CategoryPrioritizer),
        );
        (ctx, starter)
    }

    fn config(name: &str, workers: &[&str]) -> BuilderConfig {
        BuilderConfig {
            name: name.to_string(),
            category: "2linux".to_string(),
            workers: workers.iter().map(|s| s.to_string()).collect(),
            merge_requests: false,
            locks: Vec::new(),
        }
    }

    fn request(id: u64, builder: &str) -> BuildRequest {
        BuildRequest {
            id,
            builder: builder.to_string(),
            submitted_at: id,
            source: SourceStamp {
                repository: "repo".to_string(),
                branch: "main".to_string(),
                revision: format!("r{id}"),
                patch: None,
            },
            properties: Properties::new(),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn submit_then_attach_dispatches() {
        let (ctx, starter) = context(&["w1"]);
        ctx.add_builder(config("linux-rel", &["w1"]), SelectionPolicy::Default);
        ctx.start();

        // No worker yet: the request just queues.
        ctx.request_submitted(request(1, "linux-rel")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(starter.handles().is_empty());

        // Attach triggers the builders configured for this worker.
        assert_eq!(
            ctx.worker_attached(&"w1".to_string()),
            AttachOutcome::Attached
        );
        let s = starter.clone();
        wait_until(move || !s.handles().is_empty()).await;
        assert_eq!(starter.handles()[0].request_ids, vec![1]);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn retry_result_requeues_and_redispatches() {
        let (ctx, starter) = context(&["w1"]);
        ctx.add_builder(config("linux-rel", &["w1"]), SelectionPolicy::Default);
        ctx.worker_attached(&"w1".to_string());
        ctx.start();

        ctx.request_submitted(request(1, "linux-rel")).unwrap();
        let s = starter.clone();
        wait_until(move || s.handles().len() == 1).await;

        let handle = starter.handles()[0].clone();
        ctx.build_finished("linux-rel", &handle, BuildResult::Retry)
            .unwrap();

        // The same request goes around again.
        let s = starter.clone();
        wait_until(move || s.handles().len() == 2).await;
        assert_eq!(starter.handles()[1].request_ids, vec![1]);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn success_frees_worker_for_next_request() {
        let (ctx, starter) = context(&["w1"]);
        ctx.add_builder(config("linux-rel", &["w1"]), SelectionPolicy::Default);
        ctx.worker_attached(&"w1".to_string());
        ctx.start();

        ctx.request_submitted(request(1, "linux-rel")).unwrap();
        let s = starter.clone();
        wait_until(move || s.handles().len() == 1).await;

        // Worker busy: the second request waits.
        ctx.request_submitted(request(2, "linux-rel")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(starter.handles().len(), 1);

        let handle = starter.handles()[0].clone();
        ctx.build_finished("linux-rel", &handle, BuildResult::Success)
            .unwrap();

        let s = starter.clone();
        wait_until(move || s.handles().len() == 2).await;
        assert_eq!(starter.handles()[1].request_ids, vec![2]);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn detach_makes_worker_unavailable() {
        let (ctx, starter) = context(&["w1"]);
        ctx.add_builder(config("linux-rel", &["w1"]), SelectionPolicy::Default);
        ctx.worker_attached(&"w1".to_string());
        ctx.worker_detached(&"w1".to_string());
        ctx.start();

        ctx.request_submitted(request(1, "linux-rel")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(starter.handles().is_empty());
        ctx.shutdown().await;
    }
}

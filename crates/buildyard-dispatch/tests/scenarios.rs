//! End-to-end dispatch scenarios over the in-memory store.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use buildyard_core::{
    BuildRequest, BuildResult, BuilderConfig, CategoryPrioritizer, Properties, RequestId,
    SourceStamp, WorkerConfig, WorkerName,
};
use buildyard_dispatch::{BuildHandle, BuildStarter, Builder, SchedulingContext};
use buildyard_locks::LockRegistry;
use buildyard_policy::{FloatingConfig, FloatingPolicy, SelectionPolicy};
use buildyard_pool::{StaticTransport, WorkerPool, WorkerTransport};
use buildyard_store::{MemoryRequestStore, RequestStore};

fn request(id: RequestId, builder: &str, branch: &str) -> BuildRequest {
    BuildRequest {
        id,
        builder: builder.to_string(),
        submitted_at: id,
        source: SourceStamp {
            repository: "https://chromium.example/src".to_string(),
            branch: branch.to_string(),
            revision: format!("r{id}"),
            patch: None,
        },
        properties: Properties::new(),
    }
}

fn pool_with(workers: &[&str]) -> Arc<WorkerPool> {
    let transport: Arc<dyn WorkerTransport> = Arc::new(StaticTransport::always_alive());
    let pool = Arc::new(WorkerPool::new(transport));
    for w in workers {
        pool.register(&WorkerConfig {
            name: w.to_string(),
            max_builds: None,
        });
        pool.attach(&w.to_string());
    }
    pool
}

fn config(name: &str, category: &str, workers: &[&str], merge: bool) -> BuilderConfig {
    BuilderConfig {
        name: name.to_string(),
        category: category.to_string(),
        workers: workers.iter().map(|s| s.to_string()).collect(),
        merge_requests: merge,
        locks: Vec::new(),
    }
}

fn first_available() -> SelectionPolicy {
    SelectionPolicy::Custom(Arc::new(|available: &[WorkerName]| {
        available.first().cloned()
    }))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}

#[derive(Default)]
struct Recorder {
    handles: Mutex<Vec<BuildHandle>>,
}

impl Recorder {
    fn handles(&self) -> Vec<BuildHandle> {
        self.handles.lock().unwrap().clone()
    }

    fn dispatched_ids(&self) -> Vec<RequestId> {
        self.handles()
            .iter()
            .flat_map(|h| h.request_ids.clone())
            .collect()
    }
}

impl BuildStarter for Recorder {
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

/// Two masters race over one store: a second dispatcher claims a
/// request in the middle of the first one's matching pass. Every
/// request must be dispatched exactly once across both.
#[test]
fn at_most_once_across_interleaved_masters() {
    let store = Arc::new(MemoryRequestStore::new());
    store.submit(request(1, "linux-rel", "main")).unwrap();
    store.submit(request(2, "linux-rel", "main")).unwrap();

    let recorder_b = Arc::new(Recorder::default());
    let builder_b = Arc::new(Builder::new(
        config("linux-rel", "2linux", &["b-w1"], false),
        first_available(),
        store.clone(),
        pool_with(&["b-w1"]),
        Arc::new(LockRegistry::new()),
        recorder_b.clone(),
    ));

    /// Starter that runs the rival master's pass in the middle of the
    /// first successful hand-off.
    struct InterleavingStarter {
        inner: Recorder,
        rival: Arc<Builder>,
        fired: OnceLock<()>,
    }

    impl BuildStarter for InterleavingStarter {
        fn start_build(
            &self,
            worker: &WorkerName,
            requests: &[BuildRequest],
        ) -> anyhow::Result<BuildHandle> {
            if self.fired.set(()).is_ok() {
                self.rival.attempt_dispatch().unwrap();
            }
            self.inner.start_build(worker, requests)
        }
    }

    let starter_a = Arc::new(InterleavingStarter {
        inner: Recorder::default(),
        rival: builder_b.clone(),
        fired: OnceLock::new(),
    });
    let builder_a = Builder::new(
        config("linux-rel", "2linux", &["a-w1", "a-w2"], false),
        first_available(),
        store.clone(),
        pool_with(&["a-w1", "a-w2"]),
        Arc::new(LockRegistry::new()),
        starter_a.clone(),
    );

    // Master A picks request 1; mid hand-off, master B claims request 2.
    // A's stale local copy of 2 then loses the claim race and A finds
    // nothing left after the re-fetch.
    builder_a.attempt_dispatch().unwrap();

    let mut all: Vec<RequestId> = starter_a.inner.dispatched_ids();
    all.extend(recorder_b.dispatched_ids());
    all.sort_unstable();
    assert_eq!(all, vec![1, 2], "each request dispatched exactly once");
    assert_eq!(
        store.claimed_ids().unwrap(),
        BTreeSet::from([1, 2]),
        "both requests end up claimed"
    );
    assert!(store.get_unclaimed("linux-rel").unwrap().is_empty());
}

/// Merging takes exactly the compatible requests; the incompatible one
/// waits and goes out on the next free worker.
#[tokio::test]
async fn merged_build_leaves_incompatible_request_queued() {
    let store = Arc::new(MemoryRequestStore::new());
    let pool = pool_with(&[]);
    pool.register(&WorkerConfig {
        name: "w1".to_string(),
        max_builds: None,
    });
    let recorder = Arc::new(Recorder::default());
    let ctx = SchedulingContext::new(
        store.clone(),
        pool,
        Arc::new(LockRegistry::new()),
        recorder.clone(),
        Box::new(CategoryPrioritizer),
    );
    ctx.add_builder(
        config("linux-rel", "2linux", &["w1"], true),
        first_available(),
    );
    ctx.start();

    ctx.request_submitted(request(1, "linux-rel", "main")).unwrap();
    ctx.request_submitted(request(2, "linux-rel", "release")).unwrap();
    ctx.request_submitted(request(3, "linux-rel", "main")).unwrap();
    ctx.worker_attached(&"w1".to_string());

    let r = recorder.clone();
    wait_until(move || !r.handles().is_empty()).await;
    let first = recorder.handles()[0].clone();
    let mut ids = first.request_ids.clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3], "main-branch requests merged, release left");

    // Completing the merged build frees the worker for request 2.
    ctx.build_finished("linux-rel", &first, BuildResult::Success)
        .unwrap();
    let r = recorder.clone();
    wait_until(move || r.handles().len() == 2).await;
    assert_eq!(recorder.handles()[1].request_ids, vec![2]);

    assert!(store.get_unclaimed("linux-rel").unwrap().is_empty());
    ctx.shutdown().await;
}

/// Builders queued together drain lowest category first, with equal
/// categories keeping arrival order.
#[tokio::test]
async fn builders_drain_by_category_with_stable_ties() {
    let store = Arc::new(MemoryRequestStore::new());
    let pool = pool_with(&["w1", "w2", "w3", "w4"]);
    let recorder = Arc::new(Recorder::default());
    let ctx = SchedulingContext::new(
        store.clone(),
        pool,
        Arc::new(LockRegistry::new()),
        recorder.clone(),
        Box::new(CategoryPrioritizer),
    );
    ctx.add_builder(config("android-dbg", "5android", &["w1"], false), first_available());
    ctx.add_builder(config("linux-rel", "2linux", &["w2"], false), first_available());
    ctx.add_builder(config("linux-dbg", "2linux", &["w3"], false), first_available());
    ctx.add_builder(config("nightly", "0nightly", &["w4"], false), first_available());

    for (id, b) in [(1, "android-dbg"), (2, "linux-rel"), (3, "linux-dbg"), (4, "nightly")] {
        store.submit(request(id, b, "main")).unwrap();
    }
    // Queue in submission order before starting; linux-rel arrived
    // before linux-dbg and must stay ahead of it.
    ctx.dispatcher().notify(&[
        "android-dbg".to_string(),
        "linux-rel".to_string(),
        "linux-dbg".to_string(),
        "nightly".to_string(),
    ]);
    ctx.start();

    let r = recorder.clone();
    wait_until(move || r.handles().len() == 4).await;
    let order: Vec<String> = recorder
        .handles()
        .iter()
        .map(|h| h.request_ids[0])
        .map(|id| match id {
            1 => "android-dbg",
            2 => "linux-rel",
            3 => "linux-dbg",
            _ => "nightly",
        })
        .map(str::to_string)
        .collect();
    assert_eq!(order, vec!["nightly", "linux-rel", "linux-dbg", "android-dbg"]);
    ctx.shutdown().await;
}

/// Floating failover end to end: the primary goes offline, the pass
/// declines and arms a grace timer, and when it fires the dispatcher
/// re-runs the pass and hands the build to the floating backup.
#[tokio::test]
async fn floating_backup_takes_over_after_grace() {
    let store = Arc::new(MemoryRequestStore::new());
    let pool = pool_with(&["p1", "f1"]);
    let recorder = Arc::new(Recorder::default());
    let ctx = SchedulingContext::new(
        store.clone(),
        pool,
        Arc::new(LockRegistry::new()),
        recorder.clone(),
        Box::new(CategoryPrioritizer),
    );

    let policy = FloatingPolicy::new(
        FloatingConfig {
            primary: vec!["p1".to_string()],
            floating: vec!["f1".to_string()],
            grace_period: Duration::from_millis(100),
        },
        ctx.dispatcher().notifier(),
    )
    .unwrap();
    ctx.add_builder(
        config("linux-rel", "2linux", &["p1", "f1"], false),
        SelectionPolicy::Floating(Arc::new(policy)),
    );
    ctx.start();

    // Primary drops just before work arrives.
    ctx.worker_detached(&"p1".to_string());
    ctx.request_submitted(request(1, "linux-rel", "main")).unwrap();

    // Within the grace period nothing is dispatched even though the
    // backup sits idle.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(recorder.handles().is_empty());

    // The armed timer expires, re-notifies, and the backup gets it.
    let r = recorder.clone();
    wait_until(move || !r.handles().is_empty()).await;
    assert_eq!(recorder.handles()[0].worker, "f1");
    ctx.shutdown().await;
}

/// A single worker with no merging dispatches strictly oldest first.
#[tokio::test]
async fn single_worker_dispatches_oldest_first() {
    let store = Arc::new(MemoryRequestStore::new());
    let pool = pool_with(&["w1"]);
    let recorder = Arc::new(Recorder::default());
    let ctx = SchedulingContext::new(
        store.clone(),
        pool,
        Arc::new(LockRegistry::new()),
        recorder.clone(),
        Box::new(CategoryPrioritizer),
    );
    ctx.add_builder(
        config("linux-rel", "2linux", &["w1"], false),
        first_available(),
    );
    ctx.start();

    // Newest submitted first; dispatch order must follow submitted_at.
    store.submit(request(3, "linux-rel", "main")).unwrap();
    store.submit(request(1, "linux-rel", "main")).unwrap();
    store.submit(request(2, "linux-rel", "main")).unwrap();
    ctx.dispatcher().notify(&["linux-rel".to_string()]);

    let r = recorder.clone();
    wait_until(move || !r.handles().is_empty()).await;
    assert_eq!(recorder.handles()[0].request_ids, vec![1]);

    // 2 and 3 stay queued until the worker frees up, then drain in age
    // order.
    let left: Vec<RequestId> = store
        .get_unclaimed("linux-rel")
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(left, vec![2, 3]);

    let h = recorder.handles()[0].clone();
    ctx.build_finished("linux-rel", &h, BuildResult::Success).unwrap();
    let r = recorder.clone();
    wait_until(move || r.handles().len() == 2).await;
    assert_eq!(recorder.handles()[1].request_ids, vec![2]);
    ctx.shutdown().await;
}

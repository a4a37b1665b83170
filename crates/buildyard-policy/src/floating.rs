//! Floating primary/backup worker selection.
//!
//! Prefers a configured set of primary workers and falls through to a
//! floating backup set only after every primary has been offline
//! beyond the grace period. While an offline primary is still within
//! grace (and no primary is merely busy), a one-shot wake-up timer is
//! armed for the longest remaining grace interval; its only job is to
//! re-trigger the dispatcher for this builder. A fresh decision is
//! computed from scratch on every invocation — the timer never itself
//! chooses a worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

use buildyard_core::{BuilderName, WorkerName};
use buildyard_pool::PoolSnapshot;

use crate::selection::PolicyError;

/// Hook the policy uses to re-trigger dispatch for a builder when a
/// grace-period timer fires. Wired to `Dispatcher::notify`.
pub type NotifyFn = Arc<dyn Fn(BuilderName) + Send + Sync>;

/// A single outstanding wake-up timer.
///
/// At most one exists per builder; arming a new one first cancels the
/// old. Cancel is idempotent and safe after the timer already fired.
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    fn arm(delay: Duration, builder: BuilderName, notify: NotifyFn) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(%builder, "grace-period timer fired, re-triggering dispatch");
            notify(builder);
        });
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Static configuration for a floating policy instance.
#[derive(Debug, Clone)]
pub struct FloatingConfig {
    /// Preferred workers, scanned in this order.
    pub primary: Vec<WorkerName>,
    /// Backup workers, scanned in this order once no primary is in play.
    pub floating: Vec<WorkerName>,
    /// How long an offline primary stays in consideration.
    pub grace_period: Duration,
}

struct FloatingState {
    /// Last time each worker was observed online.
    last_seen: HashMap<WorkerName, Instant>,
    /// Outstanding wake-up timers, at most one per builder.
    timers: HashMap<BuilderName, TimerHandle>,
}

/// The primary/floating failover strategy.
pub struct FloatingPolicy {
    config: FloatingConfig,
    notify: NotifyFn,
    state: Mutex<FloatingState>,
}

impl std::fmt::Debug for FloatingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloatingPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FloatingPolicy {
    /// Create a policy. The primary and floating sets must be disjoint.
    pub fn new(config: FloatingConfig, notify: NotifyFn) -> Result<Self, PolicyError> {
        if let Some(dup) = config.primary.iter().find(|p| config.floating.contains(p)) {
            return Err(PolicyError::OverlappingSets(dup.clone()));
        }
        Ok(Self {
            config,
            notify,
            state: Mutex::new(FloatingState {
                last_seen: HashMap::new(),
                timers: HashMap::new(),
            }),
        })
    }

    /// One selection decision.
    ///
    /// `available` is the set the builder may dispatch to right now;
    /// `snapshot` covers every configured worker (online or not);
    /// `now` is passed explicitly so tests can drive time.
    pub fn next_worker(
        &self,
        builder: &str,
        available: &[WorkerName],
        snapshot: &PoolSnapshot,
        now: Instant,
    ) -> Option<WorkerName> {
        let mut state = self.state.lock().expect("floating state poisoned");

        // Record "last seen online" for everything currently online;
        // this is what grace is measured from once a worker drops.
        for (name, snap) in snapshot {
            if snap.connected {
                state.last_seen.insert(name.clone(), now);
            }
        }

        // Any previously armed timer is stale; re-armed below if still
        // needed.
        if let Some(timer) = state.timers.remove(builder) {
            timer.cancel();
        }

        let mut primary_busy = false;
        let mut max_remaining: Option<Duration> = None;

        for primary in &self.config.primary {
            // First available primary in configured order wins outright.
            if available.contains(primary) {
                debug!(%builder, worker = %primary, "primary selected");
                return Some(primary.clone());
            }

            let online = snapshot.get(primary).is_some_and(|s| s.connected);
            if online {
                // Busy, not gone: never fall through to floating, and no
                // timer is needed — the next availability edge
                // re-triggers matching naturally.
                primary_busy = true;
                continue;
            }

            // Offline: newest of our recorded sighting and whatever the
            // pool remembers (reconnects, last message). A primary never
            // seen at all starts its grace clock now.
            let recorded = state.last_seen.get(primary).copied();
            let pool_seen = snapshot.get(primary).and_then(|s| s.last_seen);
            let seen = match (recorded, pool_seen) {
                (Some(a), Some(b)) => a.max(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => {
                    state.last_seen.insert(primary.clone(), now);
                    now
                }
            };

            let elapsed = now.saturating_duration_since(seen);
            if elapsed < self.config.grace_period {
                let remaining = self.config.grace_period - elapsed;
                max_remaining = Some(max_remaining.map_or(remaining, |m| m.max(remaining)));
            }
        }

        if primary_busy {
            debug!(%builder, "primary busy, holding off floating workers");
            return None;
        }

        if let Some(delta) = max_remaining {
            debug!(%builder, remaining_ms = delta.as_millis() as u64, "primaries within grace, arming wake-up timer");
            let handle = TimerHandle::arm(delta, builder.to_string(), self.notify.clone());
            state.timers.insert(builder.to_string(), handle);
            return None;
        }

        // No primary online, busy, or within grace: floating set is in
        // play, first available in configured order.
        for floating in &self.config.floating {
            if available.contains(floating) {
                debug!(%builder, worker = %floating, "floating worker selected");
                return Some(floating.clone());
            }
        }
        None
    }

    /// Whether a wake-up timer is currently armed for a builder.
    pub fn has_armed_timer(&self, builder: &str) -> bool {
        let state = self.state.lock().expect("floating state poisoned");
        state.timers.contains_key(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildyard_pool::WorkerSnapshot;
    use std::sync::Mutex as StdMutex;

    const GRACE: Duration = Duration::from_secs(10);

    fn policy_with_notify() -> (Arc<FloatingPolicy>, Arc<StdMutex<Vec<String>>>) {
        let notified = Arc::new(StdMutex::new(Vec::new()));
        let sink = notified.clone();
        let notify: NotifyFn = Arc::new(move |builder| {
            sink.lock().unwrap().push(builder);
        });
        let policy = FloatingPolicy::new(
            FloatingConfig {
                primary: vec!["p1".to_string()],
                floating: vec!["f1".to_string()],
                grace_period: GRACE,
            },
            notify,
        )
        .unwrap();
        (Arc::new(policy), notified)
    }

    fn snap(entries: &[(&str, bool, Option<Instant>)]) -> PoolSnapshot {
        entries
            .iter()
            .map(|(name, connected, last_seen)| {
                (
                    name.to_string(),
                    WorkerSnapshot {
                        connected: *connected,
                        building: 0,
                        last_seen: *last_seen,
                    },
                )
            })
            .collect()
    }

    fn names(list: &[&str]) -> Vec<WorkerName> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn overlapping_sets_are_rejected() {
        let err = FloatingPolicy::new(
            FloatingConfig {
                primary: vec!["w1".to_string()],
                floating: vec!["w1".to_string()],
                grace_period: GRACE,
            },
            Arc::new(|_| {}),
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::OverlappingSets(_)));
    }

    #[test]
    fn available_primary_wins_immediately() {
        let (policy, _) = policy_with_notify();
        let now = Instant::now();
        let chosen = policy.next_worker(
            "b",
            &names(&["f1", "p1"]),
            &snap(&[("p1", true, None), ("f1", true, None)]),
            now,
        );
        assert_eq!(chosen, Some("p1".to_string()));
    }

    #[test]
    fn busy_primary_blocks_floating_regardless_of_grace() {
        let (policy, _) = policy_with_notify();
        let t0 = Instant::now();

        // p1 online but busy (not in available), f1 free. Even far past
        // any grace window, floating must not be chosen.
        let chosen = policy.next_worker(
            "b",
            &names(&["f1"]),
            &snap(&[("p1", true, None), ("f1", true, None)]),
            t0 + GRACE * 5,
        );
        assert_eq!(chosen, None);
        assert!(!policy.has_armed_timer("b"));
    }

    #[tokio::test]
    async fn offline_primary_within_grace_arms_timer() {
        let (policy, _) = policy_with_notify();
        let t0 = Instant::now();

        // Seed: p1 online (busy) at t0.
        policy.next_worker(
            "b",
            &[],
            &snap(&[("p1", true, None), ("f1", true, None)]),
            t0,
        );

        // t0+5s: p1 offline, still within the 10s grace.
        let chosen = policy.next_worker(
            "b",
            &names(&["f1"]),
            &snap(&[("p1", false, None), ("f1", true, None)]),
            t0 + Duration::from_secs(5),
        );
        assert_eq!(chosen, None);
        assert!(policy.has_armed_timer("b"));
    }

    #[test]
    fn exactly_at_grace_boundary_is_outside_grace() {
        let (policy, _) = policy_with_notify();
        let t0 = Instant::now();

        // p1 last seen exactly grace_period ago: outside grace, floating
        // is eligible.
        let chosen = policy.next_worker(
            "b",
            &names(&["f1"]),
            &snap(&[("p1", false, Some(t0)), ("f1", true, None)]),
            t0 + GRACE,
        );
        assert_eq!(chosen, Some("f1".to_string()));
    }

    #[tokio::test]
    async fn just_inside_grace_boundary_waits() {
        let (policy, _) = policy_with_notify();
        let t0 = Instant::now();

        let chosen = policy.next_worker(
            "b",
            &names(&["f1"]),
            &snap(&[("p1", false, Some(t0)), ("f1", true, None)]),
            t0 + GRACE - Duration::from_millis(1),
        );
        assert_eq!(chosen, None);
        assert!(policy.has_armed_timer("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_timeline_fails_over_to_floating() {
        let (policy, notified) = policy_with_notify();
        let t0 = Instant::now();

        // p1 goes offline at t0 (observed online once at t0).
        policy.next_worker("b", &[], &snap(&[("p1", true, None)]), t0);

        // t0+5s: f1 available, p1 within grace. No worker; 5s timer.
        let chosen = policy.next_worker(
            "b",
            &names(&["f1"]),
            &snap(&[("p1", false, None), ("f1", true, None)]),
            t0 + Duration::from_secs(5),
        );
        assert_eq!(chosen, None);
        assert!(policy.has_armed_timer("b"));

        // Let the paused clock pass the remaining grace; the timer
        // fires and re-triggers the dispatcher.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(notified.lock().unwrap().as_slice(), &["b".to_string()]);

        // t0+11s: p1 past grace, floating wins.
        let chosen = policy.next_worker(
            "b",
            &names(&["f1"]),
            &snap(&[("p1", false, None), ("f1", true, None)]),
            t0 + Duration::from_secs(11),
        );
        assert_eq!(chosen, Some("f1".to_string()));
    }

    #[tokio::test]
    async fn rearming_keeps_at_most_one_timer() {
        let (policy, _) = policy_with_notify();
        let t0 = Instant::now();
        let offline = snap(&[("p1", false, Some(t0)), ("f1", true, None)]);

        policy.next_worker("b", &names(&["f1"]), &offline, t0 + Duration::from_secs(1));
        assert!(policy.has_armed_timer("b"));

        // A later invocation cancels and re-arms; still exactly one.
        policy.next_worker("b", &names(&["f1"]), &offline, t0 + Duration::from_secs(2));
        assert!(policy.has_armed_timer("b"));

        // Once the decision no longer needs a timer, none is left armed.
        policy.next_worker("b", &names(&["f1"]), &offline, t0 + GRACE);
        assert!(!policy.has_armed_timer("b"));
    }

    #[tokio::test]
    async fn never_seen_primary_starts_grace_now() {
        let (policy, _) = policy_with_notify();
        let t0 = Instant::now();

        // p1 has never been observed online; it gets a full grace
        // window from first consideration rather than being skipped.
        let chosen = policy.next_worker(
            "b",
            &names(&["f1"]),
            &snap(&[("p1", false, None), ("f1", true, None)]),
            t0,
        );
        assert_eq!(chosen, None);
        assert!(policy.has_armed_timer("b"));
    }

    #[tokio::test]
    async fn floating_respects_configured_order() {
        let notify: NotifyFn = Arc::new(|_| {});
        let policy = FloatingPolicy::new(
            FloatingConfig {
                primary: vec!["p1".to_string()],
                floating: vec!["f1".to_string(), "f2".to_string()],
                grace_period: Duration::ZERO,
            },
            notify,
        )
        .unwrap();

        let t0 = Instant::now();
        // Zero grace: offline primary is immediately out of play.
        let chosen = policy.next_worker(
            "b",
            &names(&["f2", "f1"]),
            &snap(&[("p1", false, Some(t0))]),
            t0 + Duration::from_secs(1),
        );
        assert_eq!(chosen, Some("f1".to_string()));
    }
}

//! The activity loop.
//!
//! Every stimulus (request submitted, worker attached, grace timer
//! fired, build finished) lands here as `notify(builders)`. Names
//! accumulate in a pending set kept sorted by the prioritizer, and a
//! single loop task drains it front-to-back, running one matching pass
//! per drained name. Re-entrant notifications during a pass simply
//! re-insert the name; it is picked up on the next drain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use buildyard_core::{BuilderName, Prioritizer};
use buildyard_policy::NotifyFn;

use crate::builder::Builder;

/// Owns the pending set and the single dispatch task.
pub struct Dispatcher {
    pending: Mutex<Vec<BuilderName>>,
    builders: Mutex<HashMap<BuilderName, Arc<Builder>>>,
    prioritizer: Box<dyn Prioritizer>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(prioritizer: Box<dyn Prioritizer>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pending: Mutex::new(Vec::new()),
            builders: Mutex::new(HashMap::new()),
            prioritizer,
            wake: Notify::new(),
            shutdown,
            loop_handle: Mutex::new(None),
        }
    }

    pub fn add_builder(&self, builder: Arc<Builder>) {
        let mut builders = self.builders.lock().expect("dispatcher mutex poisoned");
        builders.insert(builder.name().to_string(), builder);
    }

    /// Queue builders for a matching pass and wake the loop.
    ///
    /// Names already pending are not duplicated; the whole set is
    /// re-sorted so a higher-priority arrival overtakes waiting ones.
    pub fn notify(&self, names: &[BuilderName]) {
        if names.is_empty() {
            return;
        }
        {
            let mut pending = self.pending.lock().expect("dispatcher mutex poisoned");
            let before = pending.len();
            for name in names {
                if !pending.contains(name) {
                    pending.push(name.clone());
                }
            }
            if pending.len() == before {
                // Everything was already queued; the loop will get to it.
                return;
            }
            let builders = self.builders.lock().expect("dispatcher mutex poisoned");
            self.prioritizer.order(&mut pending, &|name| {
                builders
                    .get(name)
                    .map(|b| b.category().to_string())
                    .unwrap_or_default()
            });
            debug!(pending = pending.len(), "builders queued for dispatch");
        }
        // Notify stores a permit, so a wake racing the loop's drain is
        // never lost.
        self.wake.notify_one();
    }

    /// A notify callback for timer-driven policies.
    pub fn notifier(self: &Arc<Self>) -> NotifyFn {
        let dispatcher = Arc::clone(self);
        Arc::new(move |builder: BuilderName| dispatcher.notify(&[builder]))
    }

    /// Look up a registered builder by name.
    pub fn builder(&self, name: &str) -> Option<Arc<Builder>> {
        let builders = self.builders.lock().expect("dispatcher mutex poisoned");
        builders.get(name).cloned()
    }

    /// Current pending set, in drain order (diagnostics and tests).
    pub fn pending(&self) -> Vec<BuilderName> {
        self.pending.lock().expect("dispatcher mutex poisoned").clone()
    }

    /// Spawn the activity loop. Idempotent; the second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock().expect("dispatcher mutex poisoned");
        if handle.is_some() {
            return;
        }
        let dispatcher = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *handle = Some(tokio::spawn(async move {
            info!("dispatch loop started");
            loop {
                while let Some(name) = dispatcher.pop_pending() {
                    if *shutdown.borrow() {
                        break;
                    }
                    dispatcher.run_pass(&name);
                }
                tokio::select! {
                    _ = dispatcher.wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("dispatch loop stopped");
        }));
    }

    /// Signal shutdown and wait for the loop task to exit. The pass in
    /// flight finishes; remaining pending names are dropped.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.wake.notify_one();
        let handle = {
            let mut slot = self.loop_handle.lock().expect("dispatcher mutex poisoned");
            slot.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatch loop task panicked");
            }
        }
    }

    fn pop_pending(&self) -> Option<BuilderName> {
        let mut pending = self.pending.lock().expect("dispatcher mutex poisoned");
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        }
    }

    fn run_pass(&self, name: &BuilderName) {
        let builder = {
            let builders = self.builders.lock().expect("dispatcher mutex poisoned");
            builders.get(name).cloned()
        };
        let Some(builder) = builder else {
            warn!(builder = %name, "notification for unknown builder ignored");
            return;
        };
        match builder.attempt_dispatch() {
            Ok(0) => {}
            Ok(started) => debug!(builder = %name, started, "matching pass dispatched builds"),
            // One broken builder must not stall the rest of the drain.
            Err(e) => error!(builder = %name, error = %e, "matching pass failed"),
        }
    }
}

//! The worker transport boundary.
//!
//! The dispatch core never speaks the wire protocol. It consumes
//! attach/detach events (delivered by transport tasks calling into the
//! pool) and a liveness probe used for duplicate-attachment
//! arbitration. The probe carries its own timeout.

use buildyard_core::WorkerName;

/// Black-box view of the master/worker connection layer.
pub trait WorkerTransport: Send + Sync {
    /// Probe a worker's existing connection. Returns `false` on any
    /// failure or timeout.
    fn ping(&self, worker: &WorkerName) -> bool;
}

/// Transport stub that answers every ping the same way. Useful for
/// tests and for single-process deployments without a real wire.
pub struct StaticTransport {
    alive: bool,
}

impl StaticTransport {
    pub fn always_alive() -> Self {
        Self { alive: true }
    }

    pub fn always_dead() -> Self {
        Self { alive: false }
    }
}

impl WorkerTransport for StaticTransport {
    fn ping(&self, _worker: &WorkerName) -> bool {
        self.alive
    }
}

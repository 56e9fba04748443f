//! Per-contact concurrency gate.
//!
//! At most one turn per contact is in flight. A second event for a contact
//! that is already being processed is rejected, not queued: the caller drops
//! it. Release is tied to `GateGuard`'s drop, so it happens on every exit
//! path, including early returns and unwinding panics.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Set of contacts with a turn in flight.
#[derive(Debug, Default)]
pub struct ConcurrencyGate {
    in_flight: Mutex<HashSet<String>>,
}

impl ConcurrencyGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to claim the contact. Returns `None` if a turn is already running.
    pub fn try_enter(self: &Arc<Self>, contact_id: &str) -> Option<GateGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(contact_id.to_string()) {
            debug!(contact = %contact_id, "Turn already in flight, rejecting");
            return None;
        }
        Some(GateGuard {
            gate: Arc::clone(self),
            contact_id: contact_id.to_string(),
        })
    }

    /// Whether a turn is currently running for the contact.
    pub fn is_busy(&self, contact_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(contact_id)
    }

    /// Number of contacts currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn exit(&self, contact_id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(contact_id);
        debug!(contact = %contact_id, "Turn released");
    }
}

/// Scoped claim on a contact. Dropping it releases the contact.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<ConcurrencyGate>,
    contact_id: String,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.exit(&self.contact_id);
    }
}

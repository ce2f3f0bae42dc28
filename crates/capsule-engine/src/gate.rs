use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use capsule_core::error::{CapsuleError, Result};

#[derive(Default)]
struct GateState {
    used: HashSet<String>,
    in_flight: HashSet<String>,
}

/// One-shot guard: a graph id may be submitted for execution once per process.
///
/// Entries are never removed.
#[derive(Default)]
pub struct RunGate {
    state: Mutex<GateState>,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn check_not_used(&self, graph_id: &str) -> Result<()> {
        let state = self.state();
        if state.used.contains(graph_id) || state.in_flight.contains(graph_id) {
            return Err(CapsuleError::AlreadyUsed(graph_id.to_string()));
        }
        Ok(())
    }

    /// Idempotent and irreversible.
    pub fn mark_used(&self, graph_id: &str) {
        let mut state = self.state();
        state.in_flight.remove(graph_id);
        if state.used.insert(graph_id.to_string()) {
            debug!(graph_id, "Graph marked used");
        }
    }

    pub fn is_used(&self, graph_id: &str) -> bool {
        self.state().used.contains(graph_id)
    }

    /// Check and reserve `graph_id` in one step. The returned ticket marks
    /// the id used when dropped, whatever the run's outcome.
    pub fn begin(self: &Arc<Self>, graph_id: &str) -> Result<GateTicket> {
        let mut state = self.state();
        if state.used.contains(graph_id) || !state.in_flight.insert(graph_id.to_string()) {
            return Err(CapsuleError::AlreadyUsed(graph_id.to_string()));
        }
        Ok(GateTicket {
            gate: Arc::clone(self),
            graph_id: graph_id.to_string(),
        })
    }
}

/// Reservation of a graph id for the duration of one run.
pub struct GateTicket {
    gate: Arc<RunGate>,
    graph_id: String,
}

impl GateTicket {
    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        self.gate.mark_used(&self.graph_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_used_is_idempotent() {
        let gate = RunGate::new();
        assert!(gate.check_not_used("g").is_ok());
        gate.mark_used("g");
        gate.mark_used("g");
        assert!(gate.is_used("g"));
        let err = gate.check_not_used("g").unwrap_err();
        assert_eq!(err.code(), "ALREADY_USED");
    }

    #[test]
    fn test_ticket_reserves_then_marks_on_drop() {
        let gate = Arc::new(RunGate::new());
        let ticket = gate.begin("g").unwrap();
        assert_eq!(ticket.graph_id(), "g");
        assert!(!gate.is_used("g"));
        assert!(gate.begin("g").is_err());
        assert!(gate.check_not_used("g").is_err());

        drop(ticket);
        assert!(gate.is_used("g"));
        assert!(gate.begin("g").is_err());
        assert!(gate.begin("other").is_ok());
    }
}

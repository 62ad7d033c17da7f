//! Session event system for observability.
//!
//! Emits [`SessionEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers can follow session progress without coupling to the
//! manager internals.

use serde::{Deserialize, Serialize};

use waypoint_types::ItemStatus;

/// Events emitted while sessions run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    SessionStarted {
        session_id: String,
        workflow_type: String,
        files_total: usize,
    },
    DiscoveryFinished {
        session_id: String,
        instances: usize,
        complete: bool,
    },
    PhaseCompleted {
        session_id: String,
        phase_id: String,
    },
    ItemCompleted {
        session_id: String,
        item_id: String,
        status: ItemStatus,
    },
    ChecklistExpanded {
        session_id: String,
        file: String,
        added: usize,
    },
    BatchExecuted {
        session_id: String,
        operation: String,
        modified: usize,
        failed: usize,
    },
    SessionCompleted {
        session_id: String,
    },
    SessionFailed {
        session_id: String,
        phase_id: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<SessionEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

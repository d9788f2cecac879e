//! Activity event system for observability.
//!
//! Emits [`ActivityEvent`]s via a [`tokio::sync::broadcast`] channel. This is
//! the user-visible notification sink: hosts subscribe to show warnings,
//! damage, and test results without coupling to the runner internals.

use rulebook_types::{FailureKind, StepStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// One damage result produced by an attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageInstance {
    /// `None` when a privileged user attacked without a target.
    pub target: Option<String>,
    pub damage_type: String,
    pub amount: f64,
    pub penetrate: bool,
    pub non_lethal: bool,
}

/// Events emitted while an activity runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivityEvent {
    RunStarted {
        activity: String,
        operation_count: usize,
    },
    RunFinished {
        activity: String,
        status: String,
    },
    OperationStarted {
        operation: String,
        kind: String,
        target: Option<String>,
    },
    OperationCompleted {
        operation: String,
        status: StepStatus,
        value: Option<serde_json::Value>,
    },
    OperationSkipped {
        operation: String,
        reason: String,
    },
    Notification {
        level: NotificationLevel,
        message: String,
    },
    CostCharged {
        operation: String,
        pool: String,
        actions: f64,
        stamina: f64,
    },
    DamageDealt {
        operation: String,
        damage: DamageInstance,
    },
    TestResolved {
        operation: String,
        target: String,
        success: bool,
        actor_total: f64,
        target_total: f64,
    },
    ResourceChanged {
        operation: String,
        resource: String,
        value: f64,
    },
    Forked {
        operation: String,
        targets: Vec<String>,
    },
    BranchHalted {
        operation: String,
        target: Option<String>,
        kind: FailureKind,
        reason: String,
    },
    Suspended {
        operation: String,
        token: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<ActivityEvent>,
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
    pub fn emit(&self, event: ActivityEvent) {
        let _ = self.sender.send(event);
    }

    /// Emit a user-visible notification.
    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.emit(ActivityEvent::Notification {
            level,
            message: message.into(),
        });
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ActivityEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

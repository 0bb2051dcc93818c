use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted while flows execute and while the flow registry changes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    FlowStarted {
        context_id: Uuid,
        flow_id: String,
        timestamp: DateTime<Utc>,
    },
    FlowCompleted {
        context_id: Uuid,
        flow_id: String,
        status: u16,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    OperationCompleted {
        context_id: Uuid,
        flow_id: String,
        operation: String,
        operator: String,
        function: String,
        status: u16,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    FlowsChanged {
        added: Vec<String>,
        removed: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

/// Process-wide fan-out of [`ExecutionEvent`]s.
///
/// Sending never blocks and never fails: events without subscribers are
/// dropped, slow subscribers observe `Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(ExecutionEvent::FlowStarted {
            context_id: Uuid::new_v4(),
            flow_id: "lights".into(),
            timestamp: Utc::now(),
        });
        match rx.recv().await.unwrap() {
            ExecutionEvent::FlowStarted { flow_id, .. } => assert_eq!(flow_id, "lights"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_serialized_with_type_tag() {
        let event = ExecutionEvent::FlowsChanged {
            added: vec!["a".into()],
            removed: vec![],
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "FlowsChanged");
    }
}

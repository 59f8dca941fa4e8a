// src/event.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::engine::{NodeStatus, RunMode, RunStatus};
use crate::invocation::InvocationStatus;

/// Typed events published by the runtime. Replaces the string-channel
/// pub/sub the panels used: every subscriber matches on the enum, not on a
/// channel name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PostCreated { post_id: String, panel: String, author: String },
    RunStarted { run_id: String, flow_id: String, mode: RunMode },
    NodeFinished { run_id: String, node_id: String, status: NodeStatus },
    RunFinished { run_id: String, flow_id: String, status: RunStatus },
    InvocationFinished { invocation_id: String, status: InvocationStatus },
    Emitted { run_id: String, node_id: String, name: String, payload: Value },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Fire-and-forget; events to a bus with no subscribers are dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::PostCreated {
            post_id: "p1".into(),
            panel: "user".into(),
            author: "ada".into(),
        });

        let event = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("timeout")
            .expect("recv failed");
        match event {
            EngineEvent::PostCreated { post_id, .. } => assert_eq!(post_id, "p1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::RunFinished {
            run_id: "r".into(),
            flow_id: "f".into(),
            status: RunStatus::Succeeded,
        });
    }
}

//! Abstract publish/subscribe contract the queue manager uses to announce
//! submissions, cancellations, and to receive workflow lifecycle events back
//! from the orchestrator side. The in-process implementation is backed by a
//! broadcast channel; a wire-level implementation (e.g. over the key-value
//! store's own pub/sub, or a message broker) can implement the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::Priority;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmissionEvent {
    pub task_id: String,
    pub task_type: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancellationEvent {
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum WorkflowEventStatus {
    Succeeded,
    Failed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub workflow_id: String,
    pub task_id: String,
    pub status: WorkflowEventStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusMessage {
    TaskSubmitted(TaskSubmissionEvent),
    TaskCancelled(TaskCancellationEvent),
    WorkflowEvent(WorkflowEvent),
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, message: BusMessage);
    fn subscribe(&self) -> broadcast::Receiver<(String, BusMessage)>;
}

/// In-process broadcast-channel bus. Lagging subscribers drop the oldest
/// messages rather than block publishers; this is appropriate here because
/// every consumer also re-derives state from the key-value store, so a
/// missed event is not a correctness issue, only a latency one.
pub struct InProcessMessageBus {
    sender: broadcast::Sender<(String, BusMessage)>,
}

impl InProcessMessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for InProcessMessageBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for InProcessMessageBus {
    async fn publish(&self, topic: &str, message: BusMessage) {
        // No receivers is the common case in tests; SendError just means
        // nobody is listening right now, which is not an error here.
        let _ = self.sender.send((topic.to_string(), message));
    }

    fn subscribe(&self) -> broadcast::Receiver<(String, BusMessage)> {
        self.sender.subscribe()
    }
}

pub const TOPIC_TASK_SUBMISSIONS: &str = "task-submissions";
pub const TOPIC_TASK_CANCELLATIONS: &str = "task-cancellations";
pub const TOPIC_WORKFLOW_EVENTS: &str = "workflow-events";

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = InProcessMessageBus::default();
        let mut receiver = bus.subscribe();
        bus.publish(
            TOPIC_TASK_SUBMISSIONS,
            BusMessage::TaskSubmitted(TaskSubmissionEvent {
                task_id: "t1".into(),
                task_type: "inference".into(),
                priority: Priority::High,
            }),
        )
        .await;

        let (topic, message) = receiver.recv().await.unwrap();
        assert_eq!(topic, TOPIC_TASK_SUBMISSIONS);
        assert!(matches!(message, BusMessage::TaskSubmitted(_)));
    }
}

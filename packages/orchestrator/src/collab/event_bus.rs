//! The event-bus collaborator contract (§6) and an in-memory test double.
//!
//! Subscriptions are acquired with guaranteed unsubscription on all exit
//! paths (§9): dropping a [`tokio::sync::broadcast::Receiver`] unsubscribes
//! implicitly, which is the recast of the source's link+trap-exit pubsub
//! teardown into an RAII-scoped primitive.

use async_trait::async_trait;
use tokio::sync::broadcast;
use vbucket_core::NodeId;

/// Notifications the orchestrator publishes for external observers (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Stopped {
        bucket: String,
        node: NodeId,
        reason: String,
    },
    BucketReady {
        bucket: String,
        node: NodeId,
    },
    DataLost {
        bucket: String,
        node: NodeId,
        percent_lost: u8,
    },
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: ClusterEvent);

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}

/// Broadcast-channel-backed event bus. Lagging subscribers silently miss
/// older events rather than block publishers (standard `broadcast`
/// semantics); the orchestrator itself never subscribes to its own bus, so
/// this only affects external observers.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl InMemoryEventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: ClusterEvent) {
        // No subscribers is not an error: events are fire-and-forget.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }
}

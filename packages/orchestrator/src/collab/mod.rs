//! External collaborator contracts (§6): config store, engine client, event
//! bus. Each trait has exactly one implementation in this crate -- a
//! lock-free in-memory double -- because a real config store / data plane /
//! pubsub system is an external collaborator out of this crate's scope (§1).

pub mod config_store;
pub mod engine_client;
pub mod event_bus;

pub use config_store::{ConfigStore, InMemoryConfigStore};
pub use engine_client::{EngineClient, FakeEngineClient, QueryStatesResult, VbucketState};
pub use event_bus::{ClusterEvent, EventBus, InMemoryEventBus};

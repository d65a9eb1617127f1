//! Supervision primitives: service lifecycle, cancellable workers, and
//! bounded drain waits (§5, §9).

pub mod drain;
pub mod registry;
pub mod worker;

pub use drain::{DrainGuard, DrainTracker};
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use worker::{CancelHandle, ManagedWorker, RestartPolicy, Supervisor, WorkerExit};

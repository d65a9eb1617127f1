use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::OrchestratorConfig;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Context provided to services during initialization.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<OrchestratorConfig>,
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed service trait. All domain services implement this.
///
/// Services are registered with a `ServiceRegistry`, initialized in registration
/// order, and shut down in reverse registration order. The `Any` bound enables
/// type-based lookup via `ServiceRegistry::get::<T>()`.
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Returns the unique name of this service (e.g., `"crdt"`, `"sync"`).
    fn name(&self) -> &'static str;

    /// Initialize the service with the given context.
    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Reset the service to its initial state (e.g., after partition migration).
    async fn reset(&self) -> anyhow::Result<()>;

    /// Shut down the service. If `terminate` is true, skip graceful cleanup.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry for lifecycle-managed services.
///
/// Provides two lookup mechanisms:
/// - **By name** (`get_by_name`): uses the service's `name()` string
/// - **By type** (`get::<T>`): uses `TypeId` for zero-cost compile-time dispatch
///
/// Services are initialized in registration order and shut down in reverse order.
pub struct ServiceRegistry {
    /// Name-based lookup: service name -> Arc<dyn ManagedService>.
    by_name: DashMap<&'static str, Arc<dyn ManagedService>>,
    /// Type-based lookup: `TypeId` -> `Arc<dyn Any + Send + Sync>`.
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Registration order for deterministic init/shutdown sequencing.
    init_order: RwLock<Vec<&'static str>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            init_order: RwLock::new(Vec::new()),
        }
    }

    /// Register a service. The service becomes accessible via both `get::<T>()`
    /// and `get_by_name()`. Registration order determines init/shutdown sequencing.
    pub fn register<T: ManagedService>(&self, service: T) {
        let name = service.name();
        let arc = Arc::new(service);
        self.by_name.insert(name, arc.clone());
        self.by_type.insert(TypeId::of::<T>(), arc);
        self.init_order.write().push(name);
    }

    /// Retrieve a service by its concrete type.
    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Retrieve a service by its name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Initialize all registered services in registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if any service's `init()` call fails.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let order = self.init_order.read().clone();
        for name in &order {
            if let Some(service) = self.get_by_name(name) {
                service.init(ctx).await?;
            }
        }
        Ok(())
    }

    /// Shut down all registered services in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if any service's `shutdown()` call fails.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let order = self.init_order.read().clone();
        for name in order.iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                service.shutdown(terminate).await?;
            }
        }
        Ok(())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

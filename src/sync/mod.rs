//! The synchronization engine: cache, queues, registry, controller,
//! and the assembled [`Engine`] lifecycle.
//!
//! Everything here is infrastructure with no request/response surface:
//! per-task failures are terminal and observable only through logs, and
//! the engine owns no on-disk state — a restart rebuilds purely from
//! the policy store and the remote platform.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::gateway::{GatewayError, RemoteGateway};
use crate::status::StatusSink;
use crate::store::{PolicyStore, StoreError};

pub mod cache;
pub mod controller;
pub mod queue;
pub mod registry;

pub use cache::{PermissionCache, MAX_EXPLICIT_GRANTS};
pub use controller::ReconciliationController;
pub use queue::{CoalescingTaskQueue, SerialTaskQueue};
pub use registry::{CommandRegistry, SyncKey};

/// Failures inside a reconciliation task. Terminal per task; logged,
/// never surfaced to the notification source.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A gateway call failed.
    #[error("gateway call failed: {0}")]
    Gateway(#[from] GatewayError),

    /// A policy store call failed.
    #[error("policy store call failed: {0}")]
    Store(#[from] StoreError),
}

/// The assembled engine: registry + controller, wired to a gateway and
/// a policy store.
///
/// Lifecycle: [`Engine::initialize`] must complete before
/// [`Engine::run`] starts consuming notifications.
pub struct Engine {
    registry: CommandRegistry,
    controller: Arc<ReconciliationController>,
    store: Arc<dyn PolicyStore>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    /// Assemble an engine. `status_sink` is optional presentation glue;
    /// pass `None` for headless operation.
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        store: Arc<dyn PolicyStore>,
        config: &EngineConfig,
        status_sink: Option<Arc<dyn StatusSink>>,
    ) -> Self {
        let registry = CommandRegistry::new(gateway, Arc::clone(&store), config.rate_limit_attempts);
        let mut controller = ReconciliationController::new(registry.clone(), Arc::clone(&store));
        if let Some(sink) = status_sink {
            controller = controller.with_status_sink(sink);
        }
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            controller: Arc::new(controller),
            store,
            shutdown,
        }
    }

    /// The registry, for hosts that need catalog control or state
    /// inspection.
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Full install across all known scopes: load the declared catalog
    /// and install it everywhere. One scope's failure is logged and
    /// does not block the others.
    ///
    /// # Errors
    ///
    /// Returns an error when the catalog or scope list itself cannot be
    /// fetched; per-scope install failures are logged instead.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        let catalog = self.store.catalog().await?;
        info!(commands = catalog.len(), "declared catalog loaded");
        self.registry.set_catalog(catalog).await;
        for scope in self.store.scopes().await? {
            if let Err(error) = self.registry.install(scope).await {
                warn!(%scope, %error, "scope install failed");
            }
        }
        Ok(())
    }

    /// Subscribe to the policy store and consume notifications until
    /// the stream closes or [`Engine::shutdown`] is called.
    pub async fn run(&self) {
        let subscription = self.store.subscribe();
        Arc::clone(&self.controller)
            .run(subscription, self.shutdown.subscribe())
            .await;
    }

    /// Ask a running [`Engine::run`] to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for queued grant writes and status publishes to settle.
    pub async fn drain(&self) {
        self.registry.drain().await;
        self.controller.drain_status().await;
    }
}

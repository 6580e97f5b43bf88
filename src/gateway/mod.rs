//! Remote platform abstraction: command management and grant writes.
//!
//! The engine never talks to a platform SDK directly. Everything remote
//! goes through [`RemoteGateway`], so tests and the `simulate`
//! subcommand run against [`memory::InMemoryGateway`] while a production
//! host injects its own client. The gateway implementation owns
//! transport concerns (HTTP retry, auth); the engine only reacts to the
//! one error it can act on, [`GatewayError::RateLimited`].

use std::time::Duration;

use async_trait::async_trait;

use crate::types::{CommandPayload, GrantEntry, ResourceId, ScopeId, WireCommand};

pub mod memory;

/// Errors surfaced by a gateway implementation.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The platform asked us to slow down. The engine retries the
    /// failing task after `retry_after`, delaying only that task's
    /// queue chain.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// How long the platform asked us to wait.
        retry_after: Duration,
    },

    /// The platform rejected the request (validation, permissions).
    #[error("remote rejected the request: {0}")]
    Rejected(String),

    /// The referenced command does not exist remotely.
    #[error("unknown remote command {0}")]
    UnknownCommand(ResourceId),

    /// The referenced scope is not reachable.
    #[error("unknown scope {0}")]
    UnknownScope(ScopeId),

    /// Transport-level failure (connection, timeout). Logged and
    /// abandoned; correctness is restored by the next notification or a
    /// full resync.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// A command as listed by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Platform-allocated identity.
    pub id: ResourceId,
    /// Command name.
    pub name: String,
    /// Payload as the platform stores it.
    pub payload: CommandPayload,
    /// Whether the command is currently visible to everyone.
    pub default_allow: bool,
}

/// Contract between the engine and the remote platform.
///
/// Grant lists passed to [`RemoteGateway::set_grants`] are already
/// capped at the platform limit by the caller.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Create a command in a scope, returning its remote identity.
    async fn create_command(
        &self,
        scope: ScopeId,
        command: &WireCommand,
    ) -> Result<ResourceId, GatewayError>;

    /// Replace an existing command's payload.
    async fn edit_command(
        &self,
        scope: ScopeId,
        id: ResourceId,
        command: &WireCommand,
    ) -> Result<(), GatewayError>;

    /// Delete a command from a scope.
    async fn delete_command(&self, scope: ScopeId, id: ResourceId) -> Result<(), GatewayError>;

    /// Remove every command from a scope.
    async fn clear_commands(&self, scope: ScopeId) -> Result<(), GatewayError>;

    /// The authoritative list of commands installed in a scope.
    async fn list_commands(&self, scope: ScopeId) -> Result<Vec<RemoteCommand>, GatewayError>;

    /// Current explicit grant entries for a command in a scope.
    async fn fetch_grants(
        &self,
        scope: ScopeId,
        id: ResourceId,
    ) -> Result<Vec<GrantEntry>, GatewayError>;

    /// Replace the explicit grant entries for a command in a scope.
    async fn set_grants(
        &self,
        scope: ScopeId,
        id: ResourceId,
        entries: &[GrantEntry],
    ) -> Result<(), GatewayError>;
}

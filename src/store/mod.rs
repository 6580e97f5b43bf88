//! Policy source abstraction: declared catalog, membership, and change
//! notifications.
//!
//! A [`PolicyStore`] supplies everything the engine reconciles against:
//! the declared command catalog, per-scope role-set policy, member
//! snapshots, and a live event stream. Subscriptions are explicit
//! handles, so the engine can be started and stopped deterministically
//! and tested against a fake store with an injected event sender.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{CommandSpec, Member, RoleId, ScopeId, ScopePolicy};

pub mod file;

/// Errors surfaced by a policy store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced scope is not known to the store.
    #[error("unknown scope {0}")]
    UnknownScope(ScopeId),

    /// The store could not be reached or answered with a failure.
    #[error("policy store unavailable: {0}")]
    Unavailable(String),

    /// A policy file could not be read.
    #[error("policy file read failed: {0}")]
    Read(#[from] std::io::Error),

    /// A policy file could not be parsed.
    #[error("policy file parse failed: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A membership or policy change observed by the store.
///
/// Every variant carries before/after snapshots where the diff needs
/// them; the engine never re-reads global state to interpret an event.
#[derive(Debug, Clone)]
pub enum PolicyEvent {
    /// A role's effective authority changed: it entered or left a
    /// role-set, or its own override changed.
    RoleChanged {
        /// Scope the change happened in.
        scope: ScopeId,
        /// The role whose authority changed.
        role: RoleId,
        /// Role-set policy before the change.
        before: ScopePolicy,
        /// Role-set policy after the change.
        after: ScopePolicy,
    },

    /// A member's role set changed.
    MemberRolesChanged {
        /// Scope the change happened in.
        scope: ScopeId,
        /// Member snapshot before the change.
        before: Member,
        /// Member snapshot after the change.
        after: Member,
    },

    /// A member joined a scope.
    MemberJoined {
        /// Scope the member joined.
        scope: ScopeId,
        /// The new member.
        member: Member,
    },

    /// The declared command catalog changed.
    CatalogChanged {
        /// The new catalog.
        catalog: Vec<CommandSpec>,
    },
}

/// A live event subscription. Dropping the handle (or the store's
/// sender side) ends the stream; [`crate::sync::Engine::run`] returns
/// once the stream is closed.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<PolicyEvent>,
}

impl Subscription {
    /// Wrap a receiver created by the store.
    pub fn new(events: mpsc::UnboundedReceiver<PolicyEvent>) -> Self {
        Self { events }
    }

    /// Next event, or `None` once the store has closed the stream.
    pub async fn next_event(&mut self) -> Option<PolicyEvent> {
        self.events.recv().await
    }

    /// Unsubscribe: the store can enqueue nothing further. Events
    /// already queued still drain before the stream reports closed.
    pub fn close(&mut self) {
        self.events.close();
    }
}

/// Contract between the engine and its policy source.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// The declared command catalog.
    async fn catalog(&self) -> Result<Vec<CommandSpec>, StoreError>;

    /// Every scope the engine should manage.
    async fn scopes(&self) -> Result<Vec<ScopeId>, StoreError>;

    /// The role-set policy currently in force for a scope.
    async fn scope_policy(&self, scope: ScopeId) -> Result<ScopePolicy, StoreError>;

    /// Member snapshots for a scope, automated accounts included; the
    /// engine filters those itself.
    async fn members(&self, scope: ScopeId) -> Result<Vec<Member>, StoreError>;

    /// Open a live event stream.
    fn subscribe(&self) -> Subscription;
}

//! In-memory gateway: reference implementation for tests and dry runs.
//!
//! Backs the `simulate` subcommand and the test suite. Commands and
//! grants live in process memory; resource ids are allocated
//! sequentially. Every mutating call is recorded so tests can assert on
//! exactly which remote writes the engine issued, and scripted errors
//! can be queued to exercise the failure paths.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::types::{GrantEntry, ResourceId, ScopeId, WireCommand};

use super::{GatewayError, RemoteCommand, RemoteGateway};

/// A recorded gateway call, in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `create_command(scope, name)`.
    Create(ScopeId, String),
    /// `edit_command(scope, name)`.
    Edit(ScopeId, String),
    /// `delete_command(scope, name)`.
    Delete(ScopeId, String),
    /// `clear_commands(scope)`.
    Clear(ScopeId),
    /// `set_grants(scope, name, entries)`.
    SetGrants(ScopeId, String, Vec<GrantEntry>),
}

#[derive(Debug, Clone)]
struct StoredCommand {
    name: String,
    command: WireCommand,
    grants: Vec<GrantEntry>,
}

#[derive(Debug, Default)]
struct GatewayState {
    scopes: HashMap<ScopeId, HashMap<ResourceId, StoredCommand>>,
    next_id: u64,
    calls: Vec<GatewayCall>,
    set_grants_errors: VecDeque<GatewayError>,
}

/// An in-memory [`RemoteGateway`].
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    state: Mutex<GatewayState>,
}

impl InMemoryGateway {
    /// Create an empty gateway with no scopes and no recorded calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every mutating call made so far, in order.
    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of `set_grants` calls made so far.
    pub async fn set_grants_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| matches!(call, GatewayCall::SetGrants(..)))
            .count()
    }

    /// Queue an error to be returned by an upcoming `set_grants` call.
    /// Errors are consumed in FIFO order, one per call.
    pub async fn inject_set_grants_error(&self, error: GatewayError) {
        self.state.lock().await.set_grants_errors.push_back(error);
    }

    /// The stored grants for a command, looked up by name.
    pub async fn grants_for(&self, scope: ScopeId, name: &str) -> Option<Vec<GrantEntry>> {
        let state = self.state.lock().await;
        state
            .scopes
            .get(&scope)?
            .values()
            .find(|stored| stored.name == name)
            .map(|stored| stored.grants.clone())
    }

    /// The stored command, looked up by name.
    pub async fn command_named(&self, scope: ScopeId, name: &str) -> Option<RemoteCommand> {
        let state = self.state.lock().await;
        state.scopes.get(&scope)?.iter().find_map(|(id, stored)| {
            (stored.name == name).then(|| RemoteCommand {
                id: *id,
                name: stored.name.clone(),
                payload: stored.command.payload.clone(),
                default_allow: stored.command.default_allow,
            })
        })
    }

    /// Seed grants directly, bypassing call recording. Lets tests stage
    /// remote grant state the engine did not write itself.
    pub async fn seed_grants(&self, scope: ScopeId, id: ResourceId, entries: Vec<GrantEntry>) {
        let mut state = self.state.lock().await;
        if let Some(stored) = state
            .scopes
            .get_mut(&scope)
            .and_then(|commands| commands.get_mut(&id))
        {
            stored.grants = entries;
        }
    }

    /// Seed a command directly, bypassing call recording. Lets tests
    /// stage pre-existing remote state (e.g. a leftover command the
    /// engine should delete).
    pub async fn seed_command(&self, scope: ScopeId, command: WireCommand) -> ResourceId {
        let mut state = self.state.lock().await;
        let id = next_resource_id(&mut state);
        let name = command.name.clone();
        state.scopes.entry(scope).or_default().insert(
            id,
            StoredCommand {
                name,
                command,
                grants: Vec::new(),
            },
        );
        id
    }
}

fn next_resource_id(state: &mut GatewayState) -> ResourceId {
    state.next_id = state.next_id.saturating_add(1);
    ResourceId(state.next_id)
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
    async fn create_command(
        &self,
        scope: ScopeId,
        command: &WireCommand,
    ) -> Result<ResourceId, GatewayError> {
        let mut state = self.state.lock().await;
        let id = next_resource_id(&mut state);
        state
            .calls
            .push(GatewayCall::Create(scope, command.name.clone()));
        state.scopes.entry(scope).or_default().insert(
            id,
            StoredCommand {
                name: command.name.clone(),
                command: command.clone(),
                grants: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn edit_command(
        &self,
        scope: ScopeId,
        id: ResourceId,
        command: &WireCommand,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state
            .calls
            .push(GatewayCall::Edit(scope, command.name.clone()));
        let stored = state
            .scopes
            .get_mut(&scope)
            .and_then(|commands| commands.get_mut(&id))
            .ok_or(GatewayError::UnknownCommand(id))?;
        stored.name = command.name.clone();
        stored.command = command.clone();
        Ok(())
    }

    async fn delete_command(&self, scope: ScopeId, id: ResourceId) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let removed = state
            .scopes
            .get_mut(&scope)
            .and_then(|commands| commands.remove(&id))
            .ok_or(GatewayError::UnknownCommand(id))?;
        state.calls.push(GatewayCall::Delete(scope, removed.name));
        Ok(())
    }

    async fn clear_commands(&self, scope: ScopeId) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::Clear(scope));
        state.scopes.insert(scope, HashMap::new());
        Ok(())
    }

    async fn list_commands(&self, scope: ScopeId) -> Result<Vec<RemoteCommand>, GatewayError> {
        let state = self.state.lock().await;
        let mut commands: Vec<RemoteCommand> = state
            .scopes
            .get(&scope)
            .into_iter()
            .flatten()
            .map(|(id, stored)| RemoteCommand {
                id: *id,
                name: stored.name.clone(),
                payload: stored.command.payload.clone(),
                default_allow: stored.command.default_allow,
            })
            .collect();
        commands.sort_by_key(|command| command.id);
        Ok(commands)
    }

    async fn fetch_grants(
        &self,
        scope: ScopeId,
        id: ResourceId,
    ) -> Result<Vec<GrantEntry>, GatewayError> {
        let state = self.state.lock().await;
        state
            .scopes
            .get(&scope)
            .and_then(|commands| commands.get(&id))
            .map(|stored| stored.grants.clone())
            .ok_or(GatewayError::UnknownCommand(id))
    }

    async fn set_grants(
        &self,
        scope: ScopeId,
        id: ResourceId,
        entries: &[GrantEntry],
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.set_grants_errors.pop_front() {
            return Err(error);
        }
        let stored = state
            .scopes
            .get_mut(&scope)
            .and_then(|commands| commands.get_mut(&id))
            .ok_or(GatewayError::UnknownCommand(id))?;
        stored.grants = entries.to_vec();
        let name = stored.name.clone();
        state
            .calls
            .push(GatewayCall::SetGrants(scope, name, entries.to_vec()));
        Ok(())
    }
}

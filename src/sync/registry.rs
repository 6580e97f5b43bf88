//! Declared-catalog ownership and remote command reconciliation.
//!
//! The registry owns the declared catalog explicitly (no process-wide
//! mutable state) and keeps the remote platform in step with it:
//! install clears and recreates a scope's commands, update diffs the
//! catalog against the authoritative remote list, and every grant write
//! funnels through one chokepoint that applies the cache upsert,
//! honors the default-allow fallback, and serializes per
//! (scope, command) key.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::gateway::{GatewayError, RemoteGateway};
use crate::policy;
use crate::status::ScopeStatus;
use crate::store::PolicyStore;
use crate::types::{AuthorityLevel, CommandSpec, GrantEntry, ResourceId, ScopeId};

use super::cache::{PermissionCache, MAX_EXPLICIT_GRANTS};
use super::queue::SerialTaskQueue;
use super::SyncError;

/// Serialization key for the registry's task queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncKey {
    /// The grant chain for one command in one scope.
    Grants(ScopeId, String),
    /// The permission fan-out for a whole scope.
    Fanout(ScopeId),
}

#[derive(Debug)]
struct InstalledCommand {
    id: ResourceId,
    cache: PermissionCache,
}

#[derive(Debug, Default)]
struct RegistryState {
    catalog: Vec<CommandSpec>,
    scopes: HashMap<ScopeId, HashMap<String, InstalledCommand>>,
}

/// Whether a command should run in default-allow fallback: some scope's
/// cache has outgrown the platform cap, or no scope holds any entry at
/// all (an empty grant list would lock the command away from everyone,
/// so it is left open instead). A command installed nowhere yet counts
/// as the latter.
fn default_allow_for(
    scopes: &HashMap<ScopeId, HashMap<String, InstalledCommand>>,
    name: &str,
) -> bool {
    let mut all_empty = true;
    let mut any_over = false;
    for installed in scopes.values().filter_map(|commands| commands.get(name)) {
        if installed.cache.exceeds_cap() {
            any_over = true;
        }
        if !installed.cache.is_empty() {
            all_empty = false;
        }
    }
    any_over || all_empty
}

struct Inner {
    gateway: Arc<dyn RemoteGateway>,
    store: Arc<dyn PolicyStore>,
    state: Mutex<RegistryState>,
    queue: SerialTaskQueue<SyncKey>,
    rate_limit_attempts: u32,
}

/// Maps declared command specs to remote identities and drives all
/// remote writes. Cheap to clone; clones share the same state and
/// queue.
#[derive(Clone)]
pub struct CommandRegistry {
    inner: Arc<Inner>,
}

impl CommandRegistry {
    /// Create a registry with an empty catalog.
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        store: Arc<dyn PolicyStore>,
        rate_limit_attempts: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                store,
                state: Mutex::new(RegistryState::default()),
                queue: SerialTaskQueue::new(),
                rate_limit_attempts,
            }),
        }
    }

    /// Replace the declared catalog. Takes effect at the next
    /// [`CommandRegistry::install`] or [`CommandRegistry::update`].
    pub async fn set_catalog(&self, catalog: Vec<CommandSpec>) {
        let mut state = self.inner.state.lock().await;
        state.catalog = catalog;
    }

    /// Snapshot of the declared catalog.
    pub async fn catalog(&self) -> Vec<CommandSpec> {
        self.inner.state.lock().await.catalog.clone()
    }

    /// Scopes with commands currently installed.
    pub async fn installed_scopes(&self) -> Vec<ScopeId> {
        let state = self.inner.state.lock().await;
        let mut scopes: Vec<ScopeId> = state.scopes.keys().copied().collect();
        scopes.sort();
        scopes
    }

    /// Names of the commands installed in a scope.
    pub async fn installed_commands(&self, scope: ScopeId) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut names: Vec<String> = state
            .scopes
            .get(&scope)
            .map(|commands| commands.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Snapshot of the grant cache for a command in a scope, or `None`
    /// when the command is not installed there.
    pub async fn cache_entries(&self, scope: ScopeId, name: &str) -> Option<Vec<GrantEntry>> {
        let state = self.inner.state.lock().await;
        state
            .scopes
            .get(&scope)
            .and_then(|commands| commands.get(name))
            .map(|installed| installed.cache.entries())
    }

    /// Whether a command currently runs in default-allow fallback.
    pub async fn default_allow(&self, name: &str) -> bool {
        let state = self.inner.state.lock().await;
        default_allow_for(&state.scopes, name)
    }

    /// Presentation snapshot of a scope's sync state.
    pub async fn scope_status(&self, scope: ScopeId) -> ScopeStatus {
        let state = self.inner.state.lock().await;
        let commands = state.scopes.get(&scope);
        let command_count = commands.map_or(0, HashMap::len);
        let explicit_grants = commands.map_or(0, |installed| {
            installed.values().map(|command| command.cache.len()).sum()
        });
        let mut fallback: Vec<String> = commands
            .map(|installed| {
                installed
                    .keys()
                    .filter(|name| default_allow_for(&state.scopes, name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        fallback.sort();
        ScopeStatus {
            command_count,
            explicit_grants,
            fallback,
        }
    }

    /// Wait until every queued task has completed.
    pub async fn drain(&self) {
        self.inner.queue.drain().await;
    }

    /// Install the declared catalog into a scope from scratch: clear
    /// everything remote, create one command per declared spec (the
    /// authority level never leaves the process), attach a fresh empty
    /// grant cache per command, then kick off the permission fan-out
    /// without blocking the caller.
    pub async fn install(&self, scope: ScopeId) -> Result<(), SyncError> {
        let mut state = self.inner.state.lock().await;
        self.inner.gateway.clear_commands(scope).await?;
        // Caches die with the commands they belonged to.
        state.scopes.remove(&scope);
        let catalog = state.catalog.clone();
        let mut installed = HashMap::new();
        for spec in &catalog {
            let allow = default_allow_for(&state.scopes, &spec.name);
            let id = self
                .inner
                .gateway
                .create_command(scope, &spec.to_wire(allow))
                .await?;
            installed.insert(
                spec.name.clone(),
                InstalledCommand {
                    id,
                    cache: PermissionCache::new(),
                },
            );
        }
        state.scopes.insert(scope, installed);
        drop(state);
        info!(%scope, commands = catalog.len(), "commands installed");

        // Fan out permissions off the caller's back. Queued rather than
        // detached so a drain observes it, and so successive fan-outs
        // for the same scope apply in order.
        let registry = self.clone();
        self.inner.queue.enqueue(SyncKey::Fanout(scope), async move {
            if let Err(error) = registry.install_permissions(scope).await {
                warn!(%scope, %error, "permission install failed");
            }
        });
        Ok(())
    }

    /// Queue grant pushes for every member of a scope: each member is
    /// evaluated against every in-use level and receives an allow entry
    /// per satisfied level's commands. Members satisfying nothing cause
    /// no remote call at all. Each (member, command) push is its own
    /// queued task, so one failure never aborts the rest.
    pub async fn install_permissions(&self, scope: ScopeId) -> Result<(), SyncError> {
        let scope_policy = self.inner.store.scope_policy(scope).await?;
        let members = self.inner.store.members(scope).await?;
        let catalog = self.catalog().await;
        let levels = policy::levels_in_use(&catalog);

        let mut queued = 0usize;
        for member in members.iter().filter(|member| !member.is_automated) {
            let satisfied: BTreeSet<AuthorityLevel> = levels
                .iter()
                .copied()
                .filter(|level| policy::satisfies(member, &scope_policy, *level))
                .collect();
            if satisfied.is_empty() {
                continue;
            }
            for spec in catalog
                .iter()
                .filter(|spec| satisfied.contains(&spec.required_level))
            {
                self.queue_grants(
                    scope,
                    &spec.name,
                    vec![GrantEntry {
                        subject: member.subject_id,
                        allow: true,
                    }],
                );
                queued = queued.saturating_add(1);
            }
        }
        debug!(%scope, tasks = queued, "permission fan-out queued");
        Ok(())
    }

    /// Reconcile everything: recompute default-allow per command, diff
    /// the declared catalog against each scope's authoritative remote
    /// list (edit changed, delete remote-only, create declared-only),
    /// re-fetch the remote list, then re-push permissions for every
    /// scope. A second call with nothing changed issues no
    /// create/edit/delete at all.
    pub async fn update(&self) -> Result<(), SyncError> {
        let mut state = self.inner.state.lock().await;
        let catalog = state.catalog.clone();
        let flags: HashMap<String, bool> = catalog
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    default_allow_for(&state.scopes, &spec.name),
                )
            })
            .collect();
        let scope_ids: Vec<ScopeId> = state.scopes.keys().copied().collect();

        for &scope in &scope_ids {
            let mut previous = state.scopes.remove(&scope).unwrap_or_default();
            let remote = self.inner.gateway.list_commands(scope).await?;
            let mut rebuilt: HashMap<String, InstalledCommand> = HashMap::new();

            for spec in &catalog {
                let allow = flags.get(&spec.name).copied().unwrap_or(true);
                let desired = spec.to_wire(allow);
                match remote.iter().find(|existing| existing.name == spec.name) {
                    Some(existing)
                        if spec.payload_matches(&existing.payload)
                            && existing.default_allow == allow =>
                    {
                        // Unchanged remotely. Keep our cache, or adopt
                        // the authoritative grants when we have none.
                        let cache = match previous.remove(&spec.name) {
                            Some(prev) => prev.cache,
                            None => {
                                let grants =
                                    self.inner.gateway.fetch_grants(scope, existing.id).await?;
                                let mut cache = PermissionCache::new();
                                cache.add(grants);
                                cache
                            }
                        };
                        rebuilt.insert(
                            spec.name.clone(),
                            InstalledCommand {
                                id: existing.id,
                                cache,
                            },
                        );
                    }
                    Some(existing) => {
                        self.inner
                            .gateway
                            .edit_command(scope, existing.id, &desired)
                            .await?;
                        info!(%scope, command = %spec.name, "remote command edited");
                        let cache = previous
                            .remove(&spec.name)
                            .map(|prev| prev.cache)
                            .unwrap_or_default();
                        rebuilt.insert(
                            spec.name.clone(),
                            InstalledCommand {
                                id: existing.id,
                                cache,
                            },
                        );
                    }
                    None => {
                        let id = self.inner.gateway.create_command(scope, &desired).await?;
                        info!(%scope, command = %spec.name, "remote command created");
                        rebuilt.insert(
                            spec.name.clone(),
                            InstalledCommand {
                                id,
                                cache: PermissionCache::new(),
                            },
                        );
                    }
                }
            }

            for orphan in remote
                .iter()
                .filter(|existing| !catalog.iter().any(|spec| spec.name == existing.name))
            {
                self.inner.gateway.delete_command(scope, orphan.id).await?;
                info!(%scope, command = %orphan.name, "orphan remote command deleted");
            }

            // Re-align ids with the authoritative remote picture.
            let authoritative = self.inner.gateway.list_commands(scope).await?;
            for listed in authoritative {
                if let Some(entry) = rebuilt.get_mut(&listed.name) {
                    entry.id = listed.id;
                }
            }
            state.scopes.insert(scope, rebuilt);
        }
        drop(state);

        for &scope in &scope_ids {
            if let Err(error) = self.install_permissions(scope).await {
                warn!(%scope, %error, "permission resync failed");
            }
        }
        Ok(())
    }

    /// Queue a grant push for one command in one scope. Pushes for the
    /// same (scope, command) apply in submission order; pushes for
    /// different keys run independently. Failures are logged and
    /// terminal for the task.
    pub fn queue_grants(&self, scope: ScopeId, name: &str, entries: Vec<GrantEntry>) {
        let key = SyncKey::Grants(scope, name.to_owned());
        let registry = self.clone();
        let command = name.to_owned();
        self.inner.queue.enqueue(key, async move {
            if let Err(error) = registry.push_grants(scope, &command, entries).await {
                warn!(%scope, command = %command, %error, "grant push failed");
            }
        });
    }

    /// The grant chokepoint: upsert the cache, then mirror the result
    /// remotely unless the command is gone, nothing changed, or
    /// default-allow fallback suppresses explicit writes.
    async fn push_grants(
        &self,
        scope: ScopeId,
        name: &str,
        entries: Vec<GrantEntry>,
    ) -> Result<(), SyncError> {
        let (id, to_write) = {
            let mut state = self.inner.state.lock().await;
            let Some(installed) = state
                .scopes
                .get_mut(&scope)
                .and_then(|commands| commands.get_mut(name))
            else {
                // Target vanished between the notification and now.
                debug!(%scope, command = name, "grant target gone, nothing to push");
                return Ok(());
            };
            let before = installed.cache.entries();
            installed.cache.add(entries);
            let after = installed.cache.entries();
            let id = installed.id;

            if after.len() > MAX_EXPLICIT_GRANTS && before.len() <= MAX_EXPLICIT_GRANTS {
                info!(
                    %scope,
                    command = name,
                    entries = after.len(),
                    "grant capacity exceeded, command falls back to default-allow"
                );
            }
            if default_allow_for(&state.scopes, name) {
                debug!(%scope, command = name, "default-allow active, explicit write suppressed");
                return Ok(());
            }
            if after == before {
                debug!(%scope, command = name, "grants unchanged, remote write skipped");
                return Ok(());
            }
            let mut to_write = after;
            to_write.truncate(MAX_EXPLICIT_GRANTS);
            (id, to_write)
        };
        self.set_grants_backoff(scope, id, &to_write).await
    }

    /// Write grants, honoring rate-limit backoff. The sleep happens
    /// inside the queued task, so only this key's chain is delayed;
    /// unrelated keys keep flowing.
    async fn set_grants_backoff(
        &self,
        scope: ScopeId,
        id: ResourceId,
        entries: &[GrantEntry],
    ) -> Result<(), SyncError> {
        let mut attempt: u32 = 0;
        loop {
            match self.inner.gateway.set_grants(scope, id, entries).await {
                Ok(()) => return Ok(()),
                Err(GatewayError::RateLimited { retry_after })
                    if attempt < self.inner.rate_limit_attempts =>
                {
                    attempt = attempt.saturating_add(1);
                    debug!(%scope, %id, attempt, ?retry_after, "rate limited, backing off");
                    tokio::time::sleep(retry_after).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

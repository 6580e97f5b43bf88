//! TOML-backed policy store for dry runs and policy-file validation.
//!
//! Loads a static snapshot of the declared catalog, scopes, role sets,
//! and members from a single TOML file. Emits no live events; the
//! subscription it hands out is already closed. Used by the `simulate`
//! and `check` subcommands.
//!
//! ```toml
//! [[command]]
//! name = "close"
//! required_level = "support"
//! [command.payload]
//! description = "Close this ticket"
//!
//! [[scope]]
//! id = 100
//! support_roles = [11]
//! staff_roles = [12]
//!
//! [[scope.member]]
//! subject_id = 1
//! role_ids = [11]
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::types::{CommandSpec, Member, RoleId, ScopeId, ScopePolicy};

use super::{PolicyStore, StoreError, Subscription};

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default, rename = "command")]
    commands: Vec<CommandSpec>,
    #[serde(default, rename = "scope")]
    scopes: Vec<ScopeEntry>,
}

#[derive(Debug, Deserialize)]
struct ScopeEntry {
    id: ScopeId,
    #[serde(default)]
    support_roles: HashSet<RoleId>,
    #[serde(default)]
    staff_roles: HashSet<RoleId>,
    #[serde(default, rename = "member")]
    members: Vec<Member>,
}

#[derive(Debug)]
struct ScopeSnapshot {
    policy: ScopePolicy,
    members: Vec<Member>,
}

/// A static [`PolicyStore`] loaded from a TOML file.
#[derive(Debug)]
pub struct FilePolicyStore {
    catalog: Vec<CommandSpec>,
    scopes: HashMap<ScopeId, ScopeSnapshot>,
    order: Vec<ScopeId>,
}

impl FilePolicyStore {
    /// Load a policy file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Read`] when the file cannot be read and
    /// [`StoreError::Parse`] when it is not valid policy TOML.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse policy TOML from a string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Parse`] when the contents are not valid
    /// policy TOML.
    pub fn parse(contents: &str) -> Result<Self, StoreError> {
        let file: PolicyFile = toml::from_str(contents)?;
        let order: Vec<ScopeId> = file.scopes.iter().map(|scope| scope.id).collect();
        let scopes = file
            .scopes
            .into_iter()
            .map(|scope| {
                (
                    scope.id,
                    ScopeSnapshot {
                        policy: ScopePolicy {
                            support_roles: scope.support_roles,
                            staff_roles: scope.staff_roles,
                        },
                        members: scope.members,
                    },
                )
            })
            .collect();
        Ok(Self {
            catalog: file.commands,
            scopes,
            order,
        })
    }
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn catalog(&self) -> Result<Vec<CommandSpec>, StoreError> {
        Ok(self.catalog.clone())
    }

    async fn scopes(&self) -> Result<Vec<ScopeId>, StoreError> {
        Ok(self.order.clone())
    }

    async fn scope_policy(&self, scope: ScopeId) -> Result<ScopePolicy, StoreError> {
        self.scopes
            .get(&scope)
            .map(|snapshot| snapshot.policy.clone())
            .ok_or(StoreError::UnknownScope(scope))
    }

    async fn members(&self, scope: ScopeId) -> Result<Vec<Member>, StoreError> {
        self.scopes
            .get(&scope)
            .map(|snapshot| snapshot.members.clone())
            .ok_or(StoreError::UnknownScope(scope))
    }

    fn subscribe(&self) -> Subscription {
        // Static snapshot: hand out an already-closed stream.
        let (_tx, rx) = mpsc::unbounded_channel();
        Subscription::new(rx)
    }
}

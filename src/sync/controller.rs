//! Event-driven reconciliation.
//!
//! The controller consumes policy-store notifications and turns each
//! into the smallest recomputation that restores consistency: only the
//! authority levels a change can actually have affected are
//! re-evaluated, and only members whose outcome changed receive a
//! pushed grant. Nothing here ever rescans the world except the
//! catalog-change path, which delegates to the registry's full update.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::policy;
use crate::status::StatusSink;
use crate::store::{PolicyEvent, PolicyStore, Subscription};
use crate::types::{
    AuthorityLevel, CommandSpec, GrantEntry, Member, RoleId, ScopeId, ScopePolicy,
};

use super::queue::CoalescingTaskQueue;
use super::registry::CommandRegistry;
use super::SyncError;

/// Subscribes to policy notifications and drives minimal-diff grant
/// recomputation through the registry.
pub struct ReconciliationController {
    registry: CommandRegistry,
    store: Arc<dyn PolicyStore>,
    status_sink: Option<Arc<dyn StatusSink>>,
    status_queue: CoalescingTaskQueue<ScopeId>,
}

impl ReconciliationController {
    /// Create a controller without a status sink.
    pub fn new(registry: CommandRegistry, store: Arc<dyn PolicyStore>) -> Self {
        Self {
            registry,
            store,
            status_sink: None,
            status_queue: CoalescingTaskQueue::new(),
        }
    }

    /// Attach a presentation sink for per-scope summaries.
    #[must_use]
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Consume events until the subscription closes or shutdown fires.
    pub async fn run(
        self: Arc<Self>,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("reconciliation controller started");
        loop {
            tokio::select! {
                event = subscription.next_event() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => {
                            info!("policy event stream closed");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("controller shutdown requested");
                        break;
                    }
                }
            }
        }
    }

    /// Apply one notification. Failures are logged here and never
    /// propagate back to the event source.
    pub async fn handle(&self, event: PolicyEvent) {
        match event {
            PolicyEvent::RoleChanged {
                scope,
                role,
                before,
                after,
            } => {
                if let Err(error) = self.role_changed(scope, role, &before, &after).await {
                    warn!(%scope, %role, %error, "role change reconciliation failed");
                }
                self.refresh_status(scope);
            }
            PolicyEvent::MemberRolesChanged {
                scope,
                before,
                after,
            } => {
                if let Err(error) = self.member_roles_changed(scope, &before, &after).await {
                    warn!(
                        %scope,
                        subject = %after.subject_id,
                        %error,
                        "member role change reconciliation failed"
                    );
                }
                self.refresh_status(scope);
            }
            PolicyEvent::MemberJoined { scope, member } => {
                if let Err(error) = self.member_joined(scope, &member).await {
                    warn!(
                        %scope,
                        subject = %member.subject_id,
                        %error,
                        "member join reconciliation failed"
                    );
                }
                self.refresh_status(scope);
            }
            PolicyEvent::CatalogChanged { catalog } => {
                self.registry.set_catalog(catalog).await;
                if let Err(error) = self.registry.update().await {
                    warn!(%error, "catalog resync failed");
                }
                for scope in self.registry.installed_scopes().await {
                    self.refresh_status(scope);
                }
            }
        }
    }

    /// A role entered or left a role-set (or its own override changed):
    /// re-evaluate only the levels whose conferral by this role
    /// differs, and only for current holders of the role. Holders whose
    /// outcome is unchanged (still satisfied via another role, or the
    /// administrator flag) receive nothing.
    async fn role_changed(
        &self,
        scope: ScopeId,
        role: RoleId,
        before: &ScopePolicy,
        after: &ScopePolicy,
    ) -> Result<(), SyncError> {
        let catalog = self.registry.catalog().await;
        let affected: Vec<AuthorityLevel> = policy::levels_in_use(&catalog)
            .into_iter()
            .filter(|level| {
                policy::role_confers(before, role, *level)
                    != policy::role_confers(after, role, *level)
            })
            .collect();
        if affected.is_empty() {
            debug!(%scope, %role, "role change affects no level in use");
            return Ok(());
        }

        let members = self.store.members(scope).await?;
        let mut pushed = 0usize;
        for member in members
            .iter()
            .filter(|member| !member.is_automated && member.role_ids.contains(&role))
        {
            for level in &affected {
                let was = policy::satisfies(member, before, *level);
                let now = policy::satisfies(member, after, *level);
                if was == now {
                    continue;
                }
                for spec in gated_at(&catalog, *level) {
                    self.registry.queue_grants(
                        scope,
                        &spec.name,
                        vec![GrantEntry {
                            subject: member.subject_id,
                            allow: now,
                        }],
                    );
                    pushed = pushed.saturating_add(1);
                }
            }
        }
        debug!(%scope, %role, levels = affected.len(), tasks = pushed, "role change reconciled");
        Ok(())
    }

    /// A member's role set changed: push only for levels where the
    /// member's outcome flipped; untouched levels cost nothing.
    async fn member_roles_changed(
        &self,
        scope: ScopeId,
        before: &Member,
        after: &Member,
    ) -> Result<(), SyncError> {
        if after.is_automated {
            return Ok(());
        }
        let scope_policy = self.store.scope_policy(scope).await?;
        let catalog = self.registry.catalog().await;
        let mut pushed = 0usize;
        for level in policy::levels_in_use(&catalog) {
            let was = policy::satisfies(before, &scope_policy, level);
            let now = policy::satisfies(after, &scope_policy, level);
            if was == now {
                continue;
            }
            for spec in gated_at(&catalog, level) {
                self.registry.queue_grants(
                    scope,
                    &spec.name,
                    vec![GrantEntry {
                        subject: after.subject_id,
                        allow: now,
                    }],
                );
                pushed = pushed.saturating_add(1);
            }
        }
        debug!(%scope, subject = %after.subject_id, tasks = pushed, "member role change reconciled");
        Ok(())
    }

    /// A member joined: evaluate every in-use level, push allow entries
    /// for the satisfied ones only. A member satisfying nothing causes
    /// no remote call.
    async fn member_joined(&self, scope: ScopeId, member: &Member) -> Result<(), SyncError> {
        if member.is_automated {
            return Ok(());
        }
        let scope_policy = self.store.scope_policy(scope).await?;
        let catalog = self.registry.catalog().await;
        let mut pushed = 0usize;
        for level in policy::levels_in_use(&catalog) {
            if !policy::satisfies(member, &scope_policy, level) {
                continue;
            }
            for spec in gated_at(&catalog, level) {
                self.registry.queue_grants(
                    scope,
                    &spec.name,
                    vec![GrantEntry {
                        subject: member.subject_id,
                        allow: true,
                    }],
                );
                pushed = pushed.saturating_add(1);
            }
        }
        debug!(%scope, subject = %member.subject_id, tasks = pushed, "member join reconciled");
        Ok(())
    }

    /// Queue a status refresh for the scope; intermediate states may be
    /// coalesced away.
    fn refresh_status(&self, scope: ScopeId) {
        let Some(sink) = self.status_sink.clone() else {
            return;
        };
        let registry = self.registry.clone();
        self.status_queue.enqueue(scope, async move {
            let status = registry.scope_status(scope).await;
            if let Err(error) = sink.publish(scope, status).await {
                debug!(%scope, %error, "status publish failed");
            }
        });
    }

    /// Wait until queued status publishes have settled.
    pub async fn drain_status(&self) {
        self.status_queue.drain().await;
    }
}

fn gated_at(catalog: &[CommandSpec], level: AuthorityLevel) -> impl Iterator<Item = &CommandSpec> {
    catalog.iter().filter(move |spec| spec.required_level == level)
}

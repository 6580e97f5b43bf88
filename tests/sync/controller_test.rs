//! Minimal-diff reconciliation tests: events in, bounded pushes out.

use std::collections::HashSet;
use std::sync::Arc;

use turnstile::gateway::memory::{GatewayCall, InMemoryGateway};
use turnstile::gateway::RemoteGateway;
use turnstile::store::file::FilePolicyStore;
use turnstile::store::{PolicyEvent, PolicyStore};
use turnstile::sync::{CommandRegistry, ReconciliationController};
use turnstile::types::{
    GrantEntry, Member, RoleId, ScopeId, ScopePolicy, SubjectId,
};

const SCOPE: ScopeId = ScopeId(100);

/// Catalog: close gated on support, ban gated on staff. Scope policy:
/// role 11 = support, role 12 = staff. Members: subject 1 holds role
/// 11, subject 2 holds nothing, subject 3 holds roles 12 and 13.
const POLICY: &str = r#"
[[command]]
name = "close"
required_level = "support"
[command.payload]
description = "Close this ticket"

[[command]]
name = "ban"
required_level = "staff"
[command.payload]
description = "Ban a member"

[[scope]]
id = 100
support_roles = [11]
staff_roles = [12]

[[scope.member]]
subject_id = 1
role_ids = [11]

[[scope.member]]
subject_id = 2

[[scope.member]]
subject_id = 3
role_ids = [12, 13]
"#;

struct Harness {
    gateway: Arc<InMemoryGateway>,
    registry: CommandRegistry,
    controller: ReconciliationController,
    baseline: usize,
}

async fn harness(policy: &str) -> Harness {
    let gateway = Arc::new(InMemoryGateway::new());
    let store: Arc<dyn PolicyStore> =
        Arc::new(FilePolicyStore::parse(policy).expect("policy should parse"));
    let registry = CommandRegistry::new(
        Arc::clone(&gateway) as Arc<dyn RemoteGateway>,
        Arc::clone(&store),
        5,
    );
    registry
        .set_catalog(store.catalog().await.expect("catalog"))
        .await;
    registry.install(SCOPE).await.expect("install");
    registry.drain().await;
    let controller = ReconciliationController::new(registry.clone(), store);
    let baseline = gateway.calls().await.len();
    Harness {
        gateway,
        registry,
        controller,
        baseline,
    }
}

impl Harness {
    /// Grant writes issued since the harness settled.
    async fn grant_writes(&self) -> Vec<(String, Vec<GrantEntry>)> {
        self.gateway
            .calls()
            .await
            .split_off(self.baseline)
            .into_iter()
            .filter_map(|call| match call {
                GatewayCall::SetGrants(_, name, entries) => Some((name, entries)),
                _ => None,
            })
            .collect()
    }
}

fn member(subject: u64, roles: &[u64]) -> Member {
    Member {
        subject_id: SubjectId(subject),
        role_ids: roles.iter().copied().map(RoleId).collect(),
        is_administrator: false,
        is_automated: false,
    }
}

fn policy_with(support: &[u64], staff: &[u64]) -> ScopePolicy {
    ScopePolicy {
        support_roles: support.iter().copied().map(RoleId).collect::<HashSet<_>>(),
        staff_roles: staff.iter().copied().map(RoleId).collect::<HashSet<_>>(),
    }
}

fn entry(subject: u64, allow: bool) -> GrantEntry {
    GrantEntry {
        subject: SubjectId(subject),
        allow,
    }
}

#[tokio::test]
async fn role_gain_touches_only_the_affected_level() {
    let h = harness(POLICY).await;

    // Subject 2 picks up role 11 (support) on top of nothing. Only the
    // support-gated command may see a push; ban stays untouched.
    h.controller
        .handle(PolicyEvent::MemberRolesChanged {
            scope: SCOPE,
            before: member(2, &[]),
            after: member(2, &[11]),
        })
        .await;
    h.registry.drain().await;

    let writes = h.grant_writes().await;
    assert!(!writes.is_empty(), "support grant should have been pushed");
    for (name, entries) in &writes {
        assert_eq!(name, "close");
        assert!(entries.contains(&entry(2, true)));
    }
}

#[tokio::test]
async fn unchanged_levels_cost_nothing() {
    let h = harness(POLICY).await;

    // Subject 3 already satisfies staff via role 12; swapping the
    // unrelated role 13 for 14 flips no level at all.
    h.controller
        .handle(PolicyEvent::MemberRolesChanged {
            scope: SCOPE,
            before: member(3, &[12, 13]),
            after: member(3, &[12, 14]),
        })
        .await;
    h.registry.drain().await;

    assert!(h.grant_writes().await.is_empty());
}

#[tokio::test]
async fn staff_role_removal_denies_only_members_without_another_path() {
    let staffed = r#"
[[command]]
name = "ban"
required_level = "staff"
[command.payload]
description = "Ban a member"

[[scope]]
id = 100
staff_roles = [5, 6]

[[scope.member]]
subject_id = 1
role_ids = [5]

[[scope.member]]
subject_id = 2
role_ids = [5, 6]
"#;
    let h = harness(staffed).await;

    // Role 5 leaves the staff set. Subject 1 loses staff; subject 2
    // still satisfies it through role 6 and must see no change.
    h.controller
        .handle(PolicyEvent::RoleChanged {
            scope: SCOPE,
            role: RoleId(5),
            before: policy_with(&[], &[5, 6]),
            after: policy_with(&[], &[6]),
        })
        .await;
    h.registry.drain().await;

    // Exactly one push happened (a push for subject 2 would be its own
    // write), and subject 2's existing allow entry rode along unchanged.
    let writes = h.grant_writes().await;
    assert_eq!(writes.len(), 1);
    let (name, entries) = &writes[0];
    assert_eq!(name, "ban");
    assert_eq!(entries.last(), Some(&entry(1, false)));
    assert!(entries.contains(&entry(2, true)));
}

#[tokio::test]
async fn role_change_outside_any_used_level_is_free() {
    let h = harness(POLICY).await;

    // Role 30 enters no set referenced by the catalog's levels.
    h.controller
        .handle(PolicyEvent::RoleChanged {
            scope: SCOPE,
            role: RoleId(30),
            before: policy_with(&[11], &[12]),
            after: policy_with(&[11], &[12]),
        })
        .await;
    h.registry.drain().await;

    assert!(h.grant_writes().await.is_empty());
}

#[tokio::test]
async fn joining_member_gets_grants_for_satisfied_levels_only() {
    let h = harness(POLICY).await;

    // A new staffer joins: staff satisfies both ban (staff) and close
    // (support carries staff), all as allow entries.
    h.controller
        .handle(PolicyEvent::MemberJoined {
            scope: SCOPE,
            member: member(9, &[12]),
        })
        .await;
    h.registry.drain().await;

    let writes = h.grant_writes().await;
    let names: HashSet<String> = writes.iter().map(|(name, _)| name.clone()).collect();
    assert_eq!(
        names,
        HashSet::from(["close".to_owned(), "ban".to_owned()])
    );
    for (_, entries) in &writes {
        assert!(entries.contains(&entry(9, true)));
    }
}

#[tokio::test]
async fn joining_member_satisfying_nothing_makes_no_remote_call() {
    let h = harness(POLICY).await;

    h.controller
        .handle(PolicyEvent::MemberJoined {
            scope: SCOPE,
            member: member(9, &[40]),
        })
        .await;
    h.registry.drain().await;

    assert!(h.grant_writes().await.is_empty());
}

#[tokio::test]
async fn automated_members_are_ignored() {
    let h = harness(POLICY).await;

    let mut bot = member(9, &[12]);
    bot.is_automated = true;
    h.controller
        .handle(PolicyEvent::MemberJoined {
            scope: SCOPE,
            member: bot,
        })
        .await;
    h.registry.drain().await;

    assert!(h.grant_writes().await.is_empty());
}

#[tokio::test]
async fn catalog_change_triggers_a_full_resync() {
    let h = harness(POLICY).await;

    let next = r#"
[[command]]
name = "close"
required_level = "support"
[command.payload]
description = "Close this ticket"

[[command]]
name = "transfer"
required_level = "staff"
[command.payload]
description = "Transfer this ticket"
"#;
    let store = FilePolicyStore::parse(next).expect("policy should parse");
    h.controller
        .handle(PolicyEvent::CatalogChanged {
            catalog: store.catalog().await.expect("catalog"),
        })
        .await;
    h.registry.drain().await;

    let calls = h.gateway.calls().await.split_off(h.baseline);
    assert!(calls.contains(&GatewayCall::Create(SCOPE, "transfer".to_owned())));
    assert!(calls.contains(&GatewayCall::Delete(SCOPE, "ban".to_owned())));
}

#[tokio::test]
async fn status_sink_receives_a_coalesced_summary() {
    use turnstile::status::{ScopeStatus, StatusSink};

    #[derive(Default)]
    struct RecordingSink {
        published: std::sync::Mutex<Vec<(ScopeId, ScopeStatus)>>,
    }

    #[async_trait::async_trait]
    impl StatusSink for RecordingSink {
        async fn publish(&self, scope: ScopeId, status: ScopeStatus) -> anyhow::Result<()> {
            if let Ok(mut published) = self.published.lock() {
                published.push((scope, status));
            }
            Ok(())
        }
    }

    let h = harness(POLICY).await;
    let sink = Arc::new(RecordingSink::default());
    let controller = ReconciliationController::new(
        h.registry.clone(),
        Arc::new(FilePolicyStore::parse(POLICY).expect("policy should parse"))
            as Arc<dyn PolicyStore>,
    )
    .with_status_sink(Arc::clone(&sink) as Arc<dyn StatusSink>);

    controller
        .handle(PolicyEvent::MemberJoined {
            scope: SCOPE,
            member: member(9, &[12]),
        })
        .await;
    h.registry.drain().await;
    controller.drain_status().await;

    let published = sink
        .published
        .lock()
        .map(|published| published.clone())
        .unwrap_or_default();
    let (scope, status) = published.last().expect("a summary should be published");
    assert_eq!(*scope, SCOPE);
    assert_eq!(status.command_count, 2);
    assert!(status.fallback.is_empty());
}

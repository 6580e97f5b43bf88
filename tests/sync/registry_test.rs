//! Registry reconciliation tests against the in-memory gateway.

use std::sync::Arc;
use std::time::Duration;

use turnstile::gateway::memory::{GatewayCall, InMemoryGateway};
use turnstile::gateway::{GatewayError, RemoteGateway};
use turnstile::store::file::FilePolicyStore;
use turnstile::store::PolicyStore;
use turnstile::sync::CommandRegistry;
use turnstile::types::{GrantEntry, ScopeId, SubjectId, WireCommand};

const SCOPE: ScopeId = ScopeId(100);

/// One scope, one support member (subject 1, role 11), one plain
/// member (subject 2), and a support-gated `close` command.
const BASIC_POLICY: &str = r#"
[[command]]
name = "close"
required_level = "support"
[command.payload]
description = "Close this ticket"

[[scope]]
id = 100
support_roles = [11]
staff_roles = [12]

[[scope.member]]
subject_id = 1
role_ids = [11]

[[scope.member]]
subject_id = 2
"#;

fn setup(policy: &str) -> (Arc<InMemoryGateway>, CommandRegistry) {
    let gateway = Arc::new(InMemoryGateway::new());
    let store: Arc<dyn PolicyStore> =
        Arc::new(FilePolicyStore::parse(policy).expect("policy should parse"));
    let registry = CommandRegistry::new(Arc::clone(&gateway) as Arc<dyn RemoteGateway>, store, 5);
    (gateway, registry)
}

async fn install_settled(registry: &CommandRegistry, store_catalog: &str) {
    let store = FilePolicyStore::parse(store_catalog).expect("policy should parse");
    registry
        .set_catalog(store.catalog().await.expect("catalog"))
        .await;
    registry.install(SCOPE).await.expect("install should succeed");
    registry.drain().await;
}

fn allow(subject: u64) -> GrantEntry {
    GrantEntry {
        subject: SubjectId(subject),
        allow: true,
    }
}

#[tokio::test]
async fn install_grants_only_satisfying_members() {
    let (gateway, registry) = setup(BASIC_POLICY);
    install_settled(&registry, BASIC_POLICY).await;

    // Subject 1 satisfies support; subject 2 satisfies nothing and
    // produces no entry at all.
    let cache = registry
        .cache_entries(SCOPE, "close")
        .await
        .expect("close should be installed");
    assert_eq!(cache, vec![allow(1)]);
    assert_eq!(
        gateway.grants_for(SCOPE, "close").await,
        Some(vec![allow(1)])
    );
}

#[tokio::test]
async fn install_strips_the_authority_level_from_the_wire() {
    let (gateway, registry) = setup(BASIC_POLICY);
    install_settled(&registry, BASIC_POLICY).await;

    let remote = gateway
        .command_named(SCOPE, "close")
        .await
        .expect("close should exist remotely");
    assert_eq!(remote.payload.description, "Close this ticket");
    // Nothing about authority levels reaches the platform payload.
    let json = serde_json::to_value(&remote.payload).expect("payload serializes");
    assert!(json.get("required_level").is_none());
}

#[tokio::test]
async fn update_is_idempotent_for_an_unchanged_catalog() {
    let (gateway, registry) = setup(BASIC_POLICY);
    install_settled(&registry, BASIC_POLICY).await;

    registry.update().await.expect("first update");
    registry.drain().await;
    let after_first = gateway.calls().await;

    registry.update().await.expect("second update");
    registry.drain().await;
    let after_second = gateway.calls().await;

    // The second pass found nothing to do: no create, edit, delete, or
    // grant write beyond what the first pass already issued.
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn update_edits_creates_and_deletes_to_match_the_catalog() {
    let (gateway, registry) = setup(BASIC_POLICY);
    install_settled(&registry, BASIC_POLICY).await;

    // Remote drift: a command nobody declares anymore.
    gateway
        .seed_command(
            SCOPE,
            WireCommand {
                name: "legacy".to_owned(),
                payload: turnstile::types::CommandPayload {
                    description: "Old command".to_owned(),
                    options: vec![],
                },
                default_allow: true,
            },
        )
        .await;

    // The declared catalog moves on: close changes wording, claim is new.
    let next = r#"
[[command]]
name = "close"
required_level = "support"
[command.payload]
description = "Close and archive this ticket"

[[command]]
name = "claim"
required_level = "staff"
[command.payload]
description = "Claim this ticket"

[[scope]]
id = 100
support_roles = [11]
staff_roles = [12]
"#;
    let store = FilePolicyStore::parse(next).expect("policy should parse");
    registry
        .set_catalog(store.catalog().await.expect("catalog"))
        .await;
    let before = gateway.calls().await.len();
    registry.update().await.expect("update");
    registry.drain().await;

    let calls = gateway.calls().await.split_off(before);
    assert!(calls.contains(&GatewayCall::Edit(SCOPE, "close".to_owned())));
    assert!(calls.contains(&GatewayCall::Create(SCOPE, "claim".to_owned())));
    assert!(calls.contains(&GatewayCall::Delete(SCOPE, "legacy".to_owned())));
}

#[tokio::test]
async fn update_adopts_matching_remote_commands_with_their_grants() {
    let (gateway, registry) = setup(BASIC_POLICY);
    install_settled(&registry, BASIC_POLICY).await;

    // Someone installed a matching claim command out of band.
    let id = gateway
        .seed_command(
            SCOPE,
            WireCommand {
                name: "claim".to_owned(),
                payload: turnstile::types::CommandPayload {
                    description: "Claim this ticket".to_owned(),
                    options: vec![],
                },
                default_allow: true,
            },
        )
        .await;
    gateway.seed_grants(SCOPE, id, vec![allow(7)]).await;

    let next = r#"
[[command]]
name = "close"
required_level = "support"
[command.payload]
description = "Close this ticket"

[[command]]
name = "claim"
required_level = "staff"
[command.payload]
description = "Claim this ticket"

[[scope]]
id = 100
support_roles = [11]
staff_roles = [12]
"#;
    let store = FilePolicyStore::parse(next).expect("policy should parse");
    registry
        .set_catalog(store.catalog().await.expect("catalog"))
        .await;
    let before = gateway.calls().await.len();
    registry.update().await.expect("update");
    registry.drain().await;

    let calls = gateway.calls().await.split_off(before);
    assert!(!calls.contains(&GatewayCall::Create(SCOPE, "claim".to_owned())));
    // The authoritative grants were adopted into the fresh cache.
    let cache = registry
        .cache_entries(SCOPE, "claim")
        .await
        .expect("claim should be installed");
    assert_eq!(cache, vec![allow(7)]);
}

#[tokio::test]
async fn eleventh_subject_flips_default_allow_and_suppresses_writes() {
    // Eleven members all hold the support role.
    let mut policy = String::from(
        r#"
[[command]]
name = "close"
required_level = "support"
[command.payload]
description = "Close this ticket"

[[scope]]
id = 100
support_roles = [11]
"#,
    );
    for subject in 1..=11u64 {
        policy.push_str(&format!(
            "\n[[scope.member]]\nsubject_id = {subject}\nrole_ids = [11]\n"
        ));
    }

    let (gateway, registry) = setup(&policy);
    install_settled(&registry, &policy).await;

    assert!(registry.default_allow("close").await);
    // The first ten pushes wrote; the eleventh crossed the cap and was
    // suppressed.
    assert_eq!(gateway.set_grants_count().await, 10);

    // Further explicit pushes stay suppressed until a reinstall.
    registry.queue_grants(
        SCOPE,
        "close",
        vec![GrantEntry {
            subject: SubjectId(50),
            allow: false,
        }],
    );
    registry.drain().await;
    assert_eq!(gateway.set_grants_count().await, 10);
}

#[tokio::test]
async fn reinstall_clears_the_capacity_fallback() {
    let (_gateway, registry) = setup(BASIC_POLICY);
    install_settled(&registry, BASIC_POLICY).await;

    // Push the cache past the platform cap.
    for subject in 20..31u64 {
        registry.queue_grants(SCOPE, "close", vec![allow(subject)]);
    }
    registry.drain().await;
    assert!(registry.default_allow("close").await);

    // A reinstall discards the oversized cache and rebuilds from
    // membership; the fallback clears with it.
    registry.install(SCOPE).await.expect("reinstall");
    registry.drain().await;
    assert!(!registry.default_allow("close").await);
    assert_eq!(
        registry.cache_entries(SCOPE, "close").await,
        Some(vec![allow(1)])
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limit_backoff_delays_only_its_own_key() {
    let (gateway, registry) = setup(BASIC_POLICY);
    let both = r#"
[[command]]
name = "close"
required_level = "support"
[command.payload]
description = "Close this ticket"

[[command]]
name = "claim"
required_level = "support"
[command.payload]
description = "Claim this ticket"

[[scope]]
id = 100
support_roles = [11]
"#;
    install_settled(&registry, both).await;

    gateway
        .inject_set_grants_error(GatewayError::RateLimited {
            retry_after: Duration::from_secs(2),
        })
        .await;
    let before = gateway.calls().await.len();
    // Fresh subjects, so both pushes genuinely change their caches.
    registry.queue_grants(SCOPE, "close", vec![allow(3)]);
    registry.queue_grants(SCOPE, "claim", vec![allow(4)]);
    registry.drain().await;

    let calls: Vec<GatewayCall> = gateway.calls().await.split_off(before);
    let names: Vec<String> = calls
        .iter()
        .filter_map(|call| match call {
            GatewayCall::SetGrants(_, name, _) => Some(name.clone()),
            _ => None,
        })
        .collect();
    // claim was never stuck behind close's backoff; close still landed
    // after the signalled delay.
    assert_eq!(names, vec!["claim".to_owned(), "close".to_owned()]);
    let close_grants = gateway
        .grants_for(SCOPE, "close")
        .await
        .expect("close should exist");
    assert!(close_grants.contains(&allow(3)));
}

#[tokio::test]
async fn push_for_a_vanished_command_is_a_no_op() {
    let (gateway, registry) = setup(BASIC_POLICY);
    install_settled(&registry, BASIC_POLICY).await;

    let before = gateway.set_grants_count().await;
    registry.queue_grants(SCOPE, "ghost", vec![allow(1)]);
    registry.drain().await;
    assert_eq!(gateway.set_grants_count().await, before);
}

#[tokio::test]
async fn scope_status_reports_counts_and_fallback() {
    let (_gateway, registry) = setup(BASIC_POLICY);
    install_settled(&registry, BASIC_POLICY).await;

    let status = registry.scope_status(SCOPE).await;
    assert_eq!(status.command_count, 1);
    assert_eq!(status.explicit_grants, 1);
    assert!(status.fallback.is_empty());
    assert_eq!(status.to_string(), "1 commands, 1 explicit grants");
}

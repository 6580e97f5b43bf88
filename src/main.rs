#![allow(missing_docs)]

//! Turnstile CLI — offline tooling around the sync engine.
//!
//! The engine itself is embedded by a host bot process; this binary
//! exercises it against a static policy file and an in-memory gateway,
//! for validating a policy before deploying it and for previewing
//! exactly which grants a full install would push.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use turnstile::config::TurnstileConfig;
use turnstile::gateway::memory::InMemoryGateway;
use turnstile::gateway::RemoteGateway;
use turnstile::logging;
use turnstile::policy;
use turnstile::store::file::FilePolicyStore;
use turnstile::store::PolicyStore;
use turnstile::sync::Engine;

#[derive(Parser)]
#[command(name = "turnstile", about = "Permission synchronization engine tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full install + update against an in-memory platform and
    /// print the grants that would be pushed.
    Simulate {
        /// Policy file to load (defaults to the configured path).
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Validate a policy file and summarize the declared catalog.
    Check {
        /// Policy file to load (defaults to the configured path).
        #[arg(long)]
        policy: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_cli();
    let config = TurnstileConfig::load().context("failed to load configuration")?;

    match cli.command {
        Command::Simulate { policy } => simulate(&config, policy).await,
        Command::Check { policy } => check(&config, policy).await,
    }
}

fn policy_path(config: &TurnstileConfig, override_path: Option<PathBuf>) -> PathBuf {
    override_path.unwrap_or_else(|| PathBuf::from(&config.paths.policy_file))
}

async fn simulate(config: &TurnstileConfig, policy: Option<PathBuf>) -> Result<()> {
    let path = policy_path(config, policy);
    let store = FilePolicyStore::load(&path)
        .with_context(|| format!("failed to load policy file {}", path.display()))?;
    let store: Arc<dyn PolicyStore> = Arc::new(store);
    let gateway: Arc<dyn RemoteGateway> = Arc::new(InMemoryGateway::new());

    let engine = Engine::new(gateway, Arc::clone(&store), &config.engine, None);
    engine
        .initialize()
        .await
        .context("initial install failed")?;
    engine.registry().update().await.context("update failed")?;
    engine.drain().await;

    let registry = engine.registry();
    for scope in registry.installed_scopes().await {
        println!("scope {scope}");
        for name in registry.installed_commands(scope).await {
            let fallback = registry.default_allow(&name).await;
            let entries = registry.cache_entries(scope, &name).await.unwrap_or_default();
            if fallback {
                println!("  /{name} — default-allow (no explicit grants enforced)");
                continue;
            }
            println!("  /{name} — {} explicit grants", entries.len());
            for entry in entries {
                let verdict = if entry.allow { "allow" } else { "deny" };
                println!("    {subject}: {verdict}", subject = entry.subject);
            }
        }
    }
    Ok(())
}

async fn check(config: &TurnstileConfig, policy: Option<PathBuf>) -> Result<()> {
    let path = policy_path(config, policy);
    let store = FilePolicyStore::load(&path)
        .with_context(|| format!("failed to load policy file {}", path.display()))?;

    let catalog = store.catalog().await?;
    println!("{} declared commands", catalog.len());
    for spec in &catalog {
        println!("  /{} (requires {})", spec.name, spec.required_level);
    }
    let levels = policy::levels_in_use(&catalog);
    let names: Vec<String> = levels.iter().map(ToString::to_string).collect();
    println!("levels in use: {}", names.join(", "));

    for scope in store.scopes().await? {
        let members = store.members(scope).await?;
        let scope_policy = store.scope_policy(scope).await?;
        println!(
            "scope {scope}: {members} members, {support} support roles, {staff} staff roles",
            members = members.len(),
            support = scope_policy.support_roles.len(),
            staff = scope_policy.staff_roles.len(),
        );
    }
    Ok(())
}

//! Presentation-only scope status publishing.
//!
//! Hosts can surface a per-scope summary (channel topic, presence line)
//! of what the engine last synced. Updates flow through the coalescing
//! queue since only the latest state matters, and a failed publish is
//! logged and dropped; nothing here affects permission correctness.

use std::fmt;

use async_trait::async_trait;

use crate::types::ScopeId;

/// Snapshot of a scope's sync state for display surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeStatus {
    /// Commands currently installed in the scope.
    pub command_count: usize,
    /// Explicit grant entries held across the scope's caches.
    pub explicit_grants: usize,
    /// Names of commands running in default-allow fallback.
    pub fallback: Vec<String>,
}

impl fmt::Display for ScopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} commands, {} explicit grants",
            self.command_count, self.explicit_grants
        )?;
        if !self.fallback.is_empty() {
            write!(f, ", default-allow: {}", self.fallback.join(", "))?;
        }
        Ok(())
    }
}

/// Where scope summaries get published.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Publish the latest summary for a scope.
    async fn publish(&self, scope: ScopeId, status: ScopeStatus) -> anyhow::Result<()>;
}

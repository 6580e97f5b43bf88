//! Per-(command, scope) grant cache.
//!
//! An ordered, subject-unique sequence of explicit grant entries. The
//! cache is the engine's local picture of what the platform holds for
//! one command in one scope; it lives exactly as long as the installed
//! command does and is never persisted.

use crate::types::GrantEntry;

/// The platform accepts at most this many explicit grant entries per
/// command per scope. A cache growing past it flips the command to
/// default-allow fallback instead of erroring.
pub const MAX_EXPLICIT_GRANTS: usize = 10;

/// Ordered, subject-unique grant entries for one command in one scope.
///
/// `add` is an upsert: the most recently added entry for a subject
/// wins outright (last write, not a boolean merge). Not safe for
/// concurrent unsynchronized mutation; callers serialize through the
/// per-key task queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionCache {
    entries: Vec<GrantEntry>,
}

impl PermissionCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a batch of entries: any existing entry for an incoming
    /// subject is removed, then the batch is appended in its given
    /// order.
    pub fn add<I>(&mut self, incoming: I)
    where
        I: IntoIterator<Item = GrantEntry>,
    {
        let incoming: Vec<GrantEntry> = incoming.into_iter().collect();
        self.entries
            .retain(|entry| !incoming.iter().any(|new| new.subject == entry.subject));
        self.entries.extend(incoming);
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Owned snapshot of the entries, safe to read without holding any
    /// lock once returned.
    pub fn entries(&self) -> Vec<GrantEntry> {
        self.entries.clone()
    }

    /// Whether the cache has outgrown what the platform can represent.
    pub fn exceeds_cap(&self) -> bool {
        self.entries.len() > MAX_EXPLICIT_GRANTS
    }
}

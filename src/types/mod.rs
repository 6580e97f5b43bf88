//! Core value types shared across the engine.
//!
//! Identifiers are platform snowflakes wrapped in newtypes so a scope id
//! can never be passed where a subject id is expected. Membership and
//! role data are explicit value types rather than loosely-typed platform
//! objects, so the evaluator and the tests never touch a live client.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// An isolated namespace on the remote platform (one server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A member of a scope (a platform user).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub u64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A role within a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u64);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The remote identity of an installed command. Allocated by the
/// platform; only stable within one (scope, install) lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Authority levels
// ---------------------------------------------------------------------------

/// Ranked access gates for declared commands, lowest to highest.
///
/// The ordering exists for catalogs and display. Whether a member
/// satisfies a level is decided by the short-circuit chain in
/// [`crate::policy::satisfies`], which is *not* a rank comparison:
/// administrators bypass every gate, staff membership does not satisfy
/// [`AuthorityLevel::Admin`], and support membership does not satisfy
/// [`AuthorityLevel::Staff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityLevel {
    /// No gate; any member of the scope.
    Everyone,
    /// Support role-set members, staff role-set members, and administrators.
    Support,
    /// Staff role-set members and administrators.
    Staff,
    /// Platform administrators only.
    Admin,
}

impl fmt::Display for AuthorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Everyone => "everyone",
            Self::Support => "support",
            Self::Staff => "staff",
            Self::Admin => "admin",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// A scope member's policy-relevant snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The member's subject id.
    pub subject_id: SubjectId,
    /// Roles the member currently holds in the scope.
    #[serde(default)]
    pub role_ids: HashSet<RoleId>,
    /// Platform-administrator flag.
    #[serde(default)]
    pub is_administrator: bool,
    /// Automated accounts (bots) are excluded from grant computation;
    /// the platform gates their visibility separately.
    #[serde(default)]
    pub is_automated: bool,
}

/// The per-scope role-set configuration read by the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopePolicy {
    /// Roles whose holders satisfy [`AuthorityLevel::Support`].
    #[serde(default)]
    pub support_roles: HashSet<RoleId>,
    /// Roles whose holders satisfy [`AuthorityLevel::Staff`] and below.
    #[serde(default)]
    pub staff_roles: HashSet<RoleId>,
}

// ---------------------------------------------------------------------------
// Grants
// ---------------------------------------------------------------------------

/// One subject's explicit allow/deny override for a command in a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantEntry {
    /// The subject this override applies to.
    pub subject: SubjectId,
    /// Whether the subject may see and use the command.
    pub allow: bool,
}

// ---------------------------------------------------------------------------
// Command specs
// ---------------------------------------------------------------------------

/// Option kinds understood by the remote platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    /// Nested sub-command; the platform default when no kind is given.
    #[default]
    SubCommand,
    /// Group of sub-commands.
    SubCommandGroup,
    /// Free-text argument.
    String,
    /// Integer argument.
    Integer,
    /// Boolean flag.
    Boolean,
    /// A scope member.
    Subject,
    /// A channel reference.
    Channel,
    /// A role reference.
    Role,
}

/// One node of a command's option tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOption {
    /// Option name.
    pub name: String,
    /// Human-readable description shown by the platform.
    pub description: String,
    /// Option kind; absent means the platform default (sub-command).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<OptionKind>,
    /// Whether the option must be supplied.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    /// Nested options. An absent list and an empty list are the same
    /// payload; normalization keeps them comparable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<CommandOption>,
}

impl CommandOption {
    /// Canonical form: the default kind filled in, children normalized.
    ///
    /// Two structurally-equivalent option trees normalize equal even when
    /// one spells out what the other leaves implicit.
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            kind: Some(self.kind.unwrap_or_default()),
            required: self.required,
            options: self.options.iter().map(Self::normalized).collect(),
        }
    }
}

/// The platform-visible payload of a command, minus its name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Human-readable description shown by the platform.
    pub description: String,
    /// Top-level option tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<CommandOption>,
}

impl CommandPayload {
    /// Canonical form for equality checks against remote state.
    pub fn normalized(&self) -> Self {
        Self {
            description: self.description.clone(),
            options: self.options.iter().map(CommandOption::normalized).collect(),
        }
    }
}

/// A declared command: what the platform should expose, plus the local
/// authority gate deciding who receives explicit grants for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Command name; the stable identity of the command across scopes.
    pub name: String,
    /// Platform-visible payload.
    #[serde(default)]
    pub payload: CommandPayload,
    /// The authority level a member must satisfy to be granted access.
    /// Local-only metadata; never sent to the platform.
    pub required_level: AuthorityLevel,
}

impl CommandSpec {
    /// The payload actually written to the platform. The authority level
    /// stays local; the computed default-allow flag travels with it.
    pub fn to_wire(&self, default_allow: bool) -> WireCommand {
        WireCommand {
            name: self.name.clone(),
            payload: self.payload.clone(),
            default_allow,
        }
    }

    /// Whether this spec and a remote payload describe the same command.
    pub fn payload_matches(&self, remote: &CommandPayload) -> bool {
        self.payload.normalized() == remote.normalized()
    }
}

/// A command as written to or read from the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCommand {
    /// Command name.
    pub name: String,
    /// Platform-visible payload.
    pub payload: CommandPayload,
    /// When set, the platform shows the command to everyone and the
    /// explicit per-subject grant list is not consulted.
    pub default_allow: bool,
}

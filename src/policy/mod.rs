//! Pure authority evaluation. Deterministic, no I/O.
//!
//! The evaluator answers one question — does this member currently
//! satisfy this level — using the short-circuit chain the platform's
//! moderators expect: administrators pass every gate, staff roles carry
//! down to support, support roles carry nothing upward. Rank comparison
//! would get the admin and staff exclusions wrong; keep the chain.

use std::collections::BTreeSet;

use crate::types::{AuthorityLevel, CommandSpec, Member, RoleId, ScopePolicy};

/// Whether `member` currently satisfies `level` under `policy`.
///
/// The chain, highest gate first:
/// - [`AuthorityLevel::Admin`] — only the platform-administrator flag.
/// - [`AuthorityLevel::Staff`] — administrator, or a role in the staff set.
/// - [`AuthorityLevel::Support`] — administrator, a staff role, or a role
///   in the support set.
/// - [`AuthorityLevel::Everyone`] — always.
pub fn satisfies(member: &Member, policy: &ScopePolicy, level: AuthorityLevel) -> bool {
    match level {
        AuthorityLevel::Everyone => true,
        AuthorityLevel::Admin => member.is_administrator,
        AuthorityLevel::Staff => {
            member.is_administrator || holds_any(member, &policy.staff_roles)
        }
        AuthorityLevel::Support => {
            member.is_administrator
                || holds_any(member, &policy.staff_roles)
                || holds_any(member, &policy.support_roles)
        }
    }
}

/// Levels referenced by at least one declared command. Recomputation on
/// a policy change is restricted to this set; levels no command gates on
/// are never evaluated.
pub fn levels_in_use(catalog: &[CommandSpec]) -> BTreeSet<AuthorityLevel> {
    catalog.iter().map(|spec| spec.required_level).collect()
}

/// Whether holding exactly `role` (no administrator flag, no other
/// roles) satisfies `level` under `policy`. Diffing this predicate
/// across a policy change yields the set of levels a role change can
/// have affected.
pub fn role_confers(policy: &ScopePolicy, role: RoleId, level: AuthorityLevel) -> bool {
    match level {
        AuthorityLevel::Everyone => true,
        AuthorityLevel::Admin => false,
        AuthorityLevel::Staff => policy.staff_roles.contains(&role),
        AuthorityLevel::Support => {
            policy.staff_roles.contains(&role) || policy.support_roles.contains(&role)
        }
    }
}

fn holds_any(member: &Member, roles: &std::collections::HashSet<RoleId>) -> bool {
    member.role_ids.iter().any(|role| roles.contains(role))
}

//! Ownership and group-based authorization.

use crate::identity::Principal;
use crate::store::{Device, Visibility};

/// May `principal` observe `device`?
///
/// Admins see everything; everyone else sees public devices plus devices
/// whose owner matches their email or one of their group ids.
pub fn visible(principal: &Principal, device: &Device) -> bool {
    if principal.admin {
        return true;
    }
    device.owner.is_empty()
        || device.owner == principal.email
        || principal.groups.iter().any(|g| *g == device.owner)
}

/// May `principal` mutate `device` (release it, in practice)?
pub fn may_mutate(principal: &Principal, device: &Device) -> bool {
    principal.admin || device.user_id.as_deref() == Some(principal.email.as_str())
}

/// The store-level visibility filter for `principal`, folded into listing
/// queries so pagination and counts stay consistent.
pub fn visibility_of(principal: &Principal) -> Visibility {
    if principal.admin {
        Visibility::All
    } else {
        Visibility::Scoped {
            email: principal.email.clone(),
            groups: principal.groups.clone(),
        }
    }
}

/// Group ids must not contain `@` so they stay distinguishable from emails
/// in `owner` comparisons.
pub fn valid_group_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('@')
}

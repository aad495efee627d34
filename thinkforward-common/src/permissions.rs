//! Permission matrix.
//!
//! A capability is granted when the role table grants it and either the
//! role is `Admin` or the subscription tier table grants it as well.
//! Administrative capabilities are never subscription-gated.

use crate::capability::{Capability, CapabilitySet};
use crate::role::{Role, SubscriptionTier};

/// Capabilities each role may exercise at most.
pub fn role_capabilities(role: Role) -> &'static [Capability] {
    match role {
        Role::Admin => &Capability::ALL,
        Role::Consultant => &[
            Capability::ManageClients,
            Capability::UseAiAssistant,
            Capability::ProcessForms,
            Capability::ManageDocuments,
        ],
        Role::Client => &[Capability::UseAiAssistant],
        Role::Guest | Role::Unknown => &[],
    }
}

/// Capabilities unlocked by each subscription tier.
pub fn tier_capabilities(tier: SubscriptionTier) -> &'static [Capability] {
    match tier {
        SubscriptionTier::Professional => &[
            Capability::AccessAnalytics,
            Capability::UseAiAssistant,
            Capability::ProcessForms,
            Capability::ManageDocuments,
        ],
        SubscriptionTier::Growth => &[
            Capability::UseAiAssistant,
            Capability::ProcessForms,
            Capability::ManageDocuments,
        ],
        SubscriptionTier::Starter => &[Capability::UseAiAssistant, Capability::ProcessForms],
        SubscriptionTier::Free | SubscriptionTier::Unknown => &[],
    }
}

/// Resolve the effective capabilities for a role and subscription tier.
///
/// An unrecognised role or tier yields the empty set.
pub fn resolve_permissions(role: Role, tier: SubscriptionTier) -> CapabilitySet {
    if role == Role::Unknown || tier == SubscriptionTier::Unknown {
        return CapabilitySet::empty();
    }

    let tier_caps = tier_capabilities(tier);
    role_capabilities(role)
        .iter()
        .copied()
        .filter(|cap| role == Role::Admin || tier_caps.contains(cap))
        .collect()
}

/// Same as [`resolve_permissions`], for raw stored values.
pub fn resolve_permissions_str(role: &str, tier: &str) -> CapabilitySet {
    resolve_permissions(Role::from(role.to_string()), SubscriptionTier::from(tier.to_string()))
}

//! The authenticated caller handed to request handlers.

use serde::{Deserialize, Serialize};

use crate::capability::{Capability, CapabilitySet};
use crate::permissions::resolve_permissions;
use crate::role::{Role, SubscriptionTier};

/// Identity attached to every protected request.
///
/// Handlers check `has(capability)` and never compare role strings or
/// re-verify tokens themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    /// Local user ID
    pub user_id: String,
    /// Subject ID issued by the identity provider
    pub external_id: String,
    pub email: String,
    pub role: Role,
    pub subscription_tier: SubscriptionTier,
    pub capabilities: CapabilitySet,
}

impl AuthenticatedIdentity {
    /// Build an identity, resolving capabilities from role and tier.
    pub fn new(
        user_id: impl Into<String>,
        external_id: impl Into<String>,
        email: impl Into<String>,
        role: Role,
        subscription_tier: SubscriptionTier,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            external_id: external_id.into(),
            email: email.into(),
            role,
            subscription_tier,
            capabilities: resolve_permissions(role, subscription_tier),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.has(capability)
    }
}

//! Role and subscription tier definitions.
//!
//! Both axes are stored as free text by the billing and admin subsystems,
//! so parsing never fails: anything unrecognised becomes `Unknown`, which
//! the permission matrix maps to no capabilities at all.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Portal role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum Role {
    Admin,
    Consultant,
    Client,
    Guest,
    /// A stored value that is not one of the known roles.
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Consultant => "Consultant",
            Role::Client => "Client",
            Role::Guest => "Guest",
            Role::Unknown => "Unknown",
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Client
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "consultant" => Role::Consultant,
            "client" => Role::Client,
            "guest" => Role::Guest,
            _ => Role::Unknown,
        })
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(Role::Unknown)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription tier of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum SubscriptionTier {
    Free,
    Starter,
    Growth,
    Professional,
    /// A stored value that is not one of the known tiers.
    Unknown,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Starter => "starter",
            SubscriptionTier::Growth => "growth",
            SubscriptionTier::Professional => "professional",
            SubscriptionTier::Unknown => "unknown",
        }
    }
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        SubscriptionTier::Free
    }
}

impl FromStr for SubscriptionTier {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "free" => SubscriptionTier::Free,
            "starter" => SubscriptionTier::Starter,
            "growth" => SubscriptionTier::Growth,
            "professional" => SubscriptionTier::Professional,
            _ => SubscriptionTier::Unknown,
        })
    }
}

impl From<String> for SubscriptionTier {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(SubscriptionTier::Unknown)
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Capability types for the permission system.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A single named permission gating access to a portal feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Manage user accounts, roles and sync jobs
    ManageUsers,
    /// Manage client records and consultant assignments
    ManageClients,
    /// Access analytics dashboards
    AccessAnalytics,
    /// Use the AI assistant
    UseAiAssistant,
    /// Fill in and process immigration forms
    ProcessForms,
    /// Upload and manage documents
    ManageDocuments,
}

impl Capability {
    /// All capability variants for iteration.
    pub const ALL: [Capability; 6] = [
        Capability::ManageUsers,
        Capability::ManageClients,
        Capability::AccessAnalytics,
        Capability::UseAiAssistant,
        Capability::ProcessForms,
        Capability::ManageDocuments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ManageUsers => "manage_users",
            Capability::ManageClients => "manage_clients",
            Capability::AccessAnalytics => "access_analytics",
            Capability::UseAiAssistant => "use_ai_assistant",
            Capability::ProcessForms => "process_forms",
            Capability::ManageDocuments => "manage_documents",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of capabilities granted to a caller.
///
/// Ordered so that serialized output is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<&[Capability]> for CapabilitySet {
    fn from(caps: &[Capability]) -> Self {
        caps.iter().copied().collect()
    }
}

//! User directory: the local record of every identity-provider user.
//!
//! Users are keyed by the provider's subject ID, with email as the
//! secondary lookup key. Role and subscription tier are owned by the admin
//! and billing subsystems; nothing in this module's sync paths writes them.

mod sqlite;

pub use sqlite::SqliteDirectory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thinkforward_common::{Role, SubscriptionTier};

/// Local user record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    /// Local ID, generated on creation
    pub id: String,
    /// Subject ID issued by the identity provider
    pub external_id: Option<String>,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
    pub subscription_tier: SubscriptionTier,
    /// Linked social accounts, in link order
    pub social_logins: Vec<SocialLogin>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn social_login(&self, provider: &str, provider_id: &str) -> Option<&SocialLogin> {
        self.social_logins
            .iter()
            .find(|s| s.provider == provider && s.provider_id == provider_id)
    }
}

/// A social account linked to a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SocialLogin {
    pub provider: String,
    pub provider_id: String,
    pub profile_data: serde_json::Value,
    pub linked_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// A social account observed on the provider side.
#[derive(Debug, Clone, PartialEq)]
pub struct SocialLink {
    pub provider: String,
    pub provider_id: String,
    pub profile_data: serde_json::Value,
    /// When the provider says the account was linked
    pub linked_at: Option<DateTime<Utc>>,
}

/// Profile fields reported by a sync source.
///
/// `None` and blank values never overwrite stored data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl ProfileUpdate {
    pub fn names(first_name: Option<String>, last_name: Option<String>) -> Self {
        Self {
            email: None,
            first_name,
            last_name,
        }
    }
}

/// Result of [`UserDirectory::find_or_create`].
#[derive(Debug, Clone)]
pub struct FindOrCreate {
    pub user: User,
    /// A new record was inserted
    pub created: bool,
    /// An email-matched record was moved to the new external ID
    pub migrated: bool,
}

/// Result of a directory mutation that may be a no-op.
#[derive(Debug, Clone)]
pub struct Synced {
    pub user: User,
    pub changed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
    #[error("User not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    Invalid(String),
}

/// Persistent user store.
///
/// # Contract
///
/// Implementations must converge under concurrent callers:
/// - at most one user per external ID, and per email
/// - `find_or_create` treats a uniqueness violation on insert as "already
///   created elsewhere" and returns the existing record
/// - `link_social_account` inserts a `(provider, provider_id)` pair at most
///   once per user and only touches `last_used_at` on repeats
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>, DirectoryError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DirectoryError>;

    /// Look up by external ID, then by email, otherwise create a Client on
    /// the free tier. An email match with a different external ID takes
    /// over the new external ID.
    async fn find_or_create(
        &self,
        external_id: &str,
        email: &str,
        profile: &ProfileUpdate,
    ) -> Result<FindOrCreate, DirectoryError>;

    /// Overwrite email and names with the non-blank incoming values.
    async fn apply_profile_update(
        &self,
        user: &User,
        profile: &ProfileUpdate,
    ) -> Result<Synced, DirectoryError>;

    async fn link_social_account(
        &self,
        user: &User,
        link: &SocialLink,
    ) -> Result<Synced, DirectoryError>;

    async fn touch_last_login(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), DirectoryError>;

    async fn count(&self) -> Result<u64, DirectoryError>;
}

/// Canonical form used for storing and matching emails.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Trimmed value, or `None` when blank.
pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

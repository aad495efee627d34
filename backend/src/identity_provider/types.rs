//! Wire types shared by the provider REST API and its webhook payloads.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::directory::{ProfileUpdate, SocialLink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub id: String,
    pub email_address: String,
}

/// A social account linked to a provider user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalAccount {
    #[serde(default)]
    pub id: String,
    pub provider: String,
    /// The social provider's own user ID. Missing on accounts whose
    /// verification never completed.
    #[serde(default, alias = "external_id")]
    pub provider_user_id: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Epoch milliseconds
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl ExternalAccount {
    /// `None` when the account carries no provider user ID to key on.
    pub fn to_social_link(&self) -> Option<SocialLink> {
        let provider_id = self
            .provider_user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())?;

        Some(SocialLink {
            provider: normalize_provider(&self.provider),
            provider_id: provider_id.to_string(),
            profile_data: json!({
                "email": self.email_address,
                "username": self.username,
                "avatar_url": self.avatar_url,
            }),
            linked_at: self.created_at.and_then(from_millis),
        })
    }
}

/// A user as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUser {
    pub id: String,
    #[serde(default)]
    pub email_addresses: Vec<EmailAddress>,
    #[serde(default)]
    pub primary_email_address_id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub external_accounts: Vec<ExternalAccount>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub last_sign_in_at: Option<i64>,
}

impl ProviderUser {
    /// The address the primary pointer refers to.
    ///
    /// `None` when the pointer is missing or does not match any listed address.
    pub fn primary_email(&self) -> Option<&str> {
        let primary_id = self.primary_email_address_id.as_deref()?;
        self.email_addresses
            .iter()
            .find(|e| e.id == primary_id)
            .map(|e| e.email_address.as_str())
            .filter(|e| !e.trim().is_empty())
    }

    pub fn profile_update(&self) -> ProfileUpdate {
        ProfileUpdate {
            email: self.primary_email().map(str::to_string),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

/// A listing entry that could not be read as a [`ProviderUser`].
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedUser {
    /// The entry's `id` when it has one, otherwise empty
    pub id: String,
    pub reason: String,
}

/// One page of a user listing, decoded entry by entry.
pub type UserPage = Vec<Result<ProviderUser, MalformedUser>>;

/// Paginated listing response. The provider returns either a bare array or
/// a `{data, total_count}` object depending on API version. Entries stay
/// raw so that one bad record does not discard the page.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum UserList {
    Paged { data: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

impl UserList {
    pub(crate) fn into_page(self) -> UserPage {
        let entries = match self {
            UserList::Paged { data } => data,
            UserList::Bare(entries) => entries,
        };
        entries.into_iter().map(decode_entry).collect()
    }
}

fn decode_entry(entry: serde_json::Value) -> Result<ProviderUser, MalformedUser> {
    let id = entry
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    serde_json::from_value(entry).map_err(|e| MalformedUser {
        id,
        reason: e.to_string(),
    })
}

/// `oauth_google` and `google_oauth` both become `google`.
pub fn normalize_provider(provider: &str) -> String {
    provider
        .trim()
        .to_lowercase()
        .replace("oauth_", "")
        .replace("_oauth", "")
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

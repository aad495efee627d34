//! Ingestion of signed identity-provider events.

mod signature;

pub use signature::{compute_signature, verify_signature, SignatureError};

use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::directory::{DirectoryError, UserDirectory};
use crate::identity_provider::{ExternalAccount, IdentityProvider, ProviderError, ProviderUser};
use crate::sync::{link_external_accounts, sync_provider_user, SyncError, SyncOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Processed,
    Skipped(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("Identity provider unavailable: {0}")]
    Provider(ProviderError),
}

impl From<SyncError> for WebhookError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Directory(e) => WebhookError::Directory(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SessionEvent {
    #[serde(default)]
    id: Option<String>,
    user_id: String,
}

/// Events that only name the user; the current record is fetched.
#[derive(Debug, Deserialize)]
struct UserRefEvent {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalAccountEvent {
    user_id: String,
    #[serde(flatten)]
    account: ExternalAccount,
}

fn parse_data<T: DeserializeOwned>(event_type: &str, data: serde_json::Value) -> Result<T, WebhookError> {
    serde_json::from_value(data)
        .map_err(|e| WebhookError::Malformed(format!("{} data: {}", event_type, e)))
}

/// Verifies and applies provider events to the user directory.
pub struct WebhookIngestor {
    secret: String,
    tolerance_secs: i64,
    directory: Arc<dyn UserDirectory>,
    provider: Arc<dyn IdentityProvider>,
}

impl WebhookIngestor {
    pub fn new(
        secret: impl Into<String>,
        tolerance_secs: i64,
        directory: Arc<dyn UserDirectory>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
            directory,
            provider,
        }
    }

    /// Verify, parse and apply one delivery.
    ///
    /// The signature is checked against the raw body before anything is
    /// parsed or read from the directory. The envelope's `type` decides the
    /// handler; `path_event` is advisory.
    pub async fn handle(
        &self,
        path_event: Option<&str>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Ack, WebhookError> {
        if let Err(e) = verify_signature(&self.secret, headers, body, Utc::now().timestamp(), self.tolerance_secs) {
            tracing::warn!("Webhook signature verification failed: {}", e);
            return Err(e.into());
        }

        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| WebhookError::Malformed(format!("envelope: {}", e)))?;

        if let Some(path_event) = path_event {
            if path_event != envelope.event_type {
                tracing::warn!(
                    path_event = %path_event,
                    event_type = %envelope.event_type,
                    "Webhook path disagrees with signed event type, using signed type"
                );
            }
        }

        let start = Instant::now();
        let event_type = envelope.event_type.clone();
        let result = self.dispatch(envelope).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(Ack::Processed) => {
                tracing::info!(event_type = %event_type, duration_ms, "Processed webhook event")
            }
            Ok(Ack::Skipped(reason)) => {
                tracing::info!(event_type = %event_type, reason = %reason, "Skipped webhook event")
            }
            Err(WebhookError::Directory(e)) => {
                tracing::error!(event_type = %event_type, duration_ms, "Webhook event failed: {}", e)
            }
            Err(WebhookError::Provider(e)) => {
                tracing::error!(event_type = %event_type, duration_ms, "Webhook event failed: {}", e)
            }
            Err(e) => tracing::warn!(event_type = %event_type, "Rejected webhook event: {}", e),
        }

        result
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<Ack, WebhookError> {
        let event_type = envelope.event_type.as_str();

        match event_type {
            "user.created" | "user.updated" => {
                let user: ProviderUser = parse_data(event_type, envelope.data)?;
                match sync_provider_user(self.directory.as_ref(), &user).await? {
                    SyncOutcome::Skipped(reason) => Ok(Ack::Skipped(reason)),
                    _ => Ok(Ack::Processed),
                }
            }
            "externalAccount.created" => {
                let event: ExternalAccountEvent = parse_data(event_type, envelope.data)?;
                self.link_account(event).await
            }
            "session.created" => {
                let event: SessionEvent = parse_data(event_type, envelope.data)?;
                self.session_started(event).await
            }
            "user.email.created" | "user.email.updated" => {
                let event: UserRefEvent = parse_data(event_type, envelope.data)?;
                let Some(user) = self.fetch_user(event).await? else {
                    return Ok(Ack::Skipped("user not found at provider".to_string()));
                };
                match sync_provider_user(self.directory.as_ref(), &user).await? {
                    SyncOutcome::Skipped(reason) => Ok(Ack::Skipped(reason)),
                    _ => Ok(Ack::Processed),
                }
            }
            "oauth.access_token.created" | "oauth.access_token.refreshed" => {
                let event: UserRefEvent = parse_data(event_type, envelope.data)?;
                let Some(user) = self.fetch_user(event).await? else {
                    return Ok(Ack::Skipped("user not found at provider".to_string()));
                };
                self.refresh_links(user).await
            }
            "user.deleted" | "session.revoked" | "session.removed" => {
                let id = envelope.data.get("id").and_then(|v| v.as_str()).unwrap_or("");
                tracing::info!(event_type = %event_type, id = %id, "Event acknowledged, no local change");
                Ok(Ack::Skipped(format!("{} is not applied locally", event_type)))
            }
            other => {
                tracing::info!(event_type = %other, "Unhandled webhook event type");
                Ok(Ack::Skipped(format!("unhandled event type {}", other)))
            }
        }
    }

    async fn link_account(&self, event: ExternalAccountEvent) -> Result<Ack, WebhookError> {
        // User creation only flows through user.created or the login path.
        let Some(user) = self.directory.find_by_external_id(&event.user_id).await? else {
            tracing::warn!(external_id = %event.user_id, "External account for unknown user");
            return Ok(Ack::Skipped("unknown user".to_string()));
        };

        let Some(link) = event.account.to_social_link() else {
            tracing::warn!(
                user_id = %user.id,
                provider = %event.account.provider,
                "External account has no provider user ID, not linking"
            );
            return Ok(Ack::Skipped("external account without provider user ID".to_string()));
        };

        self.directory.link_social_account(&user, &link).await?;
        Ok(Ack::Processed)
    }

    /// Current provider record for the user an event refers to. `None` when
    /// the event names no user or the provider no longer has it.
    async fn fetch_user(&self, event: UserRefEvent) -> Result<Option<ProviderUser>, WebhookError> {
        let Some(user_id) = event.user_id.filter(|id| !id.trim().is_empty()) else {
            tracing::info!("Event names no user, nothing to refresh");
            return Ok(None);
        };

        match self.provider.get_user(&user_id).await {
            Ok(user) => Ok(Some(user)),
            Err(ProviderError::NotFound(_)) => {
                tracing::warn!(external_id = %user_id, "Provider has no user for event");
                Ok(None)
            }
            Err(e) => Err(WebhookError::Provider(e)),
        }
    }

    /// Re-link social accounts for a user already in the directory.
    async fn refresh_links(&self, provider_user: ProviderUser) -> Result<Ack, WebhookError> {
        let Some(user) = self.directory.find_by_external_id(&provider_user.id).await? else {
            tracing::warn!(external_id = %provider_user.id, "Token event for user missing from directory");
            return Ok(Ack::Skipped("unknown user".to_string()));
        };

        let (user, linked) =
            link_external_accounts(self.directory.as_ref(), user, &provider_user.external_accounts)
                .await?;
        if linked {
            tracing::info!(user_id = %user.id, "Linked new social accounts from token event");
        }
        Ok(Ack::Processed)
    }

    async fn session_started(&self, event: SessionEvent) -> Result<Ack, WebhookError> {
        let Some(user) = self.directory.find_by_external_id(&event.user_id).await? else {
            tracing::warn!(
                external_id = %event.user_id,
                session_id = ?event.id,
                "Session created for user missing from directory"
            );
            return Ok(Ack::Skipped("unknown user".to_string()));
        };

        self.directory.touch_last_login(&user.id, Utc::now()).await?;
        tracing::info!(user_id = %user.id, "User signed in");
        Ok(Ack::Processed)
    }
}

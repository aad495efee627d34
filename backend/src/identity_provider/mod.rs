//! Client for the identity provider's backend REST API.

mod types;

pub use types::{
    normalize_provider, EmailAddress, ExternalAccount, MalformedUser, ProviderUser, UserPage,
};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::config::IdentityProviderConfig;
use types::UserList;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Provider returned status {0}")]
    Status(u16),
    #[error("User not found: {0}")]
    NotFound(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Read access to the provider's user list.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// One page of users. Entries that do not decode are returned as
    /// [`MalformedUser`] in place.
    async fn list_users(&self, limit: u32, offset: u32) -> Result<UserPage, ProviderError>;

    async fn get_user(&self, id: &str) -> Result<ProviderUser, ProviderError>;
}

pub struct ProviderClient {
    http_client: Client,
    base_url: String,
    secret_key: String,
}

impl ProviderClient {
    pub fn new(base_url: &str, secret_key: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    pub fn from_config(config: &IdentityProviderConfig) -> Result<Self, ProviderError> {
        Self::new(
            &config.api_url,
            &config.secret_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, ProviderError> {
        self.http_client
            .get(url)
            .bearer_auth(&self.secret_key)
            .query(query)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for ProviderClient {
    async fn list_users(&self, limit: u32, offset: u32) -> Result<UserPage, ProviderError> {
        let url = format!("{}/users", self.base_url);
        let query = [
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
            ("order_by", "created_at".to_string()),
        ];

        let response = self.get(&url, &query).await?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        let list: UserList = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(list.into_page())
    }

    async fn get_user(&self, id: &str) -> Result<ProviderUser, ProviderError> {
        let url = format!("{}/users/{}", self.base_url, id);

        let response = self.get(&url, &[]).await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(ProviderError::NotFound(id.to_string())),
            status if !status.is_success() => return Err(ProviderError::Status(status.as_u16())),
            _ => {}
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

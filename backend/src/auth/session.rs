use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use thinkforward_common::{AuthenticatedIdentity, Capability};

use super::verifier::{TokenVerifier, VerifiedToken, VerifyError};
use crate::directory::{non_blank, DirectoryError, ProfileUpdate, User, UserDirectory};
use crate::error::ApiError;
use crate::identity_provider::{IdentityProvider, ProviderError};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),
    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl From<DirectoryError> for AuthError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Unavailable(msg) => AuthError::DirectoryUnavailable(msg),
            other => AuthError::Rejected(other.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Verify(VerifyError::MissingCredential) => ApiError::MissingCredential,
            AuthError::Verify(VerifyError::InvalidToken(_)) => ApiError::InvalidToken,
            AuthError::Rejected(_) => ApiError::Unauthorized,
            AuthError::DirectoryUnavailable(_) | AuthError::ProviderUnavailable(_) => {
                ApiError::DirectoryUnavailable
            }
        }
    }
}

/// Turns a bearer credential into an [`AuthenticatedIdentity`].
///
/// Capabilities are recomputed from the stored role and tier on every call,
/// so admin or billing changes apply from the next request.
pub struct SessionResolver {
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn UserDirectory>,
    provider: Arc<dyn IdentityProvider>,
}

impl SessionResolver {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        directory: Arc<dyn UserDirectory>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            verifier,
            directory,
            provider,
        }
    }

    pub async fn resolve(&self, headers: &HeaderMap) -> Result<AuthenticatedIdentity, AuthError> {
        let authorization = headers
            .get(AUTHORIZATION)
            .map(|v| v.to_str())
            .transpose()
            .map_err(|_| VerifyError::InvalidToken("non-ASCII Authorization header".to_string()));

        let verified = match authorization {
            Ok(authorization) => self.verifier.verify(authorization).await,
            Err(e) => Err(e),
        };

        let verified = match verified {
            Ok(verified) => verified,
            Err(VerifyError::MissingCredential) => {
                tracing::info!("Request without credentials");
                return Err(VerifyError::MissingCredential.into());
            }
            Err(VerifyError::InvalidToken(reason)) => {
                tracing::warn!("Rejected session token: {}", reason);
                return Err(VerifyError::InvalidToken(reason).into());
            }
        };

        let user = self.load_user(&verified).await.map_err(|e| {
            match &e {
                AuthError::DirectoryUnavailable(_) | AuthError::ProviderUnavailable(_) => {
                    tracing::error!(external_id = %verified.external_id, "Session lookup failed: {}", e)
                }
                _ => tracing::warn!(external_id = %verified.external_id, "Session rejected: {}", e),
            }
            e
        })?;

        self.record_login(&user);

        Ok(AuthenticatedIdentity::new(
            user.id,
            verified.external_id,
            user.email,
            user.role,
            user.subscription_tier,
        ))
    }

    async fn load_user(&self, verified: &VerifiedToken) -> Result<User, AuthError> {
        if let Some(user) = self.directory.find_by_external_id(&verified.external_id).await? {
            return Ok(user);
        }

        let (email, profile) = self.first_login_profile(verified).await?;
        let found = self
            .directory
            .find_or_create(&verified.external_id, &email, &profile)
            .await?;

        if found.created {
            tracing::info!(user_id = %found.user.id, "Created user on first login");
        }
        Ok(found.user)
    }

    /// Email and names for a subject the directory has not seen yet. Token
    /// claims are used when present, otherwise the provider is asked.
    async fn first_login_profile(
        &self,
        verified: &VerifiedToken,
    ) -> Result<(String, ProfileUpdate), AuthError> {
        let claims = &verified.claims;
        if let Some(email) = non_blank(claims.email.as_deref()) {
            let profile = ProfileUpdate::names(claims.first_name.clone(), claims.last_name.clone());
            return Ok((email.to_string(), profile));
        }

        let provider_user = match self.provider.get_user(&verified.external_id).await {
            Ok(user) => user,
            Err(ProviderError::NotFound(id)) => {
                return Err(AuthError::Rejected(format!("provider has no user {}", id)))
            }
            Err(e) => return Err(AuthError::ProviderUnavailable(e.to_string())),
        };

        let email = provider_user
            .primary_email()
            .ok_or_else(|| AuthError::Rejected("no primary email".to_string()))?
            .to_string();
        Ok((email, provider_user.profile_update()))
    }

    /// Best effort; runs detached so a slow write never delays the request.
    fn record_login(&self, user: &User) {
        let directory = Arc::clone(&self.directory);
        let user_id = user.id.clone();
        tokio::spawn(async move {
            if let Err(e) = directory.touch_last_login(&user_id, Utc::now()).await {
                tracing::warn!(user_id = %user_id, "Failed to record login time: {}", e);
            }
        });
    }
}

/// Middleware that resolves the caller and stores the identity in request
/// extensions. Protected routes sit behind this layer.
pub async fn require_identity(
    State(resolver): State<Arc<SessionResolver>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = resolver.resolve(request.headers()).await?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Extractor for the identity attached by [`require_identity`].
#[derive(Debug, Clone)]
pub struct CurrentIdentity(pub AuthenticatedIdentity);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedIdentity>()
            .cloned()
            .map(CurrentIdentity)
            .ok_or(ApiError::Unauthorized)
    }
}

pub fn require_capability(
    identity: &AuthenticatedIdentity,
    capability: Capability,
) -> Result<(), ApiError> {
    if identity.has(capability) {
        Ok(())
    } else {
        tracing::info!(
            user_id = %identity.user_id,
            capability = %capability,
            "Capability check failed"
        );
        Err(ApiError::Forbidden(capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{FindOrCreate, MockUserDirectory, SqliteDirectory};
    use crate::identity_provider::{MockIdentityProvider, ProviderUser};
    use crate::test_util::StaticTokenVerifier;
    use axum::http::HeaderValue;
    use serde_json::json;
    use std::time::Duration;
    use thinkforward_common::{Role, SubscriptionTier};

    fn headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token)).unwrap());
        headers
    }

    fn verifier() -> Arc<StaticTokenVerifier> {
        Arc::new(
            StaticTokenVerifier::default()
                .with_token("tok_ana", "user_ana", Some("Ana@X.com"))
                .with_token("tok_bo", "user_bo", None),
        )
    }

    fn unused_provider() -> Arc<MockIdentityProvider> {
        Arc::new(MockIdentityProvider::new())
    }

    fn stored_user(role: Role, tier: SubscriptionTier) -> User {
        let now = Utc::now();
        User {
            id: "local_1".to_string(),
            external_id: Some("user_ana".to_string()),
            email: "ana@x.com".to_string(),
            first_name: None,
            last_name: None,
            role,
            subscription_tier: tier,
            social_logins: Vec::new(),
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_missing_and_invalid_credentials() {
        let resolver = SessionResolver::new(
            verifier(),
            Arc::new(MockUserDirectory::new()),
            unused_provider(),
        );

        let missing = resolver.resolve(&HeaderMap::new()).await.unwrap_err();
        assert!(matches!(ApiError::from(missing), ApiError::MissingCredential));

        let invalid = resolver.resolve(&headers("tok_forged")).await.unwrap_err();
        assert!(matches!(ApiError::from(invalid), ApiError::InvalidToken));
    }

    #[tokio::test]
    async fn test_first_login_creates_client_on_free_tier() {
        let dir = Arc::new(SqliteDirectory::open(":memory:").unwrap());
        let resolver = SessionResolver::new(verifier(), dir.clone(), unused_provider());

        let identity = resolver.resolve(&headers("tok_ana")).await.unwrap();
        let again = resolver.resolve(&headers("tok_ana")).await.unwrap();

        assert_eq!(identity.external_id, "user_ana");
        assert_eq!(identity.email, "ana@x.com");
        assert_eq!(identity.role, Role::Client);
        assert_eq!(identity.subscription_tier, SubscriptionTier::Free);
        assert!(identity.capabilities.is_empty());
        assert_eq!(identity.user_id, again.user_id);
        assert_eq!(dir.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_email_fetched_from_provider_when_token_has_none() {
        let dir = Arc::new(SqliteDirectory::open(":memory:").unwrap());
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_get_user()
            .withf(|id| id == "user_bo")
            .times(1)
            .returning(|_| {
                Ok(serde_json::from_value::<ProviderUser>(json!({
                    "id": "user_bo",
                    "email_addresses": [{"id": "idn_1", "email_address": "bo@x.com"}],
                    "primary_email_address_id": "idn_1",
                    "first_name": "Bo"
                }))
                .unwrap())
            });
        let resolver = SessionResolver::new(verifier(), dir.clone(), Arc::new(provider));

        let identity = resolver.resolve(&headers("tok_bo")).await.unwrap();

        assert_eq!(identity.email, "bo@x.com");
        let user = dir.find_by_external_id("user_bo").await.unwrap().unwrap();
        assert_eq!(user.first_name.as_deref(), Some("Bo"));
    }

    #[tokio::test]
    async fn test_no_email_anywhere_is_unauthorized() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_get_user()
            .returning(|id| Err(ProviderError::NotFound(id.to_string())));
        let mut dir = MockUserDirectory::new();
        dir.expect_find_by_external_id().returning(|_| Ok(None));
        let resolver = SessionResolver::new(verifier(), Arc::new(dir), Arc::new(provider));

        let err = resolver.resolve(&headers("tok_bo")).await.unwrap_err();
        assert!(matches!(ApiError::from(err), ApiError::Unauthorized));
    }

    #[tokio::test]
    async fn test_directory_outage_is_retryable() {
        let mut dir = MockUserDirectory::new();
        dir.expect_find_by_external_id()
            .returning(|_| Err(DirectoryError::Unavailable("disk full".into())));
        let resolver = SessionResolver::new(verifier(), Arc::new(dir), unused_provider());

        let err = resolver.resolve(&headers("tok_ana")).await.unwrap_err();
        let api = ApiError::from(err);
        assert_eq!(api.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_role_change_applies_on_next_request() {
        let mut dir = MockUserDirectory::new();
        let mut seq = mockall::Sequence::new();
        dir.expect_find_by_external_id()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(stored_user(Role::Client, SubscriptionTier::Growth))));
        dir.expect_find_by_external_id()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(stored_user(Role::Admin, SubscriptionTier::Free))));
        dir.expect_touch_last_login().returning(|_, _| Ok(()));
        let resolver = SessionResolver::new(verifier(), Arc::new(dir), unused_provider());

        let before = resolver.resolve(&headers("tok_ana")).await.unwrap();
        let after = resolver.resolve(&headers("tok_ana")).await.unwrap();

        assert!(!before.has(Capability::ManageUsers));
        assert!(before.has(Capability::UseAiAssistant));
        assert!(after.has(Capability::ManageUsers));
    }

    #[tokio::test]
    async fn test_login_time_failure_does_not_fail_request() {
        let mut dir = MockUserDirectory::new();
        dir.expect_find_by_external_id().returning(|_| Ok(None));
        dir.expect_find_or_create().returning(|_, _, _| {
            Ok(FindOrCreate {
                user: stored_user(Role::Client, SubscriptionTier::Free),
                created: true,
                migrated: false,
            })
        });
        dir.expect_touch_last_login()
            .returning(|_, _| Err(DirectoryError::Unavailable("locked".into())));
        let resolver = SessionResolver::new(verifier(), Arc::new(dir), unused_provider());

        assert!(resolver.resolve(&headers("tok_ana")).await.is_ok());
    }

    #[tokio::test]
    async fn test_login_time_recorded() {
        let dir = Arc::new(SqliteDirectory::open(":memory:").unwrap());
        let resolver = SessionResolver::new(verifier(), dir.clone(), unused_provider());

        resolver.resolve(&headers("tok_ana")).await.unwrap();

        let mut recorded = false;
        for _ in 0..50 {
            let user = dir.find_by_external_id("user_ana").await.unwrap().unwrap();
            if user.last_login_at.is_some() {
                recorded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recorded);
    }

    #[test]
    fn test_require_capability() {
        let identity = AuthenticatedIdentity::new(
            "u1",
            "user_ana",
            "ana@x.com",
            Role::Consultant,
            SubscriptionTier::Starter,
        );

        assert!(require_capability(&identity, Capability::ProcessForms).is_ok());
        assert!(matches!(
            require_capability(&identity, Capability::ManageClients),
            Err(ApiError::Forbidden(Capability::ManageClients))
        ));
    }
}

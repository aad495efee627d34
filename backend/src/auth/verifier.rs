use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::config::IdentityProviderConfig;

/// Minimum time between two JWKS refreshes triggered by unknown key IDs.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Profile claims carried by a session token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenClaims {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub session_id: Option<String>,
}

/// A token that passed signature, expiry, issuer and audience checks.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedToken {
    /// Subject ID issued by the identity provider
    pub external_id: String,
    pub claims: TokenClaims,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Missing credential")]
    MissingCredential,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify the value of an `Authorization` header.
    async fn verify(&self, authorization: Option<&str>) -> Result<VerifiedToken, VerifyError>;
}

/// Extract the token from `Bearer <token>`.
pub fn parse_bearer(authorization: Option<&str>) -> Result<&str, VerifyError> {
    let value = authorization.ok_or(VerifyError::MissingCredential)?;

    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| VerifyError::InvalidToken("malformed Authorization header".to_string()))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(VerifyError::InvalidToken("unsupported authorization scheme".to_string()));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(VerifyError::InvalidToken("empty bearer token".to_string()));
    }
    Ok(token)
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OidcConfig {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, alias = "given_name")]
    first_name: Option<String>,
    #[serde(default, alias = "family_name")]
    last_name: Option<String>,
}

/// Verifies RS256 session tokens against the provider's JWKS.
///
/// Keys are fetched on first use and cached by `kid`.
pub struct JwksVerifier {
    http_client: Client,
    issuer: String,
    audience: Option<String>,
    configured_jwks_url: Option<String>,
    jwks_url: OnceCell<String>,
    keys: RwLock<HashMap<String, DecodingKey>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl JwksVerifier {
    pub fn new(config: &IdentityProviderConfig) -> Result<Self, VerifyError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VerifyError::InvalidToken(format!("HTTP client setup failed: {}", e)))?;

        let audience = Some(config.audience.trim())
            .filter(|a| !a.is_empty())
            .map(str::to_string);

        Ok(Self {
            http_client,
            issuer: config.issuer.clone(),
            audience,
            configured_jwks_url: config.jwks_url.clone(),
            jwks_url: OnceCell::new(),
            keys: RwLock::new(HashMap::new()),
            last_refresh: Mutex::new(None),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, String> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("{} returned {}", url, response.status()));
        }
        response.json().await.map_err(|e| e.to_string())
    }

    async fn jwks_url(&self) -> Result<&str, String> {
        self.jwks_url
            .get_or_try_init(|| async {
                if let Some(url) = &self.configured_jwks_url {
                    return Ok(url.clone());
                }
                let discovery = format!(
                    "{}/.well-known/openid-configuration",
                    self.issuer.trim_end_matches('/')
                );
                let config: OidcConfig = self.get_json(&discovery).await?;
                Ok::<_, String>(config.jwks_uri)
            })
            .await
            .map(String::as_str)
    }

    async fn fetch_keys(&self) -> Result<HashMap<String, DecodingKey>, String> {
        let url = self.jwks_url().await?;
        tracing::info!("Fetching JWKS from {}", url);

        let response: JwksResponse = self.get_json(url).await?;

        let mut keys = HashMap::new();
        for jwk in response.keys {
            let (Some(kid), Some(n), Some(e)) = (&jwk.kid, &jwk.n, &jwk.e) else {
                continue;
            };
            if jwk.kty != "RSA" {
                continue;
            }
            match DecodingKey::from_rsa_components(n, e) {
                Ok(key) => {
                    keys.insert(kid.clone(), key);
                }
                Err(e) => {
                    tracing::warn!("Failed to parse RSA key {}: {}", kid, e);
                }
            }
        }

        tracing::info!("Loaded {} JWKS keys", keys.len());
        Ok(keys)
    }

    /// Refresh the key cache unless another refresh happened recently.
    async fn refresh_keys(&self) -> Result<(), VerifyError> {
        let mut last_refresh = self.last_refresh.lock().await;
        if let Some(at) = *last_refresh {
            if at.elapsed() < MIN_REFRESH_INTERVAL {
                return Ok(());
            }
        }
        *last_refresh = Some(Instant::now());

        match self.fetch_keys().await {
            Ok(keys) => {
                *self.keys.write().await = keys;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("JWKS fetch failed: {}", e);
                Err(VerifyError::InvalidToken("signing keys unavailable".to_string()))
            }
        }
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Ok(key.clone());
        }

        self.refresh_keys().await?;

        self.keys
            .read()
            .await
            .get(kid)
            .cloned()
            .ok_or_else(|| VerifyError::InvalidToken(format!("unknown key id {}", kid)))
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, authorization: Option<&str>) -> Result<VerifiedToken, VerifyError> {
        let token = parse_bearer(authorization)?;

        let header = decode_header(token).map_err(|e| VerifyError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| VerifyError::InvalidToken("Missing kid in token header".to_string()))?;

        let key = self.key_for(&kid).await?;

        let token_data = decode::<Claims>(token, &key, &self.validation())
            .map_err(|e| VerifyError::InvalidToken(e.to_string()))?;
        let claims = token_data.claims;

        if claims.sub.trim().is_empty() {
            return Err(VerifyError::InvalidToken("empty subject".to_string()));
        }

        Ok(VerifiedToken {
            external_id: claims.sub,
            claims: TokenClaims {
                email: claims.email,
                first_name: claims.first_name,
                last_name: claims.last_name,
                session_id: claims.sid,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_config, test_jwks, TestToken, TEST_KID};
    use claim::{assert_err, assert_ok};
    use rstest::rstest;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn jwks_server(expected_fetches: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_jwks(TEST_KID)))
            .expect(expected_fetches)
            .mount(&server)
            .await;
        server
    }

    fn verifier_for(server: &MockServer) -> JwksVerifier {
        let mut config = test_config().identity_provider;
        config.jwks_url = Some(format!("{}/.well-known/jwks.json", server.uri()));
        JwksVerifier::new(&config).unwrap()
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    #[rstest]
    #[case(Some("Basic dXNlcjpwYXNz"))]
    #[case(Some("Bearer"))]
    #[case(Some("Bearer    "))]
    #[case(Some("eyJhbGciOiJSUzI1NiJ9"))]
    fn test_parse_bearer_rejects_malformed(#[case] header: Option<&str>) {
        assert!(matches!(parse_bearer(header), Err(VerifyError::InvalidToken(_))));
    }

    #[test]
    fn test_parse_bearer() {
        assert!(matches!(parse_bearer(None), Err(VerifyError::MissingCredential)));
        assert_eq!(parse_bearer(Some("Bearer abc.def")).unwrap(), "abc.def");
        assert_eq!(parse_bearer(Some("bearer abc.def")).unwrap(), "abc.def");
    }

    #[tokio::test]
    async fn test_valid_token() {
        let server = jwks_server(1).await;
        let verifier = verifier_for(&server);
        let token = TestToken::new("user_abc").email("ana@x.com").first_name("Ana").sign();

        let verified = verifier.verify(Some(&bearer(&token))).await.unwrap();

        assert_eq!(verified.external_id, "user_abc");
        assert_eq!(verified.claims.email.as_deref(), Some("ana@x.com"));
        assert_eq!(verified.claims.first_name.as_deref(), Some("Ana"));
        assert_eq!(verified.claims.last_name, None);
        assert_eq!(verified.claims.session_id.as_deref(), Some("sess_test"));

        // Cached key, no second fetch
        assert_ok!(verifier.verify(Some(&bearer(&token))).await);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let server = jwks_server(1).await;
        let verifier = verifier_for(&server);
        let token = TestToken::new("user_abc").expired().sign();

        let result = verifier.verify(Some(&bearer(&token))).await;
        assert!(matches!(result, Err(VerifyError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_wrong_issuer_rejected() {
        let server = jwks_server(1).await;
        let verifier = verifier_for(&server);
        let token = TestToken::new("user_abc").issuer("https://evil.example").sign();

        assert_err!(verifier.verify(Some(&bearer(&token))).await);
    }

    #[tokio::test]
    async fn test_audience_checked_when_configured() {
        let server = jwks_server(1).await;
        let mut config = test_config().identity_provider;
        config.jwks_url = Some(format!("{}/.well-known/jwks.json", server.uri()));
        config.audience = "portal".to_string();
        let verifier = JwksVerifier::new(&config).unwrap();

        let good = TestToken::new("user_abc").audience("portal").sign();
        let bad = TestToken::new("user_abc").audience("other-app").sign();

        assert_ok!(verifier.verify(Some(&bearer(&good))).await);
        assert_err!(verifier.verify(Some(&bearer(&bad))).await);
    }

    #[tokio::test]
    async fn test_garbage_token_rejected_without_fetch() {
        let server = jwks_server(0).await;
        let verifier = verifier_for(&server);

        let result = verifier.verify(Some("Bearer not.a.jwt")).await;
        assert!(matches!(result, Err(VerifyError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_unknown_kid_refresh_is_rate_limited() {
        let server = jwks_server(1).await;
        let verifier = verifier_for(&server);
        let token = TestToken::new("user_abc").kid("rotated-key").sign();

        for _ in 0..5 {
            let result = verifier.verify(Some(&bearer(&token))).await;
            assert!(matches!(result, Err(VerifyError::InvalidToken(_))));
        }
    }

    #[tokio::test]
    async fn test_discovers_jwks_url_from_issuer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jwks_uri": format!("{}/keys", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_jwks(TEST_KID)))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config().identity_provider;
        config.issuer = server.uri();
        let verifier = JwksVerifier::new(&config).unwrap();
        let token = TestToken::new("user_abc").issuer(&server.uri()).sign();

        assert_ok!(verifier.verify(Some(&bearer(&token))).await);
    }

    #[tokio::test]
    async fn test_jwks_timeout_fails_closed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(test_jwks(TEST_KID))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let mut config = test_config().identity_provider;
        config.jwks_url = Some(format!("{}/.well-known/jwks.json", server.uri()));
        config.timeout_secs = 1;
        let verifier = JwksVerifier::new(&config).unwrap();
        let token = TestToken::new("user_abc").sign();

        let result = verifier.verify(Some(&bearer(&token))).await;
        assert!(matches!(result, Err(VerifyError::InvalidToken(_))));
    }
}

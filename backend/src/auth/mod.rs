//! Caller authentication: token verification and session resolution.

mod session;
mod verifier;

pub use session::{require_capability, require_identity, AuthError, CurrentIdentity, SessionResolver};
pub use verifier::{parse_bearer, JwksVerifier, TokenClaims, TokenVerifier, VerifiedToken, VerifyError};

//! Bearer token issuing and verification.
//!
//! Tokens are HS256 JWTs signed with the server-wide secret. Verification is
//! a pure function of the token and the secret, so one [`JwtAuthority`] is
//! shared by every connection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tivi_proto::validation::validate_identifier;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub iat: u64,
    pub exp: u64,
}

/// Verified identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    /// Set when the token was issued to an enrolled device.
    pub device_id: Option<String>,
    pub email: Option<String>,
}

impl Principal {
    pub fn controller(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: None,
            email: None,
        }
    }

    pub fn device(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: Some(device_id.into()),
            email: None,
        }
    }

    /// Routing identity: the device id for agents, the user id otherwise.
    pub fn identity(&self) -> &str {
        self.device_id.as_deref().unwrap_or(&self.user_id)
    }

    pub fn is_device(&self) -> bool {
        self.device_id.is_some()
    }

    /// Human-readable label used when no registered device name exists.
    pub fn label(&self) -> &str {
        self.email.as_deref().unwrap_or_else(|| self.identity())
    }
}

/// Why a credential was rejected. Callers facing the network must not
/// reveal which variant occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("token signature invalid")]
    SignatureInvalid,
}

impl AuthError {
    /// The single message shown to a rejected client.
    pub const REJECTION: &'static str = "invalid authentication";
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::SignatureInvalid,
            _ => AuthError::Malformed,
        }
    }
}

/// Seam between the connection gate and whatever checks credentials.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("token lifetime is out of range")]
    TtlOutOfRange,
}

/// Issues and verifies tokens with one shared secret.
#[derive(Clone)]
pub struct JwtAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for JwtAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthority").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl JwtAuthority {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn issue(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        email: Option<&str>,
    ) -> Result<IssuedToken, IssueError> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or(IssueError::TtlOutOfRange)?;
        let claims = Claims {
            user_id: user_id.to_string(),
            device_id: device_id.map(str::to_string),
            email: email.map(str::to_string),
            iat: now.timestamp().max(0) as u64,
            exp: expires_at.timestamp().max(0) as u64,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken { token, expires_at })
    }
}

impl CredentialVerifier for JwtAuthority {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Malformed);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
        let claims = data.claims;

        validate_identifier("userId", &claims.user_id).map_err(|_| AuthError::Malformed)?;
        if let Some(device_id) = &claims.device_id {
            validate_identifier("deviceId", device_id).map_err(|_| AuthError::Malformed)?;
        }

        Ok(Principal {
            user_id: claims.user_id,
            device_id: claims.device_id,
            email: claims.email,
        })
    }
}

pub fn extract_bearer_token(header: Option<&axum::http::HeaderValue>) -> Option<&str> {
    let header = header?;
    let header_str = header.to_str().ok()?;
    header_str.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECRET: &[u8] = b"unit-test-secret";

    fn authority() -> JwtAuthority {
        JwtAuthority::new(SECRET, Duration::from_secs(3600))
    }

    fn sign(claims: &Claims, alg: Algorithm, secret: &[u8]) -> String {
        jsonwebtoken::encode(&Header::new(alg), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn claims(exp_offset: i64) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            user_id: "user_1".into(),
            device_id: Some("device_1".into()),
            email: None,
            iat: (now - 10) as u64,
            exp: (now + exp_offset) as u64,
        }
    }

    #[test]
    fn issued_controller_token_verifies() {
        let auth = authority();
        let issued = auth.issue("user_1", None, Some("ops@example.com")).unwrap();
        let principal = auth.verify(&issued.token).unwrap();

        assert_eq!(principal.user_id, "user_1");
        assert!(!principal.is_device());
        assert_eq!(principal.identity(), "user_1");
        assert_eq!(principal.label(), "ops@example.com");
        assert!(issued.expires_at > Utc::now());
    }

    #[test]
    fn device_token_routes_by_device_id() {
        let auth = authority();
        let issued = auth.issue("user_1", Some("device_9"), None).unwrap();
        let principal = auth.verify(&issued.token).unwrap();
        assert_eq!(principal.identity(), "device_9");
        assert!(principal.is_device());
    }

    #[test]
    fn oversized_lifetime_is_an_error_not_a_panic() {
        let auth = JwtAuthority::new(SECRET, Duration::from_secs(u64::MAX));
        assert!(matches!(auth.issue("user_1", None, None), Err(IssueError::TtlOutOfRange)));
    }

    #[test]
    fn expired_token_rejected() {
        let token = sign(&claims(-3600), Algorithm::HS256, SECRET);
        assert_eq!(authority().verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = sign(&claims(3600), Algorithm::HS256, b"someone-else");
        assert_eq!(authority().verify(&token), Err(AuthError::SignatureInvalid));
    }

    #[test]
    fn unexpected_algorithm_rejected() {
        let token = sign(&claims(3600), Algorithm::HS512, SECRET);
        assert_eq!(authority().verify(&token), Err(AuthError::SignatureInvalid));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(authority().verify(""), Err(AuthError::Malformed));
        assert_eq!(authority().verify("not-a-jwt"), Err(AuthError::Malformed));
        assert_eq!(authority().verify("a.b.c"), Err(AuthError::Malformed));
    }

    #[test]
    fn blank_user_id_is_malformed() {
        let mut c = claims(3600);
        c.user_id = String::new();
        let token = sign(&c, Algorithm::HS256, SECRET);
        assert_eq!(authority().verify(&token), Err(AuthError::Malformed));
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let value = axum::http::HeaderValue::from_static("Bearer abc.def.ghi");
        assert_eq!(extract_bearer_token(Some(&value)), Some("abc.def.ghi"));
        let basic = axum::http::HeaderValue::from_static("Basic Zm9vOmJhcg==");
        assert_eq!(extract_bearer_token(Some(&basic)), None);
        assert_eq!(extract_bearer_token(None), None);
    }

    proptest! {
        #[test]
        fn arbitrary_strings_never_verify(token in ".{0,256}") {
            prop_assert!(authority().verify(&token).is_err());
        }
    }
}

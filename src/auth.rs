//! Caller authentication: bearer extraction and signed capability tokens.
//!
//! Callers present an HS256-signed JWT minted by a trusted issuer that shares a secret with the
//! gateway. Verification (signature, expiry, not-before) and decoding into [`TokenClaims`] are
//! two separate steps, and both must succeed.
use crate::errors::GatewayError;
use axum::http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A string that must never be printed, e.g. the upstream API key or the token signing secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header.
///
/// The scheme word itself is not checked; the token is whatever follows the first space.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, GatewayError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(GatewayError::MissingCredential("Missing `Authorization` header"))?;

    value
        .to_str()
        .ok()
        .and_then(|v| v.split(' ').nth(1))
        .filter(|token| !token.is_empty())
        .ok_or(GatewayError::MissingCredential("Missing token"))
}

/// The payload of a verified token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Identifies the caller. Required and non-empty; a non-string `sub` does not decode.
    #[serde(rename = "sub", default)]
    pub subject: Option<String>,
    /// Expiry as a NumericDate. The token is expired from this second on.
    #[serde(
        default,
        deserialize_with = "numeric_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub exp: Option<f64>,
    #[serde(
        default,
        deserialize_with = "numeric_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub nbf: Option<f64>,
    /// Route paths the token may be used on. `None` leaves every allow-listed route open.
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub permitted_routes: Option<Vec<String>>,
    /// The only model the token may request. `None` leaves every model open.
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub permitted_model: Option<String>,
}

// Absent is fine, but a present `exp`/`nbf` must be a number (not a string, not null).
fn numeric_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    f64::deserialize(deserializer).map(Some)
}

/// Claims that have passed verification and carry a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims {
    pub subject: String,
    pub permitted_routes: Option<Vec<String>>,
    pub permitted_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationFailure {
    /// Bad signature, expired or not-yet-valid token, or a payload that cannot be decoded.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("token has no subject")]
    MissingSubject,
}

impl From<VerificationFailure> for GatewayError {
    fn from(failure: VerificationFailure) -> Self {
        match failure {
            VerificationFailure::InvalidSignature(reason) => GatewayError::InvalidToken(reason),
            VerificationFailure::MissingSubject => GatewayError::InvalidSubject,
        }
    }
}

/// Verifies tokens against the shared signing secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("key", &"[redacted]")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

impl TokenVerifier {
    pub fn new(secret: &Secret) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` and `nbf` are enforced when present but not mandatory.
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            key: DecodingKey::from_secret(secret.expose().as_bytes()),
            validation,
        }
    }

    /// Establish trust in `token`, then decode its claims.
    pub fn verify(&self, token: &str) -> Result<VerifiedClaims, VerificationFailure> {
        let payload = jsonwebtoken::decode::<serde_json::Value>(token, &self.key, &self.validation)
            .map_err(|e| VerificationFailure::InvalidSignature(e.to_string()))?
            .claims;

        let claims: TokenClaims = serde_json::from_value(payload).map_err(|e| {
            VerificationFailure::InvalidSignature(format!("undecodable claims: {e}"))
        })?;

        // The library only rejects `exp < now`; the token is already dead at `exp == now`.
        if let Some(exp) = claims.exp
            && exp <= jsonwebtoken::get_current_timestamp() as f64
        {
            return Err(VerificationFailure::InvalidSignature(
                "ExpiredSignature".to_string(),
            ));
        }

        let subject = claims
            .subject
            .filter(|sub| !sub.is_empty())
            .ok_or(VerificationFailure::MissingSubject)?;

        Ok(VerifiedClaims {
            subject,
            permitted_routes: claims.permitted_routes,
            permitted_model: claims.permitted_model,
        })
    }
}

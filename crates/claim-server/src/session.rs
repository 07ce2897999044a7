//! Short-lived HS256 session tokens issued after email verification.

use crate::error::{ClaimError, ClaimResult};
use crate::secrets::EmailIdentifier;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// A verified session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identifier: EmailIdentifier,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies bearer tokens `{sub: identifier, iat, exp}`
pub struct SessionTokenService {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for SessionTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokenService")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionTokenService {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl,
        }
    }

    pub fn issue(&self, identifier: &EmailIdentifier) -> ClaimResult<String> {
        self.issue_at(identifier, Utc::now())
    }

    fn issue_at(&self, identifier: &EmailIdentifier, now: DateTime<Utc>) -> ClaimResult<String> {
        let header = Header {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let claims = Claims {
            sub: identifier.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        let header_json = serde_json::to_vec(&header)
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Failed to serialize JWT header: {}", e)))?;
        let claims_json = serde_json::to_vec(&claims)
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Failed to serialize JWT claims: {}", e)))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );
        let signature = self.mac(&signing_input)?.finalize().into_bytes();

        Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Verify signature and expiry. Every failure is `Unauthorized`.
    pub fn verify(&self, token: &str) -> ClaimResult<Session> {
        self.verify_at(token, Utc::now()).map_err(|reason| {
            debug!("Session rejected: {}", reason);
            ClaimError::Unauthorized
        })
    }

    fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Session, String> {
        let parts: Vec<&str> = token.trim().split('.').collect();
        let [header_b64, claims_b64, signature_b64] = parts.as_slice() else {
            return Err("malformed token".to_string());
        };

        let header: Header = decode_part(header_b64)?;
        if header.alg != "HS256" || !header.typ.eq_ignore_ascii_case("JWT") {
            return Err(format!("unsupported header {}/{}", header.alg, header.typ));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| format!("invalid signature encoding: {}", e))?;
        self.mac(&format!("{}.{}", header_b64, claims_b64))
            .map_err(|e| e.to_string())?
            .verify_slice(&signature)
            .map_err(|_| "bad signature".to_string())?;

        let claims: Claims = decode_part(claims_b64)?;
        let issued_at = timestamp(claims.iat)?;
        let expires_at = timestamp(claims.exp)?;
        if now >= expires_at {
            return Err("expired".to_string());
        }
        if claims.sub.is_empty() {
            return Err("empty subject".to_string());
        }

        Ok(Session {
            identifier: EmailIdentifier::from_hex(claims.sub),
            issued_at,
            expires_at,
        })
    }

    fn mac(&self, signing_input: &str) -> ClaimResult<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Invalid HMAC key: {}", e)))?;
        mac.update(signing_input.as_bytes());
        Ok(mac)
    }
}

fn decode_part<T: serde::de::DeserializeOwned>(part: &str) -> Result<T, String> {
    let raw = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| format!("invalid base64url: {}", e))?;
    serde_json::from_slice(&raw).map_err(|e| format!("invalid JSON: {}", e))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, String> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| format!("invalid timestamp {}", secs))
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

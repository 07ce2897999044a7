//! Secret derivation over the server pepper: email identifiers, code hashes and PII encryption.

use crate::error::{ClaimError, ClaimResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const PII_KEY_CONTEXT: &[u8] = b"claim-server/pii-encryption/v1";
const CODE_HASH_CONTEXT: &str = "otp:";
const NONCE_LEN: usize = 12;

/// One-way identifier derived from a normalized email. Primary key for all claim state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmailIdentifier(String);

impl EmailIdentifier {
    /// Wrap an already-derived hex identifier (e.g. a session subject).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EmailIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix keeps logs correlatable without printing the full key
        let prefix: String = self.0.chars().take(12).collect();
        write!(f, "{}…", prefix)
    }
}

/// Lowercase and trim an email address.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Keys derived from the shared server pepper
pub struct Secrets {
    pepper: Vec<u8>,
    pii_key: [u8; 32],
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

impl Secrets {
    pub fn new(pepper: &str) -> ClaimResult<Self> {
        if pepper.is_empty() {
            return Err(ClaimError::Internal(anyhow::anyhow!("Pepper must not be empty")));
        }

        let pepper = pepper.as_bytes().to_vec();
        let mut pii_key = [0u8; 32];
        pii_key.copy_from_slice(&hmac_bytes(&pepper, PII_KEY_CONTEXT)?);

        Ok(Self { pepper, pii_key })
    }

    /// Derive the identifier for an email. Normalizes first, so case and surrounding
    /// whitespace never change the result.
    pub fn email_identifier(&self, email: &str) -> ClaimResult<EmailIdentifier> {
        let normalized = normalize_email(email);
        Ok(EmailIdentifier(hex::encode(hmac_bytes(
            &self.pepper,
            normalized.as_bytes(),
        )?)))
    }

    /// Hash a one-time code for storage.
    pub fn hash_code(&self, code: &str) -> ClaimResult<String> {
        let input = format!("{}{}", CODE_HASH_CONTEXT, code);
        Ok(hex::encode(hmac_bytes(&self.pepper, input.as_bytes())?))
    }

    /// Encrypt PII with AES-256-GCM. Output is `hex(nonce):hex(ciphertext)`.
    pub fn encrypt_pii(&self, plaintext: &str) -> ClaimResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.pii_key)
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Failed to create cipher: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Encryption failed: {}", e)))?;

        Ok(format!("{}:{}", hex::encode(nonce_bytes), hex::encode(ciphertext)))
    }

    /// Decrypt a value produced by [`Secrets::encrypt_pii`].
    pub fn decrypt_pii(&self, encrypted: &str) -> ClaimResult<String> {
        let (nonce_hex, ciphertext_hex) = encrypted.split_once(':').ok_or_else(|| {
            ClaimError::Internal(anyhow::anyhow!("Invalid encrypted data format"))
        })?;

        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(ClaimError::Internal(anyhow::anyhow!("Invalid nonce length")));
        }
        let ciphertext = hex::decode(ciphertext_hex).map_err(|e| {
            ClaimError::Internal(anyhow::anyhow!("Invalid ciphertext encoding: {}", e))
        })?;

        let cipher = Aes256Gcm::new_from_slice(&self.pii_key)
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Failed to create cipher: {}", e)))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Decrypted data is not UTF-8: {}", e)))
    }
}

/// Constant-time string comparison.
pub fn safe_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Uniformly random 6-digit code.
pub fn generate_code() -> String {
    format!("{:06}", OsRng.gen_range(0..1_000_000u32))
}

/// 32 random bytes, hex encoded.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> ClaimResult<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

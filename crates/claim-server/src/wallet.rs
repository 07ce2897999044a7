//! Wallet ownership proof: nonce challenge plus SIWE signature verification.

use crate::config::ClaimConfig;
use crate::error::{ClaimError, ClaimResult};
use crate::eth::validate_address;
use crate::model::SiweNonce;
use crate::secrets::{generate_nonce, safe_eq, EmailIdentifier};
use crate::siwe::{recover_signer, SiweMessage};
use crate::store::{BindingChange, ClaimStore};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Message the wallet must sign, plus the nonce embedded in it
#[derive(Debug, Clone, Serialize)]
pub struct WalletChallenge {
    pub message: String,
    pub nonce: String,
}

pub struct WalletProofService {
    store: Arc<dyn ClaimStore>,
    domain: String,
    uri: String,
    chain_id: u64,
    statement: String,
    nonce_ttl: Duration,
}

impl WalletProofService {
    pub fn new(config: &ClaimConfig, store: Arc<dyn ClaimStore>) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            domain: config.siwe_domain()?,
            uri: config.http.app_url.trim_end_matches('/').to_string(),
            chain_id: config.ethereum.chain_id,
            statement: format!(
                "Sign to confirm you own this wallet and authorize the {} claim.",
                config.token.symbol
            ),
            nonce_ttl: Duration::minutes(config.security.nonce_ttl_minutes as i64),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub async fn issue_challenge(&self, identifier: &EmailIdentifier, address: &str) -> ClaimResult<WalletChallenge> {
        self.issue_challenge_at(identifier, address, Utc::now()).await
    }

    async fn issue_challenge_at(
        &self,
        identifier: &EmailIdentifier,
        address: &str,
        now: DateTime<Utc>,
    ) -> ClaimResult<WalletChallenge> {
        let address = validate_address(address)?;
        let nonce = generate_nonce();

        self.store
            .upsert_nonce(SiweNonce {
                identifier: identifier.clone(),
                nonce: nonce.clone(),
                issued_at: now,
                consumed: false,
            })
            .await?;

        let message = SiweMessage {
            domain: self.domain.clone(),
            address,
            statement: Some(self.statement.clone()),
            uri: self.uri.clone(),
            version: "1".to_string(),
            chain_id: self.chain_id,
            nonce: nonce.clone(),
            issued_at: now,
            expiration_time: Some(now + self.nonce_ttl),
            not_before: None,
            request_id: None,
            resources: Vec::new(),
        };

        debug!("Issued wallet challenge for {} ({})", identifier, address);
        Ok(WalletChallenge {
            message: message.to_string(),
            nonce,
        })
    }

    /// Verify a signed challenge and bind the address to the identifier.
    pub async fn submit_proof(
        &self,
        identifier: &EmailIdentifier,
        address: &str,
        signature: &str,
        message: &str,
    ) -> ClaimResult<BindingChange> {
        let address = validate_address(address)?;
        let now = Utc::now();

        let record = self
            .store
            .nonce(identifier)
            .await?
            .ok_or(ClaimError::NonceNotFound)?;
        if record.consumed {
            return Err(ClaimError::NonceConsumed);
        }
        if now - record.issued_at > self.nonce_ttl {
            self.store.delete_nonce(identifier).await?;
            return Err(ClaimError::NonceExpired);
        }

        let parsed: SiweMessage = message.parse()?;
        if parsed.address != address {
            return Err(ClaimError::InvalidSignature("Address mismatch".to_string()));
        }
        if !safe_eq(&parsed.nonce, &record.nonce) {
            return Err(ClaimError::InvalidSignature("Nonce mismatch".to_string()));
        }
        if parsed.domain != self.domain {
            return Err(ClaimError::InvalidSignature("Domain mismatch".to_string()));
        }
        if parsed.chain_id != self.chain_id {
            return Err(ClaimError::InvalidSignature("Chain mismatch".to_string()));
        }
        if !parsed.is_valid_at(now) {
            return Err(ClaimError::InvalidSignature("Message expired".to_string()));
        }

        let signer = recover_signer(message, signature)?;
        if signer != address {
            debug!("Signature for {} recovered to {}", address, signer);
            return Err(ClaimError::InvalidSignature(
                "Signature does not match address".to_string(),
            ));
        }

        if !self.store.consume_nonce(identifier, &record.nonce).await? {
            return Err(ClaimError::NonceConsumed);
        }

        let change = self
            .store
            .upsert_binding(identifier, &address.to_string())
            .await?;
        match &change {
            BindingChange::Created => info!("Bound {} to {}", identifier, address),
            BindingChange::Rebound { previous } => {
                info!("Re-bound {} from {} to {}", identifier, previous, address)
            }
            BindingChange::Refreshed => debug!("Refreshed binding {} -> {}", identifier, address),
        }
        Ok(change)
    }
}

//! Persisted records. Amounts and identifiers are stored as strings so no backend loses precision.

use crate::error::ClaimResult;
use crate::secrets::EmailIdentifier;
use crate::units::{format_amount, parse_minor};
use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier → encrypted raw email, kept only for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailLookup {
    pub identifier: EmailIdentifier,
    pub email_encrypted: String,
    pub updated_at: DateTime<Utc>,
}

/// The single live one-time code for an identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimeCode {
    pub identifier: EmailIdentifier,
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub used: bool,
}

impl OneTimeCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// An entitlement of tokens owed to an identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub identifier: EmailIdentifier,
    /// Minor units, decimal string
    pub amount_minor: String,
    pub decimals: u8,
    pub token_contract: String,
    pub chain: String,
    pub claimed: bool,
    pub claimed_tx_hash: Option<String>,
    /// Submitted transfer whose outcome has not been observed yet. While set, the row is
    /// closed to accumulation.
    pub pending_transfer: Option<PendingTransfer>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Allocation {
    pub fn amount(&self) -> ClaimResult<U256> {
        parse_minor(&self.amount_minor)
    }

    /// Unclaimed with no transfer in flight: the row uploads add to.
    pub fn is_open(&self) -> bool {
        !self.claimed && self.pending_transfer.is_none()
    }
}

/// What was actually sent for an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransfer {
    pub tx_hash: String,
    /// Checksummed recipient address
    pub recipient: String,
    /// Minor units, decimal string
    pub amount_minor: String,
}

impl PendingTransfer {
    pub fn amount(&self) -> ClaimResult<U256> {
        parse_minor(&self.amount_minor)
    }
}

/// Wallet challenge nonce for an identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiweNonce {
    pub identifier: EmailIdentifier,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub consumed: bool,
}

/// Wallet address proven by signature for an identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub identifier: EmailIdentifier,
    /// Lowercase 0x-prefixed hex
    pub wallet_address: String,
    pub updated_at: DateTime<Utc>,
}

/// Administrative action record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: String,
    pub actor: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Admin-tunable gas limits, overriding configuration once set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GasSettings {
    pub max_gas_limit: u64,
    /// Wei, decimal string
    pub max_gas_cost_wei: String,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Allocation as shown to the claimant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationView {
    pub amount: String,
    pub symbol: String,
    pub decimals: u8,
    pub chain: String,
    pub claimed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl AllocationView {
    pub fn from_allocation(allocation: &Allocation, symbol: &str) -> ClaimResult<Self> {
        Ok(Self {
            amount: format_amount(allocation.amount()?, allocation.decimals),
            symbol: symbol.to_string(),
            decimals: allocation.decimals,
            chain: allocation.chain.clone(),
            claimed: allocation.claimed,
            tx_hash: allocation.claimed_tx_hash.clone(),
            date: allocation.claimed.then_some(allocation.updated_at),
        })
    }
}

/// Current allocation plus claimed history, newest first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimStatus {
    pub allocation: AllocationView,
    pub history: Vec<AllocationView>,
}

impl ClaimStatus {
    /// Build from rows ordered newest first. The first unclaimed row wins; otherwise the
    /// newest (claimed) row is shown for history display. `None` when there are no rows.
    pub fn from_rows(rows: &[Allocation], symbol: &str) -> ClaimResult<Option<Self>> {
        let Some(current) = rows.iter().find(|a| !a.claimed).or_else(|| rows.first()) else {
            return Ok(None);
        };

        let history = rows
            .iter()
            .filter(|a| a.claimed)
            .map(|a| AllocationView::from_allocation(a, symbol))
            .collect::<ClaimResult<Vec<_>>>()?;

        Ok(Some(Self {
            allocation: AllocationView::from_allocation(current, symbol)?,
            history,
        }))
    }
}

#[cfg(test)]
pub(crate) fn test_allocation(identifier: &EmailIdentifier, amount_minor: &str, claimed: bool) -> Allocation {
    let now = Utc::now();
    Allocation {
        id: Uuid::new_v4(),
        identifier: identifier.clone(),
        amount_minor: amount_minor.to_string(),
        decimals: 18,
        token_contract: "0x2e105875765e46d93A301A9FE0e81d98d070200e".to_string(),
        chain: "ethereum".to_string(),
        claimed,
        claimed_tx_hash: claimed.then(|| format!("0x{}", "ab".repeat(32))),
        pending_transfer: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_code_expiry() {
        let now = Utc::now();
        let code = OneTimeCode {
            identifier: EmailIdentifier::from_hex("ab"),
            code_hash: "hash".to_string(),
            expires_at: now + Duration::minutes(15),
            attempts: 0,
            used: false,
        };
        assert!(!code.is_expired(now));
        assert!(code.is_expired(now + Duration::minutes(16)));
    }

    #[test]
    fn test_view_formats_minor_units() {
        let id = EmailIdentifier::from_hex("ab");
        let allocation = test_allocation(&id, "1500000000000000000", false);
        let view = AllocationView::from_allocation(&allocation, "GOC").unwrap();

        assert_eq!(view.amount, "1.5");
        assert_eq!(view.symbol, "GOC");
        assert!(!view.claimed);
        assert!(view.tx_hash.is_none());
        assert!(view.date.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("txHash").is_none());
    }

    #[test]
    fn test_status_prefers_unclaimed_row() {
        let id = EmailIdentifier::from_hex("ab");
        let rows = vec![
            test_allocation(&id, "50000000000000000000", false),
            test_allocation(&id, "100000000000000000000", true),
        ];
        let status = ClaimStatus::from_rows(&rows, "GOC").unwrap().unwrap();

        assert_eq!(status.allocation.amount, "50");
        assert!(!status.allocation.claimed);
        assert_eq!(status.history.len(), 1);
        assert_eq!(status.history[0].amount, "100");
        assert!(status.history[0].tx_hash.is_some());
    }

    #[test]
    fn test_status_falls_back_to_newest_claimed() {
        let id = EmailIdentifier::from_hex("ab");
        let rows = vec![
            test_allocation(&id, "2000000000000000000", true),
            test_allocation(&id, "1000000000000000000", true),
        ];
        let status = ClaimStatus::from_rows(&rows, "GOC").unwrap().unwrap();

        assert_eq!(status.allocation.amount, "2");
        assert!(status.allocation.claimed);
        assert_eq!(status.history.len(), 2);

        assert!(ClaimStatus::from_rows(&[], "GOC").unwrap().is_none());
    }
}

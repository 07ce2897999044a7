//! Transactional key-value store for claim state.
//!
//! Every mutation that the services race on is expressed as an explicit compare-and-set with
//! documented pre/post-conditions, so a relational backend can map each one onto a single
//! conditional `UPDATE` (or `SELECT ... FOR UPDATE` transaction).

use crate::error::{ClaimError, ClaimResult};
use crate::model::{
    Allocation, AuditEntry, Binding, EmailLookup, GasSettings, OneTimeCode, PendingTransfer, SiweNonce,
};
use crate::secrets::{safe_eq, EmailIdentifier};
use alloy::primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

const GAS_SETTINGS_KEY: &str = "default";

/// Token metadata stamped onto freshly created allocation rows
#[derive(Debug, Clone)]
pub struct NewAllocation {
    pub decimals: u8,
    pub token_contract: String,
    pub chain: String,
}

/// Outcome of [`ClaimStore::accumulate_allocation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accumulation {
    /// No open row existed; a new one was created.
    Inserted { id: Uuid, amount: U256 },
    /// Added to the existing open row.
    Accumulated { id: Uuid, previous: U256, total: U256 },
}

/// Outcome of [`ClaimStore::mark_claimed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkClaimed {
    /// This call flipped `claimed` from false to true.
    Marked,
    /// Another writer got there first; carries the hash it recorded.
    AlreadyClaimed { tx_hash: Option<String> },
}

/// Outcome of [`ClaimStore::upsert_binding`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingChange {
    Created,
    Rebound { previous: String },
    Refreshed,
}

/// Aggregate allocation figures for the admin dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub total_allocations: usize,
    pub claimed_allocations: usize,
    pub total_minor: U256,
    pub claimed_minor: U256,
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn upsert_email_lookup(&self, identifier: &EmailIdentifier, email_encrypted: String) -> ClaimResult<()>;

    async fn email_lookup(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<EmailLookup>>;

    /// Insert or replace the identifier's code. Any previous code stops verifying.
    async fn upsert_code(&self, record: OneTimeCode) -> ClaimResult<()>;

    async fn code(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<OneTimeCode>>;

    /// Atomically increment `attempts`. Returns the new count, or `None` if no record exists.
    async fn increment_code_attempts(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<u32>>;

    /// Compare-and-set `used: false -> true`.
    ///
    /// Pre: a record exists whose `code_hash` equals `code_hash` and `used == false`.
    /// Post: returns `true` iff this call performed the flip; otherwise nothing changes.
    async fn mark_code_used(&self, identifier: &EmailIdentifier, code_hash: &str) -> ClaimResult<bool>;

    async fn delete_code(&self, identifier: &EmailIdentifier) -> ClaimResult<()>;

    /// Remove codes expired at `now`. Returns the number removed.
    async fn purge_expired_codes(&self, now: DateTime<Utc>) -> ClaimResult<usize>;

    /// Insert or replace the identifier's nonce (resets `consumed`).
    async fn upsert_nonce(&self, record: SiweNonce) -> ClaimResult<()>;

    async fn nonce(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<SiweNonce>>;

    /// Compare-and-set `consumed: false -> true`.
    ///
    /// Pre: the stored nonce equals `nonce` and is not consumed.
    /// Post: returns `true` iff this call consumed it.
    async fn consume_nonce(&self, identifier: &EmailIdentifier, nonce: &str) -> ClaimResult<bool>;

    async fn delete_nonce(&self, identifier: &EmailIdentifier) -> ClaimResult<()>;

    /// Remove nonces issued before `issued_before`. Returns the number removed.
    async fn purge_stale_nonces(&self, issued_before: DateTime<Utc>) -> ClaimResult<usize>;

    /// Create the binding, re-bind it to a different address, or refresh its timestamp.
    async fn upsert_binding(&self, identifier: &EmailIdentifier, wallet_address: &str) -> ClaimResult<BindingChange>;

    async fn binding(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<Binding>>;

    /// All rows for the identifier, newest first.
    async fn allocations(&self, identifier: &EmailIdentifier) -> ClaimResult<Vec<Allocation>>;

    /// Atomically add `amount` to the identifier's open row, or create one.
    ///
    /// Post: at most one open row exists for the identifier. Claimed rows and rows with a
    /// transfer in flight are untouched.
    async fn accumulate_allocation(
        &self,
        identifier: &EmailIdentifier,
        amount: U256,
        template: &NewAllocation,
    ) -> ClaimResult<Accumulation>;

    /// Record (or clear, with `None`) the in-flight transfer on an unclaimed row. A recorded
    /// transfer closes the row to accumulation.
    async fn set_pending_transfer(
        &self,
        identifier: &EmailIdentifier,
        allocation_id: Uuid,
        transfer: Option<PendingTransfer>,
    ) -> ClaimResult<()>;

    /// Compare-and-set `claimed: false -> true` with the transfer hash and the amount sent.
    ///
    /// Pre: the row exists. Post: `Marked` iff this call flipped the flag, and the claimed row
    /// holds exactly `transferred`. Anything added to the row beyond that moves to the open
    /// row (created if needed). A row that was already claimed is left untouched and its
    /// stored hash is returned.
    async fn mark_claimed(
        &self,
        identifier: &EmailIdentifier,
        allocation_id: Uuid,
        tx_hash: &str,
        transferred: U256,
    ) -> ClaimResult<MarkClaimed>;

    async fn allocation_stats(&self) -> ClaimResult<AllocationStats>;

    async fn append_audit(&self, entry: AuditEntry) -> ClaimResult<()>;

    /// Audit entries, oldest first.
    async fn audit_log(&self) -> ClaimResult<Vec<AuditEntry>>;

    async fn gas_settings(&self) -> ClaimResult<Option<GasSettings>>;

    async fn put_gas_settings(&self, settings: GasSettings) -> ClaimResult<()>;
}

/// In-memory store. Each identifier's rows live behind one DashMap shard lock, which makes
/// every per-identifier operation atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    lookups: DashMap<EmailIdentifier, EmailLookup>,
    codes: DashMap<EmailIdentifier, OneTimeCode>,
    nonces: DashMap<EmailIdentifier, SiweNonce>,
    bindings: DashMap<EmailIdentifier, Binding>,
    /// Insertion order is chronological
    allocations: DashMap<EmailIdentifier, Vec<Allocation>>,
    audit: DashMap<Uuid, AuditEntry>,
    gas_settings: DashMap<&'static str, GasSettings>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing_row(allocation_id: Uuid) -> ClaimError {
    ClaimError::Storage(format!("Allocation {} not found", allocation_id))
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn upsert_email_lookup(&self, identifier: &EmailIdentifier, email_encrypted: String) -> ClaimResult<()> {
        self.lookups.insert(
            identifier.clone(),
            EmailLookup {
                identifier: identifier.clone(),
                email_encrypted,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn email_lookup(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<EmailLookup>> {
        Ok(self.lookups.get(identifier).map(|entry| entry.clone()))
    }

    async fn upsert_code(&self, record: OneTimeCode) -> ClaimResult<()> {
        self.codes.insert(record.identifier.clone(), record);
        Ok(())
    }

    async fn code(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<OneTimeCode>> {
        Ok(self.codes.get(identifier).map(|entry| entry.clone()))
    }

    async fn increment_code_attempts(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<u32>> {
        Ok(self.codes.get_mut(identifier).map(|mut entry| {
            entry.attempts += 1;
            entry.attempts
        }))
    }

    async fn mark_code_used(&self, identifier: &EmailIdentifier, code_hash: &str) -> ClaimResult<bool> {
        let Some(mut entry) = self.codes.get_mut(identifier) else {
            return Ok(false);
        };
        if entry.used || !safe_eq(&entry.code_hash, code_hash) {
            return Ok(false);
        }
        entry.used = true;
        Ok(true)
    }

    async fn delete_code(&self, identifier: &EmailIdentifier) -> ClaimResult<()> {
        self.codes.remove(identifier);
        Ok(())
    }

    async fn purge_expired_codes(&self, now: DateTime<Utc>) -> ClaimResult<usize> {
        let before = self.codes.len();
        self.codes.retain(|_, code| !code.is_expired(now));
        Ok(before.saturating_sub(self.codes.len()))
    }

    async fn upsert_nonce(&self, record: SiweNonce) -> ClaimResult<()> {
        self.nonces.insert(record.identifier.clone(), record);
        Ok(())
    }

    async fn nonce(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<SiweNonce>> {
        Ok(self.nonces.get(identifier).map(|entry| entry.clone()))
    }

    async fn consume_nonce(&self, identifier: &EmailIdentifier, nonce: &str) -> ClaimResult<bool> {
        let Some(mut entry) = self.nonces.get_mut(identifier) else {
            return Ok(false);
        };
        if entry.consumed || !safe_eq(&entry.nonce, nonce) {
            return Ok(false);
        }
        entry.consumed = true;
        Ok(true)
    }

    async fn delete_nonce(&self, identifier: &EmailIdentifier) -> ClaimResult<()> {
        self.nonces.remove(identifier);
        Ok(())
    }

    async fn purge_stale_nonces(&self, issued_before: DateTime<Utc>) -> ClaimResult<usize> {
        let before = self.nonces.len();
        self.nonces.retain(|_, nonce| nonce.issued_at >= issued_before);
        Ok(before.saturating_sub(self.nonces.len()))
    }

    async fn upsert_binding(&self, identifier: &EmailIdentifier, wallet_address: &str) -> ClaimResult<BindingChange> {
        let wallet_address = wallet_address.to_lowercase();
        let now = Utc::now();

        let mut entry = self.bindings.entry(identifier.clone()).or_insert_with(|| Binding {
            identifier: identifier.clone(),
            wallet_address: String::new(),
            updated_at: now,
        });

        let change = if entry.wallet_address.is_empty() {
            BindingChange::Created
        } else if entry.wallet_address != wallet_address {
            BindingChange::Rebound {
                previous: entry.wallet_address.clone(),
            }
        } else {
            BindingChange::Refreshed
        };

        entry.wallet_address = wallet_address;
        entry.updated_at = now;
        Ok(change)
    }

    async fn binding(&self, identifier: &EmailIdentifier) -> ClaimResult<Option<Binding>> {
        Ok(self.bindings.get(identifier).map(|entry| entry.clone()))
    }

    async fn allocations(&self, identifier: &EmailIdentifier) -> ClaimResult<Vec<Allocation>> {
        Ok(self
            .allocations
            .get(identifier)
            .map(|rows| rows.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn accumulate_allocation(
        &self,
        identifier: &EmailIdentifier,
        amount: U256,
        template: &NewAllocation,
    ) -> ClaimResult<Accumulation> {
        let now = Utc::now();
        let mut rows = self.allocations.entry(identifier.clone()).or_default();

        if let Some(row) = rows.iter_mut().find(|row| row.is_open()) {
            let previous = row.amount()?;
            let total = previous
                .checked_add(amount)
                .ok_or_else(|| ClaimError::InvalidAmount("accumulated amount overflows".to_string()))?;
            row.amount_minor = total.to_string();
            row.updated_at = now;
            debug!("Accumulated allocation {} for {}: {} + {} = {}", row.id, identifier, previous, amount, total);
            return Ok(Accumulation::Accumulated {
                id: row.id,
                previous,
                total,
            });
        }

        let id = Uuid::new_v4();
        rows.push(Allocation {
            id,
            identifier: identifier.clone(),
            amount_minor: amount.to_string(),
            decimals: template.decimals,
            token_contract: template.token_contract.clone(),
            chain: template.chain.clone(),
            claimed: false,
            claimed_tx_hash: None,
            pending_transfer: None,
            created_at: now,
            updated_at: now,
        });
        debug!("Created allocation {} for {}: {}", id, identifier, amount);
        Ok(Accumulation::Inserted { id, amount })
    }

    async fn set_pending_transfer(
        &self,
        identifier: &EmailIdentifier,
        allocation_id: Uuid,
        transfer: Option<PendingTransfer>,
    ) -> ClaimResult<()> {
        let mut rows = self
            .allocations
            .get_mut(identifier)
            .ok_or_else(|| missing_row(allocation_id))?;
        let index = rows
            .iter()
            .position(|row| row.id == allocation_id)
            .ok_or_else(|| missing_row(allocation_id))?;

        if rows[index].claimed {
            return Err(ClaimError::Storage(format!(
                "Allocation {} is already claimed",
                allocation_id
            )));
        }
        let now = Utc::now();
        let reopened = transfer.is_none();
        rows[index].pending_transfer = transfer;
        rows[index].updated_at = now;

        // A reopened row absorbs the row uploads opened while it was in flight
        if reopened {
            if let Some(other) = rows.iter().position(|row| row.id != allocation_id && row.is_open()) {
                if let Some(total) = rows[index].amount()?.checked_add(rows[other].amount()?) {
                    rows[index].amount_minor = total.to_string();
                    rows.remove(other);
                }
            }
        }
        Ok(())
    }

    async fn mark_claimed(
        &self,
        identifier: &EmailIdentifier,
        allocation_id: Uuid,
        tx_hash: &str,
        transferred: U256,
    ) -> ClaimResult<MarkClaimed> {
        let mut rows = self
            .allocations
            .get_mut(identifier)
            .ok_or_else(|| missing_row(allocation_id))?;
        let index = rows
            .iter()
            .position(|row| row.id == allocation_id)
            .ok_or_else(|| missing_row(allocation_id))?;

        if rows[index].claimed {
            return Ok(MarkClaimed::AlreadyClaimed {
                tx_hash: rows[index].claimed_tx_hash.clone(),
            });
        }

        let now = Utc::now();
        let held = rows[index].amount()?;
        if held > transferred {
            let excess = held - transferred;
            let merged = match rows.iter_mut().find(|row| row.id != allocation_id && row.is_open()) {
                Some(open) => match open.amount()?.checked_add(excess) {
                    Some(total) => {
                        open.amount_minor = total.to_string();
                        open.updated_at = now;
                        true
                    }
                    None => false,
                },
                None => false,
            };
            if !merged {
                let carried = Allocation {
                    id: Uuid::new_v4(),
                    amount_minor: excess.to_string(),
                    claimed: false,
                    claimed_tx_hash: None,
                    pending_transfer: None,
                    created_at: now,
                    updated_at: now,
                    ..rows[index].clone()
                };
                rows.push(carried);
            }
            debug!(
                "Allocation {} grew to {} while {} was in flight; {} carried over for {}",
                allocation_id, held, transferred, excess, identifier
            );
            rows[index].amount_minor = transferred.to_string();
        }

        let row = &mut rows[index];
        row.claimed = true;
        row.claimed_tx_hash = Some(tx_hash.to_string());
        row.pending_transfer = None;
        row.updated_at = now;
        Ok(MarkClaimed::Marked)
    }

    async fn allocation_stats(&self) -> ClaimResult<AllocationStats> {
        let mut stats = AllocationStats::default();
        for rows in self.allocations.iter() {
            for row in rows.iter() {
                let amount = row.amount()?;
                stats.total_allocations += 1;
                stats.total_minor = stats.total_minor.saturating_add(amount);
                if row.claimed {
                    stats.claimed_allocations += 1;
                    stats.claimed_minor = stats.claimed_minor.saturating_add(amount);
                }
            }
        }
        Ok(stats)
    }

    async fn append_audit(&self, entry: AuditEntry) -> ClaimResult<()> {
        self.audit.insert(entry.id, entry);
        Ok(())
    }

    async fn audit_log(&self) -> ClaimResult<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self.audit.iter().map(|entry| entry.clone()).collect();
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    async fn gas_settings(&self) -> ClaimResult<Option<GasSettings>> {
        Ok(self.gas_settings.get(GAS_SETTINGS_KEY).map(|entry| entry.clone()))
    }

    async fn put_gas_settings(&self, settings: GasSettings) -> ClaimResult<()> {
        self.gas_settings.insert(GAS_SETTINGS_KEY, settings);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_allocation;
    use chrono::Duration;
    use std::sync::Arc;

    fn id(tag: &str) -> EmailIdentifier {
        EmailIdentifier::from_hex(format!("{:0>64}", tag))
    }

    fn template() -> NewAllocation {
        NewAllocation {
            decimals: 18,
            token_contract: "0x2e105875765e46d93A301A9FE0e81d98d070200e".to_string(),
            chain: "ethereum".to_string(),
        }
    }

    fn transfer(tx_hash: &str, amount: u64) -> PendingTransfer {
        PendingTransfer {
            tx_hash: tx_hash.to_string(),
            recipient: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".to_string(),
            amount_minor: amount.to_string(),
        }
    }

    fn code(identifier: &EmailIdentifier, hash: &str) -> OneTimeCode {
        OneTimeCode {
            identifier: identifier.clone(),
            code_hash: hash.to_string(),
            expires_at: Utc::now() + Duration::minutes(15),
            attempts: 0,
            used: false,
        }
    }

    #[tokio::test]
    async fn test_code_upsert_replaces_previous() {
        let store = MemoryStore::new();
        let alice = id("a1");

        store.upsert_code(code(&alice, "first")).await.unwrap();
        store.increment_code_attempts(&alice).await.unwrap();
        store.upsert_code(code(&alice, "second")).await.unwrap();

        let stored = store.code(&alice).await.unwrap().unwrap();
        assert_eq!(stored.code_hash, "second");
        assert_eq!(stored.attempts, 0);
        assert!(!store.mark_code_used(&alice, "first").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_code_used_is_single_shot() {
        let store = MemoryStore::new();
        let alice = id("a1");
        store.upsert_code(code(&alice, "hash")).await.unwrap();

        assert!(store.mark_code_used(&alice, "hash").await.unwrap());
        assert!(!store.mark_code_used(&alice, "hash").await.unwrap());
        assert!(!store.mark_code_used(&id("b2"), "hash").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_attempts() {
        let store = MemoryStore::new();
        let alice = id("a1");
        assert_eq!(store.increment_code_attempts(&alice).await.unwrap(), None);

        store.upsert_code(code(&alice, "hash")).await.unwrap();
        assert_eq!(store.increment_code_attempts(&alice).await.unwrap(), Some(1));
        assert_eq!(store.increment_code_attempts(&alice).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_purge_expired_codes_and_stale_nonces() {
        let store = MemoryStore::new();
        let mut stale = code(&id("a1"), "hash");
        stale.expires_at = Utc::now() - Duration::minutes(1);
        store.upsert_code(stale).await.unwrap();
        store.upsert_code(code(&id("b2"), "hash")).await.unwrap();

        assert_eq!(store.purge_expired_codes(Utc::now()).await.unwrap(), 1);
        assert!(store.code(&id("b2")).await.unwrap().is_some());

        store
            .upsert_nonce(SiweNonce {
                identifier: id("a1"),
                nonce: "n".to_string(),
                issued_at: Utc::now() - Duration::minutes(30),
                consumed: false,
            })
            .await
            .unwrap();
        let cutoff = Utc::now() - Duration::minutes(15);
        assert_eq!(store.purge_stale_nonces(cutoff).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consume_nonce_cas() {
        let store = MemoryStore::new();
        let alice = id("a1");
        store
            .upsert_nonce(SiweNonce {
                identifier: alice.clone(),
                nonce: "abc".to_string(),
                issued_at: Utc::now(),
                consumed: false,
            })
            .await
            .unwrap();

        assert!(!store.consume_nonce(&alice, "wrong").await.unwrap());
        assert!(store.consume_nonce(&alice, "abc").await.unwrap());
        assert!(!store.consume_nonce(&alice, "abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_binding_changes() {
        let store = MemoryStore::new();
        let alice = id("a1");
        let first = "0x742d35Cc6634C0532925a3b8D404cB8b3d3A5d3a";
        let second = "0x0000000000000000000000000000000000000001";

        assert_eq!(store.upsert_binding(&alice, first).await.unwrap(), BindingChange::Created);
        assert_eq!(store.upsert_binding(&alice, first).await.unwrap(), BindingChange::Refreshed);
        assert_eq!(
            store.upsert_binding(&alice, second).await.unwrap(),
            BindingChange::Rebound {
                previous: first.to_lowercase()
            }
        );
        assert_eq!(store.binding(&alice).await.unwrap().unwrap().wallet_address, second);
    }

    #[tokio::test]
    async fn test_accumulate_then_new_row_after_claim() {
        let store = MemoryStore::new();
        let alice = id("a1");

        let first = store.accumulate_allocation(&alice, U256::from(100), &template()).await.unwrap();
        let Accumulation::Inserted { id: row_id, .. } = first else {
            panic!("expected insert, got {:?}", first);
        };
        assert_eq!(
            store.accumulate_allocation(&alice, U256::from(50), &template()).await.unwrap(),
            Accumulation::Accumulated {
                id: row_id,
                previous: U256::from(100),
                total: U256::from(150)
            }
        );

        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount_minor, "150");

        assert_eq!(
            store.mark_claimed(&alice, row_id, "0xaa", U256::from(150)).await.unwrap(),
            MarkClaimed::Marked
        );
        assert!(matches!(
            store.accumulate_allocation(&alice, U256::from(50), &template()).await.unwrap(),
            Accumulation::Inserted { .. }
        ));

        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first
        assert!(!rows[0].claimed);
        assert_eq!(rows[0].amount_minor, "50");
        assert!(rows[1].claimed);
        assert_eq!(rows[1].amount_minor, "150");
    }

    #[tokio::test]
    async fn test_accumulate_overflow_is_rejected() {
        let store = MemoryStore::new();
        let alice = id("a1");
        store.accumulate_allocation(&alice, U256::MAX, &template()).await.unwrap();

        let result = store.accumulate_allocation(&alice, U256::from(1), &template()).await;
        assert!(matches!(result, Err(ClaimError::InvalidAmount(_))));
        assert_eq!(store.allocations(&alice).await.unwrap()[0].amount().unwrap(), U256::MAX);
    }

    #[tokio::test]
    async fn test_mark_claimed_cas_returns_winner_hash() {
        let store = MemoryStore::new();
        let alice = id("a1");
        let Accumulation::Inserted { id: row_id, .. } =
            store.accumulate_allocation(&alice, U256::from(1), &template()).await.unwrap()
        else {
            panic!("expected insert");
        };

        store
            .set_pending_transfer(&alice, row_id, Some(transfer("0xwinner", 1)))
            .await
            .unwrap();
        assert_eq!(
            store.allocations(&alice).await.unwrap()[0].pending_transfer,
            Some(transfer("0xwinner", 1))
        );

        assert_eq!(
            store.mark_claimed(&alice, row_id, "0xwinner", U256::from(1)).await.unwrap(),
            MarkClaimed::Marked
        );
        assert_eq!(
            store.mark_claimed(&alice, row_id, "0xloser", U256::from(1)).await.unwrap(),
            MarkClaimed::AlreadyClaimed {
                tx_hash: Some("0xwinner".to_string())
            }
        );

        let row = &store.allocations(&alice).await.unwrap()[0];
        assert_eq!(row.claimed_tx_hash.as_deref(), Some("0xwinner"));
        assert!(row.pending_transfer.is_none());
        assert!(store.set_pending_transfer(&alice, row_id, None).await.is_err());
        assert!(store.mark_claimed(&alice, Uuid::new_v4(), "0x", U256::from(1)).await.is_err());
    }

    async fn insert(store: &MemoryStore, identifier: &EmailIdentifier, amount: u64) -> Uuid {
        match store
            .accumulate_allocation(identifier, U256::from(amount), &template())
            .await
            .unwrap()
        {
            Accumulation::Inserted { id, .. } | Accumulation::Accumulated { id, .. } => id,
        }
    }

    #[tokio::test]
    async fn test_row_in_flight_is_closed_to_accumulation() {
        let store = MemoryStore::new();
        let alice = id("a1");
        let row_id = insert(&store, &alice, 100).await;
        store
            .set_pending_transfer(&alice, row_id, Some(transfer("0xsent", 100)))
            .await
            .unwrap();

        assert!(matches!(
            store.accumulate_allocation(&alice, U256::from(50), &template()).await.unwrap(),
            Accumulation::Inserted { .. }
        ));
        assert!(matches!(
            store.accumulate_allocation(&alice, U256::from(5), &template()).await.unwrap(),
            Accumulation::Accumulated { .. }
        ));

        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount_minor, "55");
        assert!(rows[0].is_open());
        assert_eq!(rows[1].amount_minor, "100");

        store.mark_claimed(&alice, row_id, "0xsent", U256::from(100)).await.unwrap();
        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows[0].amount_minor, "55");
        assert!(rows[1].claimed);
        assert_eq!(rows[1].amount_minor, "100");
    }

    #[tokio::test]
    async fn test_cleared_transfer_reabsorbs_open_row() {
        let store = MemoryStore::new();
        let alice = id("a1");
        let row_id = insert(&store, &alice, 100).await;
        store
            .set_pending_transfer(&alice, row_id, Some(transfer("0xreverted", 100)))
            .await
            .unwrap();
        insert(&store, &alice, 50).await;

        store.set_pending_transfer(&alice, row_id, None).await.unwrap();

        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, row_id);
        assert!(rows[0].is_open());
        assert_eq!(rows[0].amount_minor, "150");
    }

    #[tokio::test]
    async fn test_mark_claimed_carries_growth_into_new_row() {
        let store = MemoryStore::new();
        let alice = id("a1");
        let row_id = insert(&store, &alice, 100).await;
        // Top-up lands after the amount was read but before the transfer was recorded
        insert(&store, &alice, 50).await;

        store.mark_claimed(&alice, row_id, "0xsent", U256::from(100)).await.unwrap();

        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_open());
        assert_eq!(rows[0].amount_minor, "50");
        assert!(rows[1].claimed);
        assert_eq!(rows[1].amount_minor, "100");

        let stats = store.allocation_stats().await.unwrap();
        assert_eq!(stats.total_minor, U256::from(150));
        assert_eq!(stats.claimed_minor, U256::from(100));
    }

    #[tokio::test]
    async fn test_mark_claimed_merges_growth_into_open_row() {
        let store = MemoryStore::new();
        let alice = id("a1");
        let row_id = insert(&store, &alice, 100).await;
        insert(&store, &alice, 20).await;
        store
            .set_pending_transfer(&alice, row_id, Some(transfer("0xsent", 100)))
            .await
            .unwrap();
        insert(&store, &alice, 30).await;

        store.mark_claimed(&alice, row_id, "0xsent", U256::from(100)).await.unwrap();

        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount_minor, "50");
        assert_eq!(rows[1].amount_minor, "100");
    }

    #[tokio::test]
    async fn test_concurrent_accumulation_keeps_single_unclaimed_row() {
        let store = Arc::new(MemoryStore::new());
        let alice = id("a1");
        let mut handles = vec![];

        for _ in 0..20 {
            let store = Arc::clone(&store);
            let alice = alice.clone();
            handles.push(tokio::spawn(async move {
                store.accumulate_allocation(&alice, U256::from(5), &template()).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount().unwrap(), U256::from(100));
    }

    #[tokio::test]
    async fn test_allocation_stats() {
        let store = MemoryStore::new();
        let alice = id("a1");
        let bob = id("b2");
        store.accumulate_allocation(&alice, U256::from(100), &template()).await.unwrap();
        let Accumulation::Inserted { id: bob_row, .. } =
            store.accumulate_allocation(&bob, U256::from(40), &template()).await.unwrap()
        else {
            panic!("expected insert");
        };
        store.mark_claimed(&bob, bob_row, "0xbb", U256::from(40)).await.unwrap();

        let stats = store.allocation_stats().await.unwrap();
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.claimed_allocations, 1);
        assert_eq!(stats.total_minor, U256::from(140));
        assert_eq!(stats.claimed_minor, U256::from(40));
    }

    #[tokio::test]
    async fn test_allocation_rows_are_per_identifier() {
        let store = MemoryStore::new();
        let alice = id("a1");
        store
            .allocations
            .insert(alice.clone(), vec![test_allocation(&alice, "7", true)]);

        assert_eq!(store.allocations(&alice).await.unwrap().len(), 1);
        assert!(store.allocations(&id("b2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gas_settings_and_audit() {
        let store = MemoryStore::new();
        assert!(store.gas_settings().await.unwrap().is_none());

        let settings = GasSettings {
            max_gas_limit: 90_000,
            max_gas_cost_wei: "1000000000000000".to_string(),
            updated_by: "admin".to_string(),
            updated_at: Utc::now(),
        };
        store.put_gas_settings(settings.clone()).await.unwrap();
        assert_eq!(store.gas_settings().await.unwrap(), Some(settings));

        for action in ["first", "second"] {
            store
                .append_audit(AuditEntry {
                    id: Uuid::new_v4(),
                    action: action.to_string(),
                    actor: "admin".to_string(),
                    details: serde_json::json!({}),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let log = store.audit_log().await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action, "first");
    }
}

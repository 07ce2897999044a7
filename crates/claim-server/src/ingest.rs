//! Allocation upload: CSV parsing plus accumulate-if-unclaimed upsert.

use crate::config::ClaimConfig;
use crate::email::validate_email;
use crate::error::{ClaimError, ClaimResult};
use crate::model::AuditEntry;
use crate::secrets::{normalize_email, Secrets};
use crate::store::{Accumulation, ClaimStore, NewAllocation};
use crate::units::parse_amount;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CSV_UPLOAD_ACTION: &str = "csv_upload";

/// One data row from an upload. Missing fields are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvRow {
    /// 1-based line in the upload
    pub line: u64,
    pub email: String,
    pub amount: String,
}

/// Counts reported back to the uploader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub total: usize,
}

/// Parse `email,amount` rows. A first line mentioning `email` is treated as a header; blank
/// lines are ignored; fields are unquoted and trimmed.
pub fn parse_csv(text: &str) -> ClaimResult<Vec<CsvRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|e| ClaimError::InvalidRequest(format!("Unreadable CSV: {}", e)))?;

        if index == 0 && record.iter().any(|field| field.to_lowercase().contains("email")) {
            continue;
        }

        let field = |i: usize| record.get(i).unwrap_or("").replace('"', "").trim().to_string();
        let (email, amount) = (field(0), field(1));
        if email.is_empty() && amount.is_empty() {
            continue;
        }

        rows.push(CsvRow {
            line: record.position().map_or(index as u64 + 1, |p| p.line()),
            email,
            amount,
        });
    }

    Ok(rows)
}

pub struct IngestionService {
    store: Arc<dyn ClaimStore>,
    secrets: Arc<Secrets>,
    decimals: u8,
    template: NewAllocation,
}

impl IngestionService {
    pub fn new(config: &ClaimConfig, store: Arc<dyn ClaimStore>, secrets: Arc<Secrets>) -> Self {
        Self {
            store,
            secrets,
            decimals: config.token.decimals,
            template: NewAllocation {
                decimals: config.token.decimals,
                token_contract: config.token.contract_address.clone(),
                chain: config.token.chain.clone(),
            },
        }
    }

    /// Parse and ingest an uploaded CSV document.
    pub async fn upload_csv(&self, text: &str, actor: &str) -> ClaimResult<IngestReport> {
        let rows = parse_csv(text)?;
        if rows.is_empty() {
            return Err(ClaimError::InvalidRequest("No rows found in CSV".to_string()));
        }
        self.ingest(&rows, actor).await
    }

    /// Accumulate each row into the email's unclaimed allocation, creating one when needed.
    /// Malformed rows and overflowing totals are skipped and counted.
    pub async fn ingest(&self, rows: &[CsvRow], actor: &str) -> ClaimResult<IngestReport> {
        let mut report = IngestReport {
            total: rows.len(),
            ..IngestReport::default()
        };

        for row in rows {
            let email = normalize_email(&row.email);
            if let Err(e) = validate_email(&email) {
                warn!("Skipping line {}: {}", row.line, e);
                report.skipped += 1;
                continue;
            }
            let amount = match parse_amount(&row.amount, self.decimals) {
                Ok(amount) => amount,
                Err(e) => {
                    warn!("Skipping line {}: {}", row.line, e);
                    report.skipped += 1;
                    continue;
                }
            };

            let identifier = self.secrets.email_identifier(&email)?;
            match self
                .store
                .accumulate_allocation(&identifier, amount, &self.template)
                .await
            {
                Ok(Accumulation::Inserted { .. }) => {
                    debug!("Line {}: new allocation for {}", row.line, identifier);
                    report.inserted += 1;
                }
                Ok(Accumulation::Accumulated { previous, total, .. }) => {
                    debug!(
                        "Line {}: accumulated {} + {} = {} for {}",
                        row.line, previous, amount, total, identifier
                    );
                    report.updated += 1;
                }
                Err(ClaimError::InvalidAmount(reason)) => {
                    warn!("Skipping line {}: {}", row.line, reason);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            self.store
                .upsert_email_lookup(&identifier, self.secrets.encrypt_pii(&email)?)
                .await?;
        }

        self.store
            .append_audit(AuditEntry {
                id: Uuid::new_v4(),
                action: CSV_UPLOAD_ACTION.to_string(),
                actor: actor.to_string(),
                details: json!({
                    "total_rows": report.total,
                    "inserted": report.inserted,
                    "updated": report.updated,
                    "skipped": report.skipped,
                }),
                created_at: Utc::now(),
            })
            .await?;

        info!(
            "Ingested {} rows: {} inserted, {} updated, {} skipped",
            report.total, report.inserted, report.updated, report.skipped
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::store::{MarkClaimed, MemoryStore};
    use alloy::primitives::U256;

    fn service() -> (IngestionService, Arc<MemoryStore>, Arc<Secrets>) {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let secrets = Arc::new(Secrets::new(&config.security.pepper).unwrap());
        (
            IngestionService::new(&config, store.clone(), secrets.clone()),
            store,
            secrets,
        )
    }

    fn tokens(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18))
    }

    #[test]
    fn test_parse_csv_with_header_and_quotes() {
        let rows = parse_csv("Email,Amount\n\"alice@example.com\", \"100\"\n\n  bob@example.com ,2.5\n").unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].email, "alice@example.com");
        assert_eq!(rows[0].amount, "100");
        assert_eq!(rows[0].line, 2);
        assert_eq!(rows[1].email, "bob@example.com");
        assert_eq!(rows[1].amount, "2.5");
    }

    #[test]
    fn test_parse_csv_without_header_and_short_rows() {
        let rows = parse_csv("alice@example.com,1\nbob@example.com\n").unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].email, "alice@example.com");
        assert_eq!(rows[1].email, "bob@example.com");
        assert_eq!(rows[1].amount, "");
    }

    #[tokio::test]
    async fn test_ingest_accumulates_then_starts_new_row_after_claim() {
        let (service, store, secrets) = service();
        let alice = secrets.email_identifier("alice@example.com").unwrap();

        let report = service.upload_csv("email,amount\nalice@example.com,100", "admin").await.unwrap();
        assert_eq!(report.inserted, 1);
        let report = service.upload_csv("ALICE@example.com,50", "admin").await.unwrap();
        assert_eq!(report.updated, 1);

        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount().unwrap(), tokens(150));

        assert_eq!(
            store.mark_claimed(&alice, rows[0].id, "0xaa", tokens(150)).await.unwrap(),
            MarkClaimed::Marked
        );
        let report = service.upload_csv("alice@example.com,50", "admin").await.unwrap();
        assert_eq!(report.inserted, 1);

        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount().unwrap(), tokens(50));
        assert!(!rows[0].claimed);
        assert_eq!(rows[1].amount().unwrap(), tokens(150));
        assert_eq!(rows[1].claimed_tx_hash.as_deref(), Some("0xaa"));
    }

    #[tokio::test]
    async fn test_in_batch_duplicates_accumulate() {
        let (service, store, secrets) = service();
        let report = service
            .upload_csv("alice@example.com,1\nalice@example.com,2\nalice@example.com,0.5", "admin")
            .await
            .unwrap();

        assert_eq!(
            report,
            IngestReport {
                inserted: 1,
                updated: 2,
                skipped: 0,
                total: 3
            }
        );
        let alice = secrets.email_identifier("alice@example.com").unwrap();
        let rows = store.allocations(&alice).await.unwrap();
        assert_eq!(rows[0].amount().unwrap(), tokens(7) / U256::from(2));
    }

    #[tokio::test]
    async fn test_malformed_rows_are_skipped() {
        let (service, store, _) = service();
        let report = service
            .upload_csv(
                "not-an-address,5\nbob@example.com,-1\ncarol@example.com,abc\ndave@example.com,0\n\
                 erin@example.com,1.0000000000000000001\nfrank@example.com\ngrace@example.com,3",
                "admin",
            )
            .await
            .unwrap();

        assert_eq!(report.total, 7);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 6);
        assert_eq!(store.allocation_stats().await.unwrap().total_allocations, 1);
    }

    #[tokio::test]
    async fn test_overflow_row_is_skipped() {
        let (service, store, secrets) = service();
        let alice = secrets.email_identifier("alice@example.com").unwrap();
        store
            .accumulate_allocation(&alice, U256::MAX, &service.template)
            .await
            .unwrap();

        let report = service.upload_csv("alice@example.com,1", "admin").await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(store.allocations(&alice).await.unwrap()[0].amount().unwrap(), U256::MAX);
    }

    #[tokio::test]
    async fn test_email_lookup_is_encrypted() {
        let (service, store, secrets) = service();
        service.upload_csv("Alice@Example.com,1", "admin").await.unwrap();

        let alice = secrets.email_identifier("alice@example.com").unwrap();
        let lookup = store.email_lookup(&alice).await.unwrap().unwrap();
        assert!(!lookup.email_encrypted.contains("alice"));
        assert_eq!(secrets.decrypt_pii(&lookup.email_encrypted).unwrap(), "alice@example.com");
    }

    #[tokio::test]
    async fn test_every_upload_is_audited() {
        let (service, store, _) = service();
        service.upload_csv("alice@example.com,1\nbad,1", "ops").await.unwrap();

        let log = store.audit_log().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, CSV_UPLOAD_ACTION);
        assert_eq!(log[0].actor, "ops");
        assert_eq!(log[0].details["skipped"], 1);
        assert_eq!(log[0].details["total_rows"], 2);
    }

    #[tokio::test]
    async fn test_empty_upload_rejected() {
        let (service, _, _) = service();
        assert!(matches!(
            service.upload_csv("email,amount\n\n", "admin").await,
            Err(ClaimError::InvalidRequest(_))
        ));
    }
}

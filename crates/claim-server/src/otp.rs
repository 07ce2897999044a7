//! Email possession proof with one-time codes.

use crate::config::ClaimConfig;
use crate::email::{validate_email, Mailer};
use crate::error::{ClaimError, ClaimResult};
use crate::model::{AllocationView, ClaimStatus, OneTimeCode};
use crate::rate_limit::{LimitBucket, RateLimiter};
use crate::secrets::{generate_code, normalize_email, safe_eq, Secrets};
use crate::session::SessionTokenService;
use crate::store::ClaimStore;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a successful code exchange
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub session_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationView>,
    pub history: Vec<AllocationView>,
}

pub struct OneTimeCodeService {
    store: Arc<dyn ClaimStore>,
    limiter: Arc<dyn RateLimiter>,
    mailer: Arc<dyn Mailer>,
    secrets: Arc<Secrets>,
    sessions: Arc<SessionTokenService>,
    token_symbol: String,
    code_ttl: Duration,
    max_attempts: u32,
}

impl OneTimeCodeService {
    pub fn new(
        config: &ClaimConfig,
        store: Arc<dyn ClaimStore>,
        limiter: Arc<dyn RateLimiter>,
        mailer: Arc<dyn Mailer>,
        secrets: Arc<Secrets>,
        sessions: Arc<SessionTokenService>,
    ) -> Self {
        Self {
            store,
            limiter,
            mailer,
            secrets,
            sessions,
            token_symbol: config.token.symbol.clone(),
            code_ttl: Duration::minutes(config.security.code_expiry_minutes as i64),
            max_attempts: config.security.max_code_attempts,
        }
    }

    /// Issue a fresh code and mail it. Succeeds for any well-formed email, whether or not an
    /// allocation exists for it.
    pub async fn request_code(&self, email: &str, client_ip: &str) -> ClaimResult<()> {
        self.limiter.consume(LimitBucket::Ip, client_ip)?;

        let email = normalize_email(email);
        validate_email(&email)?;
        let identifier = self.secrets.email_identifier(&email)?;

        self.limiter.consume(LimitBucket::Email, identifier.as_str())?;

        let code = generate_code();
        self.store
            .upsert_code(OneTimeCode {
                identifier: identifier.clone(),
                code_hash: self.secrets.hash_code(&code)?,
                expires_at: Utc::now() + self.code_ttl,
                attempts: 0,
                used: false,
            })
            .await?;

        info!("Issued verification code for {}", identifier);

        if let Err(e) = self.mailer.send_code(&email, &code).await {
            warn!("Verification mail for {} not delivered: {}", identifier, e);
        }

        Ok(())
    }

    /// Exchange a code for a session plus the caller's allocation state.
    pub async fn verify_code(&self, email: &str, code: &str) -> ClaimResult<SessionGrant> {
        let email = normalize_email(email);
        validate_email(&email)?;
        let code = code.trim();
        if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(ClaimError::InvalidRequest("Code must be 6 digits".to_string()));
        }

        let identifier = self.secrets.email_identifier(&email)?;
        self.limiter.consume(LimitBucket::Code, identifier.as_str())?;

        let record = self
            .store
            .code(&identifier)
            .await?
            .ok_or(ClaimError::CodeNotFound)?;

        if record.is_expired(Utc::now()) {
            self.store.delete_code(&identifier).await?;
            return Err(ClaimError::CodeExpired);
        }
        if record.used {
            return Err(ClaimError::CodeAlreadyUsed);
        }
        if record.attempts >= self.max_attempts {
            self.store.delete_code(&identifier).await?;
            return Err(ClaimError::TooManyAttempts);
        }

        let code_hash = self.secrets.hash_code(code)?;
        if !safe_eq(&code_hash, &record.code_hash) {
            let attempts = self
                .store
                .increment_code_attempts(&identifier)
                .await?
                .ok_or(ClaimError::CodeNotFound)?;
            debug!("Wrong code for {} (attempt {})", identifier, attempts);

            if attempts >= self.max_attempts {
                self.store.delete_code(&identifier).await?;
                warn!("Code for {} destroyed after {} wrong attempts", identifier, attempts);
                return Err(ClaimError::TooManyAttempts);
            }
            return Err(ClaimError::InvalidCode);
        }

        if !self.store.mark_code_used(&identifier, &code_hash).await? {
            return Err(ClaimError::CodeAlreadyUsed);
        }

        let session_token = self.sessions.issue(&identifier)?;
        let rows = self.store.allocations(&identifier).await?;
        let (allocation, history) = match ClaimStatus::from_rows(&rows, &self.token_symbol)? {
            Some(status) => (Some(status.allocation), status.history),
            None => (None, Vec::new()),
        };

        info!(
            "Verified {} ({} allocation rows)",
            identifier,
            rows.len()
        );

        Ok(SessionGrant {
            session_token,
            allocation,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, RateLimitRule};
    use crate::email::MockMailer;
    use crate::rate_limit::MemoryRateLimiter;
    use crate::store::{MemoryStore, NewAllocation};
    use alloy::primitives::U256;
    use std::sync::Mutex;

    struct Harness {
        service: OneTimeCodeService,
        store: Arc<MemoryStore>,
        secrets: Arc<Secrets>,
        sessions: Arc<SessionTokenService>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    /// `mailer: None` installs a mock that records every code sent
    fn harness_with(mailer: Option<MockMailer>, email_limit: u32) -> Harness {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let secrets = Arc::new(Secrets::new(&config.security.pepper).unwrap());
        let sessions = Arc::new(SessionTokenService::new(
            &config.security.session_secret,
            Duration::minutes(30),
        ));
        let limiter = Arc::new(MemoryRateLimiter::new(
            config.security.ip_limit,
            RateLimitRule {
                max_requests: email_limit,
                window_secs: 300,
            },
            config.security.code_limit,
        ));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let mailer = mailer.unwrap_or_else(|| {
            let captured = Arc::clone(&sent);
            let mut mailer = MockMailer::new();
            mailer.expect_send_code().returning(move |_, code| {
                captured.lock().unwrap().push(code.to_string());
                Ok(())
            });
            mailer
        });

        let service = OneTimeCodeService::new(
            &config,
            store.clone(),
            limiter,
            Arc::new(mailer),
            secrets.clone(),
            sessions.clone(),
        );
        Harness {
            service,
            store,
            secrets,
            sessions,
            sent,
        }
    }

    fn harness() -> Harness {
        harness_with(None, 10)
    }

    impl Harness {
        async fn request(&self, email: &str) -> String {
            self.service.request_code(email, "127.0.0.1").await.unwrap();
            self.sent.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn wrong(code: &str) -> String {
        format!("{:06}", (code.parse::<u32>().unwrap() + 1) % 1_000_000)
    }

    #[tokio::test]
    async fn test_request_stores_hashed_code() {
        let h = harness();
        let code = h.request("Alice@Example.com").await;

        let identifier = h.secrets.email_identifier("alice@example.com").unwrap();
        let record = h.store.code(&identifier).await.unwrap().unwrap();
        assert_ne!(record.code_hash, code);
        assert_eq!(record.code_hash, h.secrets.hash_code(&code).unwrap());
        assert_eq!(record.attempts, 0);
        assert!(!record.used);
    }

    #[tokio::test]
    async fn test_second_request_invalidates_first() {
        let h = harness();
        let first = h.request("alice@example.com").await;
        let mut second = h.request("alice@example.com").await;
        while second == first {
            second = h.request("alice@example.com").await;
        }

        assert!(matches!(
            h.service.verify_code("alice@example.com", &first).await,
            Err(ClaimError::InvalidCode)
        ));
        assert!(h.service.verify_code("alice@example.com", &second).await.is_ok());
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let h = harness();
        let code = h.request("alice@example.com").await;

        let grant = h.service.verify_code("alice@example.com", &code).await.unwrap();
        let session = h.sessions.verify(&grant.session_token).unwrap();
        assert_eq!(session.identifier, h.secrets.email_identifier("alice@example.com").unwrap());
        assert!(grant.allocation.is_none());

        assert!(matches!(
            h.service.verify_code("alice@example.com", &code).await,
            Err(ClaimError::CodeAlreadyUsed)
        ));
    }

    #[tokio::test]
    async fn test_five_wrong_attempts_destroy_code() {
        let h = harness();
        let code = h.request("alice@example.com").await;
        let bad = wrong(&code);

        for _ in 0..4 {
            assert!(matches!(
                h.service.verify_code("alice@example.com", &bad).await,
                Err(ClaimError::InvalidCode)
            ));
        }
        assert!(matches!(
            h.service.verify_code("alice@example.com", &bad).await,
            Err(ClaimError::TooManyAttempts)
        ));
        assert!(matches!(
            h.service.verify_code("alice@example.com", &code).await,
            Err(ClaimError::CodeNotFound)
        ));
    }

    #[tokio::test]
    async fn test_expired_code_is_deleted() {
        let h = harness();
        let code = h.request("alice@example.com").await;
        let identifier = h.secrets.email_identifier("alice@example.com").unwrap();

        let mut record = h.store.code(&identifier).await.unwrap().unwrap();
        record.expires_at = Utc::now() - Duration::seconds(1);
        h.store.upsert_code(record).await.unwrap();

        assert!(matches!(
            h.service.verify_code("alice@example.com", &code).await,
            Err(ClaimError::CodeExpired)
        ));
        assert!(h.store.code(&identifier).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_input_rejected() {
        let h = harness();
        assert!(matches!(
            h.service.request_code("not-an-email", "127.0.0.1").await,
            Err(ClaimError::InvalidEmail(_))
        ));
        for code in ["12345", "1234567", "12a456", ""] {
            assert!(matches!(
                h.service.verify_code("alice@example.com", code).await,
                Err(ClaimError::InvalidRequest(_))
            ));
        }
        assert!(matches!(
            h.service.verify_code("alice@example.com", "123456").await,
            Err(ClaimError::CodeNotFound)
        ));
    }

    #[tokio::test]
    async fn test_grant_includes_allocation_and_history() {
        let h = harness();
        let identifier = h.secrets.email_identifier("alice@example.com").unwrap();
        let template = NewAllocation {
            decimals: 18,
            token_contract: "0x2e105875765e46d93A301A9FE0e81d98d070200e".to_string(),
            chain: "ethereum".to_string(),
        };
        let ten = U256::from(10u64).pow(U256::from(18)) * U256::from(10);
        h.store.accumulate_allocation(&identifier, ten, &template).await.unwrap();

        let code = h.request("alice@example.com").await;
        let grant = h.service.verify_code(" ALICE@example.com ", &code).await.unwrap();

        let allocation = grant.allocation.unwrap();
        assert_eq!(allocation.amount, "10");
        assert_eq!(allocation.symbol, "GOC");
        assert!(!allocation.claimed);
        assert!(grant.history.is_empty());
    }

    #[tokio::test]
    async fn test_email_rate_limit() {
        let h = harness_with(None, 2);
        h.request("alice@example.com").await;
        h.request("alice@example.com").await;

        assert!(matches!(
            h.service.request_code("alice@example.com", "127.0.0.1").await,
            Err(ClaimError::RateLimited {
                bucket: LimitBucket::Email,
                ..
            })
        ));
        // A different address is unaffected
        h.request("bob@example.com").await;
    }

    #[tokio::test]
    async fn test_mail_failure_is_not_surfaced() {
        let mut mailer = MockMailer::new();
        mailer
            .expect_send_code()
            .times(1)
            .returning(|_, _| Err(ClaimError::Internal(anyhow::anyhow!("smtp down"))));
        let h = harness_with(Some(mailer), 10);

        assert!(h.service.request_code("alice@example.com", "127.0.0.1").await.is_ok());
        let identifier = h.secrets.email_identifier("alice@example.com").unwrap();
        assert!(h.store.code(&identifier).await.unwrap().is_some());
    }
}

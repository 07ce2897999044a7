//! Service wiring and periodic housekeeping.

use crate::admin::AdminService;
use crate::config::ClaimConfig;
use crate::distribution::DistributionEngine;
use crate::email::{mailer_from_config, Mailer};
use crate::error::ClaimResult;
use crate::eth::{AlloyChain, TokenChain};
use crate::ingest::IngestionService;
use crate::otp::OneTimeCodeService;
use crate::rate_limit::{MemoryRateLimiter, RateLimiter};
use crate::secrets::Secrets;
use crate::session::SessionTokenService;
use crate::store::{ClaimStore, MemoryStore};
use crate::wallet::WalletProofService;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// What one housekeeping pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub expired_codes: usize,
    pub stale_nonces: usize,
    pub idle_windows: usize,
    pub claim_locks: usize,
}

/// Every service behind the HTTP surface
pub struct AppState {
    pub store: Arc<dyn ClaimStore>,
    pub limiter: Arc<dyn RateLimiter>,
    pub sessions: Arc<SessionTokenService>,
    pub otp: OneTimeCodeService,
    pub wallet: WalletProofService,
    pub distribution: DistributionEngine,
    pub ingestion: IngestionService,
    pub admin: AdminService,
    /// Client address comes from proxy headers rather than the socket peer
    pub trust_proxy_headers: bool,
    nonce_ttl: Duration,
}

impl AppState {
    /// Production wiring: in-memory store and limiter, alloy chain client, configured mailer.
    pub fn from_config(config: &ClaimConfig) -> anyhow::Result<Self> {
        let chain = AlloyChain::new(config)?;
        info!(
            "Distributor {} sending token {}",
            chain.distributor(),
            chain.token()
        );
        let mailer: Arc<dyn Mailer> = Arc::from(mailer_from_config(config)?);

        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryRateLimiter::from_config(&config.security)),
            Arc::new(chain),
            mailer,
        )
    }

    pub fn new(
        config: &ClaimConfig,
        store: Arc<dyn ClaimStore>,
        limiter: Arc<dyn RateLimiter>,
        chain: Arc<dyn TokenChain>,
        mailer: Arc<dyn Mailer>,
    ) -> anyhow::Result<Self> {
        let secrets = Arc::new(Secrets::new(&config.security.pepper)?);
        let sessions = Arc::new(SessionTokenService::new(
            &config.security.session_secret,
            Duration::minutes(config.security.session_ttl_minutes as i64),
        ));

        Ok(Self {
            otp: OneTimeCodeService::new(
                config,
                store.clone(),
                limiter.clone(),
                mailer.clone(),
                secrets.clone(),
                sessions.clone(),
            ),
            wallet: WalletProofService::new(config, store.clone())?,
            distribution: DistributionEngine::new(config, store.clone(), chain, mailer, secrets.clone())?,
            ingestion: IngestionService::new(config, store.clone(), secrets),
            admin: AdminService::new(config, store.clone(), limiter.clone())?,
            trust_proxy_headers: config.security.trust_proxy_headers,
            nonce_ttl: Duration::minutes(config.security.nonce_ttl_minutes as i64),
            store,
            limiter,
            sessions,
        })
    }

    /// Drop expired codes, stale nonces, idle limiter windows and unused claim locks.
    pub async fn cleanup(&self) -> ClaimResult<CleanupStats> {
        let now = Utc::now();
        let stats = CleanupStats {
            expired_codes: self.store.purge_expired_codes(now).await?,
            stale_nonces: self.store.purge_stale_nonces(now - self.nonce_ttl).await?,
            idle_windows: self.limiter.purge_idle(),
            claim_locks: self.distribution.prune_claim_locks(),
        };

        if stats == CleanupStats::default() {
            debug!("Cleanup found nothing to remove");
        } else {
            info!(
                "Cleanup removed {} codes, {} nonces, {} limiter windows, {} claim locks",
                stats.expired_codes, stats.stale_nonces, stats.idle_windows, stats.claim_locks
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> (AppState, Arc<MemoryStore>, Arc<crate::eth::fake::FakeChain>) {
    let config = crate::config::test_config();
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(crate::eth::fake::FakeChain::default());
    let state = AppState::new(
        &config,
        store.clone(),
        Arc::new(MemoryRateLimiter::from_config(&config.security)),
        chain.clone(),
        Arc::new(crate::email::LogMailer),
    )
    .unwrap();
    (state, store, chain)
}

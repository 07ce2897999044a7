//! Administrative operations: basic-auth check, stats, gas settings and limiter reset.

use crate::config::ClaimConfig;
use crate::error::{ClaimError, ClaimResult};
use crate::gas::GasPolicy;
use crate::model::{AuditEntry, GasSettings};
use crate::rate_limit::RateLimiter;
use crate::secrets::safe_eq;
use crate::store::ClaimStore;
use crate::units::{format_amount, parse_amount};
use alloy::primitives::{utils::parse_ether, U256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

pub const GAS_SETTINGS_ACTION: &str = "gas_settings_update";
pub const RATE_LIMIT_RESET_ACTION: &str = "rate_limits_reset";

const GAS_LIMIT_RANGE: RangeInclusive<u64> = 21_000..=200_000;
const MIN_GAS_COST_ETH: &str = "0.0001";
const MAX_GAS_COST_ETH: &str = "0.01";

/// Allocation totals for the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub total_allocations: usize,
    pub claimed_allocations: usize,
    pub pending_claims: usize,
    pub total_value: String,
    pub claimed_value: String,
    /// Claimed share of allocations, rounded to a whole percent
    pub claim_percentage: u32,
}

/// Where the effective gas settings came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsSource {
    Store,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasSettingsView {
    pub max_gas_limit: u64,
    #[serde(rename = "maxGasCostETH")]
    pub max_gas_cost_eth: String,
    pub source: SettingsSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Requested gas settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GasSettingsUpdate {
    pub max_gas_limit: u64,
    #[serde(rename = "maxGasCostETH")]
    #[validate(length(min = 1, max = 32))]
    pub max_gas_cost_eth: String,
}

pub struct AdminService {
    store: Arc<dyn ClaimStore>,
    limiter: Arc<dyn RateLimiter>,
    username: String,
    password: String,
    decimals: u8,
    gas_defaults: GasPolicy,
}

impl std::fmt::Debug for AdminService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminService")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AdminService {
    pub fn new(
        config: &ClaimConfig,
        store: Arc<dyn ClaimStore>,
        limiter: Arc<dyn RateLimiter>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            limiter,
            username: config.admin.username.clone(),
            password: config.admin.password.clone(),
            decimals: config.token.decimals,
            gas_defaults: GasPolicy::from_config(config)?,
        })
    }

    /// Check an `Authorization: Basic ...` header value. Returns the admin username.
    pub fn authenticate(&self, header: Option<&str>) -> ClaimResult<String> {
        let encoded = header
            .and_then(|value| value.trim().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("basic"))
            .map(|(_, encoded)| encoded.trim())
            .ok_or(ClaimError::AdminUnauthorized)?;

        let decoded = STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or(ClaimError::AdminUnauthorized)?;
        let (username, password) = decoded.split_once(':').ok_or(ClaimError::AdminUnauthorized)?;

        // Both comparisons run regardless of the first result
        let user_ok = safe_eq(username, &self.username);
        let password_ok = safe_eq(password, &self.password);
        if self.password.is_empty() || !(user_ok & password_ok) {
            warn!("Rejected admin credentials for user {:?}", username);
            return Err(ClaimError::AdminUnauthorized);
        }
        Ok(username.to_string())
    }

    pub async fn stats(&self) -> ClaimResult<AdminStats> {
        let stats = self.store.allocation_stats().await?;
        let claim_percentage = if stats.total_allocations == 0 {
            0
        } else {
            ((stats.claimed_allocations as f64 / stats.total_allocations as f64) * 100.0).round() as u32
        };

        Ok(AdminStats {
            total_allocations: stats.total_allocations,
            claimed_allocations: stats.claimed_allocations,
            pending_claims: stats.total_allocations.saturating_sub(stats.claimed_allocations),
            total_value: format_amount(stats.total_minor, self.decimals),
            claimed_value: format_amount(stats.claimed_minor, self.decimals),
            claim_percentage,
        })
    }

    /// Effective gas settings: the stored override, else configuration.
    pub async fn gas_settings(&self) -> ClaimResult<GasSettingsView> {
        Ok(match self.store.gas_settings().await? {
            Some(settings) => {
                let policy = self.gas_defaults.with_settings(&settings)?;
                GasSettingsView {
                    max_gas_limit: settings.max_gas_limit,
                    max_gas_cost_eth: format_amount(policy.max_gas_cost_wei, 18),
                    source: SettingsSource::Store,
                    updated_by: Some(settings.updated_by),
                    updated_at: Some(settings.updated_at),
                }
            }
            None => GasSettingsView {
                max_gas_limit: self.gas_defaults.max_gas_limit,
                max_gas_cost_eth: format_amount(self.gas_defaults.max_gas_cost_wei, 18),
                source: SettingsSource::Config,
                updated_by: None,
                updated_at: None,
            },
        })
    }

    pub async fn update_gas_settings(&self, update: GasSettingsUpdate, actor: &str) -> ClaimResult<GasSettingsView> {
        if !GAS_LIMIT_RANGE.contains(&update.max_gas_limit) {
            return Err(ClaimError::InvalidRequest(format!(
                "maxGasLimit must be between {} and {}",
                GAS_LIMIT_RANGE.start(),
                GAS_LIMIT_RANGE.end()
            )));
        }

        let cost_wei = parse_gas_cost(&update.max_gas_cost_eth)?;
        let settings = GasSettings {
            max_gas_limit: update.max_gas_limit,
            max_gas_cost_wei: cost_wei.to_string(),
            updated_by: actor.to_string(),
            updated_at: Utc::now(),
        };
        self.store.put_gas_settings(settings).await?;
        self.audit(
            GAS_SETTINGS_ACTION,
            actor,
            json!({
                "max_gas_limit": update.max_gas_limit,
                "max_gas_cost_wei": cost_wei.to_string(),
            }),
        )
        .await?;

        info!(
            "Gas settings updated by {}: limit {}, cost cap {} ETH",
            actor, update.max_gas_limit, update.max_gas_cost_eth
        );
        self.gas_settings().await
    }

    /// Forget every limiter window.
    pub async fn reset_rate_limits(&self, actor: &str) -> ClaimResult<usize> {
        let cleared = self.limiter.tracked_keys();
        self.limiter.reset();
        self.audit(RATE_LIMIT_RESET_ACTION, actor, json!({ "cleared_keys": cleared }))
            .await?;
        info!("Rate limits reset by {} ({} keys)", actor, cleared);
        Ok(cleared)
    }

    async fn audit(&self, action: &str, actor: &str, details: serde_json::Value) -> ClaimResult<()> {
        debug!("Audit {} by {}", action, actor);
        self.store
            .append_audit(AuditEntry {
                id: Uuid::new_v4(),
                action: action.to_string(),
                actor: actor.to_string(),
                details,
                created_at: Utc::now(),
            })
            .await
    }
}

fn parse_gas_cost(eth: &str) -> ClaimResult<U256> {
    let invalid = || {
        ClaimError::InvalidRequest(format!(
            "maxGasCostETH must be between {} and {} ETH",
            MIN_GAS_COST_ETH, MAX_GAS_COST_ETH
        ))
    };
    let wei = parse_amount(eth, 18).map_err(|_| invalid())?;
    let min = parse_ether(MIN_GAS_COST_ETH).map_err(|_| invalid())?;
    let max = parse_ether(MAX_GAS_COST_ETH).map_err(|_| invalid())?;
    if wei < min || wei > max {
        return Err(invalid());
    }
    Ok(wei)
}

//! Gas limit and price policy for token transfers.

use crate::config::ClaimConfig;
use crate::error::{ClaimError, ClaimResult};
use crate::eth::TokenChain;
use crate::model::GasSettings;
use crate::units::{parse_minor, wei_to_gwei};
use alloy::primitives::{b256, Address, B256, U256};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Gas assumed for a plain ERC-20 transfer when estimation fails
pub const BASELINE_TRANSFER_GAS: u64 = 26_000;

/// Estimates above this indicate a token with transfer hooks or a proxy
pub const COMPLEX_TRANSFER_GAS: u64 = 50_000;

/// `bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)`
pub const EIP1967_IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

const GWEI: u128 = 1_000_000_000;

/// Effective gas limits for one transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPolicy {
    pub max_gas_limit: u64,
    pub max_gas_cost_wei: U256,
    pub max_gas_price_wei: u128,
    pub fallback_gas_price_wei: u128,
}

impl GasPolicy {
    pub fn from_config(config: &ClaimConfig) -> anyhow::Result<Self> {
        Ok(Self {
            max_gas_limit: config.gas.max_gas_limit,
            max_gas_cost_wei: config.max_gas_cost_wei()?,
            max_gas_price_wei: u128::from(config.gas.max_gas_price_gwei) * GWEI,
            fallback_gas_price_wei: u128::from(config.gas.fallback_gas_price_gwei) * GWEI,
        })
    }

    /// Apply admin overrides persisted in the store.
    pub fn with_settings(self, settings: &GasSettings) -> ClaimResult<Self> {
        Ok(Self {
            max_gas_limit: settings.max_gas_limit,
            max_gas_cost_wei: parse_minor(&settings.max_gas_cost_wei)?,
            ..self
        })
    }

    /// Choose the gas limit from an estimate (`None` when estimation failed).
    pub fn gas_limit(&self, estimate: Option<u64>) -> u64 {
        match estimate {
            None => BASELINE_TRANSFER_GAS,
            Some(estimate) if estimate > COMPLEX_TRANSFER_GAS => self.max_gas_limit,
            Some(estimate) => estimate.max(BASELINE_TRANSFER_GAS),
        }
    }

    /// Choose the gas price from the node's answer (`None` when the query failed).
    pub fn gas_price(&self, reported: Option<u128>) -> u128 {
        reported
            .unwrap_or(self.fallback_gas_price_wei)
            .min(self.max_gas_price_wei)
    }
}

/// Gas figures for a specific transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasQuote {
    pub gas_limit: u64,
    pub gas_price_wei: u128,
    pub cost_wei: U256,
}

impl GasQuote {
    pub fn new(gas_limit: u64, gas_price_wei: u128) -> Self {
        Self {
            gas_limit,
            gas_price_wei,
            cost_wei: U256::from(gas_limit) * U256::from(gas_price_wei),
        }
    }

    pub fn exceeds(&self, policy: &GasPolicy) -> bool {
        self.cost_wei > policy.max_gas_cost_wei
    }
}

/// Whether deployed bytecode references the EIP-1967 implementation slot.
pub fn looks_like_proxy(code: &[u8]) -> bool {
    code.windows(32)
        .any(|window| window == EIP1967_IMPLEMENTATION_SLOT.as_slice())
}

/// Estimate gas and price for `transfer(to, amount)`. Estimation and price failures fall back
/// to policy defaults; a node that does not answer in time is an error.
pub async fn quote_transfer(
    chain: &dyn TokenChain,
    policy: &GasPolicy,
    to: Address,
    amount: U256,
    rpc_timeout: Duration,
) -> ClaimResult<GasQuote> {
    let estimate = match timeout(rpc_timeout, chain.estimate_transfer_gas(to, amount)).await {
        Ok(Ok(estimate)) => Some(estimate),
        Ok(Err(e)) => {
            warn!("Gas estimation failed, using baseline {}: {}", BASELINE_TRANSFER_GAS, e);
            None
        }
        Err(_) => return Err(ClaimError::RpcTimeout("estimateGas")),
    };

    if let Some(estimate) = estimate.filter(|e| *e > COMPLEX_TRANSFER_GAS) {
        match timeout(rpc_timeout, chain.contract_code()).await {
            Ok(Ok(code)) if looks_like_proxy(&code) => info!(
                "Transfer estimate {} above {}; token looks like an EIP-1967 proxy, capping at {}",
                estimate, COMPLEX_TRANSFER_GAS, policy.max_gas_limit
            ),
            Ok(Ok(_)) => info!(
                "Transfer estimate {} above {}; capping at {}",
                estimate, COMPLEX_TRANSFER_GAS, policy.max_gas_limit
            ),
            Ok(Err(e)) => debug!("Proxy check skipped: {}", e),
            Err(_) => debug!("Proxy check skipped: getCode timed out"),
        }
    }

    let reported = match timeout(rpc_timeout, chain.gas_price()).await {
        Ok(Ok(price)) => Some(price),
        Ok(Err(e)) => {
            warn!(
                "Gas price query failed, using fallback {} gwei: {}",
                wei_to_gwei(policy.fallback_gas_price_wei),
                e
            );
            None
        }
        Err(_) => return Err(ClaimError::RpcTimeout("gasPrice")),
    };

    let quote = GasQuote::new(policy.gas_limit(estimate), policy.gas_price(reported));
    debug!(
        "Gas quote: limit {} at {} gwei, cost {} wei",
        quote.gas_limit,
        wei_to_gwei(quote.gas_price_wei),
        quote.cost_wei
    );
    Ok(quote)
}

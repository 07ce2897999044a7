//! Ethereum integration: the ERC-20 token contract and the distributor wallet.

use crate::config::ClaimConfig;
use crate::error::{ClaimError, ClaimResult};
use alloy::{
    network::EthereumWallet,
    primitives::{Address, Bytes, TxHash, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
};
use async_trait::async_trait;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IERC20 {
        function decimals() external view returns (uint8);
        function symbol() external view returns (string);
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

use IERC20::IERC20Instance;

/// Failures reported by the chain client
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("RPC request failed: {0}")]
    Rpc(String),

    #[error("Contract call failed: {0}")]
    Contract(String),

    #[error("Gas estimation failed: {0}")]
    Estimate(String),

    #[error("Transaction submission failed: {0}")]
    Submit(String),

    #[error("Invalid chain configuration: {0}")]
    Config(String),
}

/// The operations the distribution pipeline needs from the node
#[async_trait]
pub trait TokenChain: Send + Sync {
    /// Address of the wallet funding all transfers
    fn distributor(&self) -> Address;

    /// Address of the token contract
    fn token(&self) -> Address;

    /// Deployed bytecode of the token contract (empty when nothing is deployed)
    async fn contract_code(&self) -> Result<Bytes, ChainError>;

    async fn token_decimals(&self) -> Result<u8, ChainError>;

    async fn token_symbol(&self) -> Result<String, ChainError>;

    async fn token_balance(&self, owner: Address) -> Result<U256, ChainError>;

    async fn native_balance(&self, owner: Address) -> Result<U256, ChainError>;

    /// Gas estimate for `transfer(to, amount)` sent from the distributor
    async fn estimate_transfer_gas(&self, to: Address, amount: U256) -> Result<u64, ChainError>;

    /// Current network gas price in wei
    async fn gas_price(&self) -> Result<u128, ChainError>;

    /// Sign and broadcast `transfer(to, amount)`. Returns once the node accepted it.
    async fn send_transfer(&self, to: Address, amount: U256, gas_limit: u64) -> Result<TxHash, ChainError>;

    /// `Some(success)` once mined, `None` while unknown or pending
    async fn transfer_receipt(&self, tx_hash: TxHash) -> Result<Option<bool>, ChainError>;
}

/// alloy-backed chain client signing with the distributor key
pub struct AlloyChain {
    provider: DynProvider,
    token: IERC20Instance<DynProvider>,
    distributor: Address,
}

impl std::fmt::Debug for AlloyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlloyChain")
            .field("token", self.token.address())
            .field("distributor", &self.distributor)
            .finish()
    }
}

impl AlloyChain {
    pub fn new(config: &ClaimConfig) -> Result<Self, ChainError> {
        let private_key = config
            .ethereum
            .private_key
            .strip_prefix("0x")
            .unwrap_or(&config.ethereum.private_key);
        let signer = PrivateKeySigner::from_str(private_key)
            .map_err(|e| ChainError::Config(format!("Invalid private key: {}", e)))?;
        let distributor = signer.address();

        let url = url::Url::parse(&config.ethereum.rpc_url)
            .map_err(|e| ChainError::Config(format!("Invalid RPC URL: {}", e)))?;
        let token_address = config
            .token_address()
            .map_err(|e| ChainError::Config(e.to_string()))?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        let token = IERC20::new(token_address, provider.clone());

        info!(
            "Chain client ready: token {} on chain {}, distributor {}",
            token_address, config.ethereum.chain_id, distributor
        );

        Ok(Self {
            provider,
            token,
            distributor,
        })
    }
}

fn rpc_error(e: impl std::fmt::Display) -> ChainError {
    ChainError::Rpc(e.to_string())
}

fn contract_error(e: impl std::fmt::Display) -> ChainError {
    ChainError::Contract(e.to_string())
}

#[async_trait]
impl TokenChain for AlloyChain {
    fn distributor(&self) -> Address {
        self.distributor
    }

    fn token(&self) -> Address {
        *self.token.address()
    }

    async fn contract_code(&self) -> Result<Bytes, ChainError> {
        self.provider
            .get_code_at(*self.token.address())
            .await
            .map_err(rpc_error)
    }

    async fn token_decimals(&self) -> Result<u8, ChainError> {
        self.token.decimals().call().await.map_err(contract_error)
    }

    async fn token_symbol(&self) -> Result<String, ChainError> {
        self.token.symbol().call().await.map_err(contract_error)
    }

    async fn token_balance(&self, owner: Address) -> Result<U256, ChainError> {
        self.token.balanceOf(owner).call().await.map_err(contract_error)
    }

    async fn native_balance(&self, owner: Address) -> Result<U256, ChainError> {
        self.provider.get_balance(owner).await.map_err(rpc_error)
    }

    async fn estimate_transfer_gas(&self, to: Address, amount: U256) -> Result<u64, ChainError> {
        self.token
            .transfer(to, amount)
            .from(self.distributor)
            .estimate_gas()
            .await
            .map_err(|e| ChainError::Estimate(e.to_string()))
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.provider.get_gas_price().await.map_err(rpc_error)
    }

    async fn send_transfer(&self, to: Address, amount: U256, gas_limit: u64) -> Result<TxHash, ChainError> {
        let pending = self
            .token
            .transfer(to, amount)
            .from(self.distributor)
            .gas(gas_limit)
            .send()
            .await
            .map_err(|e| ChainError::Submit(e.to_string()))?;

        let tx_hash = *pending.tx_hash();
        debug!("Transfer submitted: {:#x}", tx_hash);
        Ok(tx_hash)
    }

    async fn transfer_receipt(&self, tx_hash: TxHash) -> Result<Option<bool>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc_error)?;
        Ok(receipt.map(|receipt| receipt.status()))
    }
}

/// Validate a `0x`-prefixed 40-hex-digit address. Mixed-case input must carry a valid
/// EIP-55 checksum; all-lowercase and all-uppercase input is accepted as is.
pub fn validate_address(address: &str) -> ClaimResult<Address> {
    let invalid = || ClaimError::InvalidEthereumAddress(address.to_string());

    let digits = address.strip_prefix("0x").ok_or_else(invalid)?;
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let has_lower = digits.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = digits.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return Address::parse_checksummed(address, None).map_err(|_| invalid());
    }

    Address::from_str(address).map_err(|_| invalid())
}

/// Format a transaction hash as `0x`-prefixed lowercase hex.
pub fn format_tx_hash(tx_hash: &TxHash) -> String {
    format!("{:#x}", tx_hash)
}

/// Parse a stored transaction hash.
pub fn parse_tx_hash(tx_hash: &str) -> ClaimResult<TxHash> {
    TxHash::from_str(tx_hash)
        .map_err(|e| ClaimError::Storage(format!("Corrupt stored tx hash {:?}: {}", tx_hash, e)))
}

/// Scriptable in-process chain for tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use alloy::primitives::keccak256;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) struct FakeChain {
        pub distributor: Address,
        pub token: Address,
        pub code: Bytes,
        pub decimals: u8,
        pub symbol: String,
        pub token_balance: U256,
        pub native_balance: U256,
        /// `None` makes estimation fail
        pub estimate: Option<u64>,
        /// `None` makes the gas price query fail
        pub gas_price: Option<u128>,
        /// Receipt status recorded for each newly sent transfer; `None` never mines
        pub mined_status: Option<bool>,
        /// Delay inside `send_transfer`, to widen race windows
        pub send_delay: Duration,
        /// Delay inside every read, to trigger timeouts
        pub read_delay: Duration,
        pub receipts: Mutex<HashMap<TxHash, Option<bool>>>,
        pub transfers: Mutex<Vec<(Address, U256, u64)>>,
    }

    impl Default for FakeChain {
        fn default() -> Self {
            Self {
                distributor: Address::repeat_byte(0xd1),
                token: Address::repeat_byte(0x70),
                code: Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]),
                decimals: 18,
                symbol: "GOC".to_string(),
                token_balance: U256::MAX,
                native_balance: U256::from(10u64).pow(U256::from(18)),
                estimate: Some(35_000),
                gas_price: Some(10_000_000_000),
                mined_status: Some(true),
                send_delay: Duration::ZERO,
                read_delay: Duration::ZERO,
                receipts: Mutex::new(HashMap::new()),
                transfers: Mutex::new(Vec::new()),
            }
        }
    }

    impl FakeChain {
        pub(crate) fn transfer_count(&self) -> usize {
            self.transfers.lock().unwrap().len()
        }

        pub(crate) fn set_receipt(&self, tx_hash: TxHash, status: Option<bool>) {
            self.receipts.lock().unwrap().insert(tx_hash, status);
        }

        async fn read_pause(&self) {
            if !self.read_delay.is_zero() {
                tokio::time::sleep(self.read_delay).await;
            }
        }
    }

    #[async_trait]
    impl TokenChain for FakeChain {
        fn distributor(&self) -> Address {
            self.distributor
        }

        fn token(&self) -> Address {
            self.token
        }

        async fn contract_code(&self) -> Result<Bytes, ChainError> {
            self.read_pause().await;
            Ok(self.code.clone())
        }

        async fn token_decimals(&self) -> Result<u8, ChainError> {
            self.read_pause().await;
            Ok(self.decimals)
        }

        async fn token_symbol(&self) -> Result<String, ChainError> {
            Ok(self.symbol.clone())
        }

        async fn token_balance(&self, _owner: Address) -> Result<U256, ChainError> {
            self.read_pause().await;
            Ok(self.token_balance)
        }

        async fn native_balance(&self, _owner: Address) -> Result<U256, ChainError> {
            self.read_pause().await;
            Ok(self.native_balance)
        }

        async fn estimate_transfer_gas(&self, _to: Address, _amount: U256) -> Result<u64, ChainError> {
            self.read_pause().await;
            self.estimate
                .ok_or_else(|| ChainError::Estimate("execution reverted".to_string()))
        }

        async fn gas_price(&self) -> Result<u128, ChainError> {
            self.read_pause().await;
            self.gas_price
                .ok_or_else(|| ChainError::Rpc("eth_gasPrice unavailable".to_string()))
        }

        async fn send_transfer(&self, to: Address, amount: U256, gas_limit: u64) -> Result<TxHash, ChainError> {
            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            let mut transfers = self.transfers.lock().unwrap();
            transfers.push((to, amount, gas_limit));
            let tx_hash = keccak256(transfers.len().to_be_bytes());
            self.set_receipt(tx_hash, self.mined_status);
            Ok(tx_hash)
        }

        async fn transfer_receipt(&self, tx_hash: TxHash) -> Result<Option<bool>, ChainError> {
            Ok(self.receipts.lock().unwrap().get(&tx_hash).copied().flatten())
        }
    }
}

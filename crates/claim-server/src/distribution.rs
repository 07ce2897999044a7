//! Balance- and gas-bounded token distribution with idempotent finalization.

use crate::config::ClaimConfig;
use crate::email::{ClaimReceiptMail, Mailer};
use crate::error::{ClaimError, ClaimResult, FundsShortage};
use crate::eth::{format_tx_hash, parse_tx_hash, validate_address, TokenChain};
use crate::gas::{quote_transfer, GasPolicy, GasQuote};
use crate::model::{Allocation, ClaimStatus, PendingTransfer};
use crate::secrets::{EmailIdentifier, Secrets};
use crate::store::{ClaimStore, MarkClaimed};
use crate::units::{format_amount, wei_to_gwei};
use alloy::primitives::{Address, TxHash, U256};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of a claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReceipt {
    pub tx_hash: String,
    pub already_claimed: bool,
}

/// Token contract health as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenHealth {
    pub healthy: bool,
    pub contract: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct DistributionEngine {
    store: Arc<dyn ClaimStore>,
    chain: Arc<dyn TokenChain>,
    mailer: Arc<dyn Mailer>,
    secrets: Arc<Secrets>,
    symbol: String,
    decimals: u8,
    gas_defaults: GasPolicy,
    rpc_timeout: Duration,
    receipt_timeout: Duration,
    receipt_poll_interval: Duration,
    claim_locks: DashMap<EmailIdentifier, Arc<Mutex<()>>>,
    signer_lock: Mutex<()>,
}

impl DistributionEngine {
    pub fn new(
        config: &ClaimConfig,
        store: Arc<dyn ClaimStore>,
        chain: Arc<dyn TokenChain>,
        mailer: Arc<dyn Mailer>,
        secrets: Arc<Secrets>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            chain,
            mailer,
            secrets,
            symbol: config.token.symbol.clone(),
            decimals: config.token.decimals,
            gas_defaults: GasPolicy::from_config(config)?,
            rpc_timeout: Duration::from_secs(config.ethereum.rpc_timeout_secs),
            receipt_timeout: Duration::from_secs(config.ethereum.receipt_timeout_secs),
            receipt_poll_interval: RECEIPT_POLL_INTERVAL,
            claim_locks: DashMap::new(),
            signer_lock: Mutex::new(()),
        })
    }

    /// Gas limits from configuration, without admin overrides
    pub fn gas_defaults(&self) -> GasPolicy {
        self.gas_defaults
    }

    /// Current allocation and claimed history for an identifier.
    pub async fn status(&self, identifier: &EmailIdentifier) -> ClaimResult<ClaimStatus> {
        let rows = self.store.allocations(identifier).await?;
        ClaimStatus::from_rows(&rows, &self.symbol)?.ok_or(ClaimError::AllocationNotFound)
    }

    /// Check the token contract: bytecode deployed and decimals as configured.
    pub async fn health(&self) -> TokenHealth {
        let contract = self.chain.token().to_string();
        match self.check_token().await {
            Ok((symbol, decimals)) => TokenHealth {
                healthy: true,
                contract,
                symbol: Some(symbol),
                decimals: Some(decimals),
                reason: None,
            },
            Err(e) => {
                warn!("Token health check failed: {}", e);
                let reason = match e {
                    ClaimError::Unavailable(reason) => reason,
                    ClaimError::RpcTimeout(_) => "RPC node did not respond in time".to_string(),
                    _ => "RPC node unavailable".to_string(),
                };
                TokenHealth {
                    healthy: false,
                    contract,
                    symbol: None,
                    decimals: None,
                    reason: Some(reason),
                }
            }
        }
    }

    async fn check_token(&self) -> ClaimResult<(String, u8)> {
        let code = self.rpc("getCode", self.chain.contract_code()).await?;
        if code.is_empty() {
            return Err(ClaimError::Unavailable(
                "No contract deployed at the token address".to_string(),
            ));
        }

        let decimals = self.rpc("decimals", self.chain.token_decimals()).await?;
        if decimals != self.decimals {
            return Err(ClaimError::Unavailable(format!(
                "Token reports {} decimals, expected {}",
                decimals, self.decimals
            )));
        }

        let symbol = match self.rpc("symbol", self.chain.token_symbol()).await {
            Ok(symbol) => symbol,
            Err(e) => {
                debug!("Falling back to configured symbol: {}", e);
                self.symbol.clone()
            }
        };
        Ok((symbol, decimals))
    }

    /// Transfer the identifier's unclaimed allocation to `recipient`, or replay the hash of the
    /// transfer that already settled it.
    pub async fn claim(&self, identifier: &EmailIdentifier, recipient: &str) -> ClaimResult<ClaimReceipt> {
        let recipient = validate_address(recipient)?;
        self.check_token().await?;

        let lock = self.claim_lock(identifier);
        let _guard = lock.lock().await;
        self.claim_locked(identifier, recipient).await
    }

    fn claim_lock(&self, identifier: &EmailIdentifier) -> Arc<Mutex<()>> {
        self.claim_locks
            .entry(identifier.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop lock entries nobody holds or waits on. Returns the number removed.
    pub fn prune_claim_locks(&self) -> usize {
        let before = self.claim_locks.len();
        self.claim_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.claim_locks.len())
    }

    async fn claim_locked(&self, identifier: &EmailIdentifier, recipient: Address) -> ClaimResult<ClaimReceipt> {
        let rows = self.store.allocations(identifier).await?;
        // A transfer already in flight is settled before the open row is touched
        let current = rows
            .iter()
            .find(|row| !row.claimed && row.pending_transfer.is_some())
            .or_else(|| rows.iter().find(|row| row.is_open()));
        let Some(row) = current else {
            return match rows.first().and_then(|row| row.claimed_tx_hash.clone()) {
                Some(tx_hash) => {
                    info!("Replaying settled claim for {}: {}", identifier, tx_hash);
                    Ok(ClaimReceipt {
                        tx_hash,
                        already_claimed: true,
                    })
                }
                None => Err(ClaimError::AllocationNotFound),
            };
        };

        if let Some(pending) = &row.pending_transfer {
            return self.reconcile_pending(row, pending, recipient).await;
        }

        let amount = row.amount()?;
        let policy = self.gas_policy().await?;
        let quote = quote_transfer(self.chain.as_ref(), &policy, recipient, amount, self.rpc_timeout).await?;

        self.ensure_funds(amount, &quote).await?;

        if quote.exceeds(&policy) {
            warn!(
                "Gas cost {} wei ({} gas at {} gwei) exceeds cap {} wei; claim for {} deferred",
                quote.cost_wei,
                quote.gas_limit,
                wei_to_gwei(quote.gas_price_wei),
                policy.max_gas_cost_wei,
                identifier
            );
            return Err(ClaimError::GasTooHigh {
                estimated_wei: quote.cost_wei.to_string(),
                max_wei: policy.max_gas_cost_wei.to_string(),
            });
        }

        let transfer = self.submit_and_confirm(row, recipient, amount, &quote).await?;
        self.finalize(row, &transfer).await
    }

    async fn gas_policy(&self) -> ClaimResult<GasPolicy> {
        match self.store.gas_settings().await? {
            Some(settings) => self.gas_defaults.with_settings(&settings),
            None => Ok(self.gas_defaults),
        }
    }

    async fn ensure_funds(&self, amount: U256, quote: &GasQuote) -> ClaimResult<()> {
        let distributor = self.chain.distributor();
        let token_balance = self
            .rpc("balanceOf", self.chain.token_balance(distributor))
            .await?;
        let native_balance = self
            .rpc("getBalance", self.chain.native_balance(distributor))
            .await?;

        let shortage = match (token_balance < amount, native_balance < quote.cost_wei) {
            (false, false) => return Ok(()),
            (true, false) => FundsShortage::Token,
            (false, true) => FundsShortage::Gas,
            (true, true) => FundsShortage::Both,
        };

        error!(
            "Distributor {} short on funds ({:?}): token balance {} needs {}, native balance {} wei needs {} wei",
            distributor, shortage, token_balance, amount, native_balance, quote.cost_wei
        );
        Err(ClaimError::InsufficientFunds(shortage))
    }

    /// Send the transfer and wait for its receipt while holding the signer lock.
    async fn submit_and_confirm(
        &self,
        row: &Allocation,
        recipient: Address,
        amount: U256,
        quote: &GasQuote,
    ) -> ClaimResult<PendingTransfer> {
        let _signer = self.signer_lock.lock().await;

        let tx_hash = match timeout(
            self.rpc_timeout,
            self.chain.send_transfer(recipient, amount, quote.gas_limit),
        )
        .await
        {
            Ok(Ok(tx_hash)) => tx_hash,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                error!(
                    "Transfer submission for allocation {} timed out; outcome unknown",
                    row.id
                );
                return Err(ClaimError::TransferFailed("submission timed out".to_string()));
            }
        };
        let tx_hash_str = format_tx_hash(&tx_hash);
        info!(
            "Submitted transfer {} of {} to {} for allocation {}",
            tx_hash_str, amount, recipient, row.id
        );

        let transfer = PendingTransfer {
            tx_hash: tx_hash_str.clone(),
            recipient: recipient.to_checksum(None),
            amount_minor: amount.to_string(),
        };
        self.store
            .set_pending_transfer(&row.identifier, row.id, Some(transfer.clone()))
            .await?;

        match self.wait_for_receipt(tx_hash).await {
            Some(true) => Ok(transfer),
            Some(false) => {
                error!("Transfer {} reverted", tx_hash_str);
                self.store
                    .set_pending_transfer(&row.identifier, row.id, None)
                    .await?;
                Err(ClaimError::TransferFailed(format!("{} reverted", tx_hash_str)))
            }
            None => {
                error!(
                    "Transfer {} not confirmed within {:?}; left pending",
                    tx_hash_str, self.receipt_timeout
                );
                Err(ClaimError::TransferFailed(format!(
                    "{} not confirmed in time",
                    tx_hash_str
                )))
            }
        }
    }

    /// Poll for a receipt until the receipt timeout elapses.
    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Option<bool> {
        let poll = async {
            loop {
                match self.chain.transfer_receipt(tx_hash).await {
                    Ok(Some(status)) => return status,
                    Ok(None) => {}
                    Err(e) => debug!("Receipt poll for {:#x} failed: {}", tx_hash, e),
                }
                tokio::time::sleep(self.receipt_poll_interval).await;
            }
        };
        timeout(self.receipt_timeout, poll).await.ok()
    }

    /// Resolve a previously submitted transfer instead of sending a new one. The receipt names
    /// the address that transfer went to, whatever this request asked for.
    async fn reconcile_pending(
        &self,
        row: &Allocation,
        pending: &PendingTransfer,
        requested: Address,
    ) -> ClaimResult<ClaimReceipt> {
        let tx_hash = parse_tx_hash(&pending.tx_hash)?;
        match self.rpc("getTransactionReceipt", self.chain.transfer_receipt(tx_hash)).await? {
            Some(true) => {
                info!("Pending transfer {} confirmed for allocation {}", pending.tx_hash, row.id);
                if !pending.recipient.eq_ignore_ascii_case(&requested.to_string()) {
                    warn!(
                        "Claim for {} asked for {}, settled transfer went to {}",
                        row.identifier, requested, pending.recipient
                    );
                }
                self.finalize(row, pending).await
            }
            Some(false) => {
                error!("Pending transfer {} reverted for allocation {}", pending.tx_hash, row.id);
                self.store
                    .set_pending_transfer(&row.identifier, row.id, None)
                    .await?;
                Err(ClaimError::TransferFailed(format!("{} reverted", pending.tx_hash)))
            }
            None => Err(ClaimError::TransferPending(pending.tx_hash.clone())),
        }
    }

    /// Mark the row claimed for what was sent. A concurrent winner's hash is replayed.
    async fn finalize(&self, row: &Allocation, transfer: &PendingTransfer) -> ClaimResult<ClaimReceipt> {
        let transferred = transfer.amount()?;
        match self
            .store
            .mark_claimed(&row.identifier, row.id, &transfer.tx_hash, transferred)
            .await?
        {
            MarkClaimed::Marked => {
                info!("Allocation {} claimed by {} in {}", row.id, row.identifier, transfer.tx_hash);
                self.send_receipt(row, transfer, transferred).await;
                Ok(ClaimReceipt {
                    tx_hash: transfer.tx_hash.clone(),
                    already_claimed: false,
                })
            }
            MarkClaimed::AlreadyClaimed { tx_hash: winner } => {
                warn!("Allocation {} was already claimed; replaying winner", row.id);
                Ok(ClaimReceipt {
                    tx_hash: winner.unwrap_or_else(|| transfer.tx_hash.clone()),
                    already_claimed: true,
                })
            }
        }
    }

    async fn send_receipt(&self, row: &Allocation, transfer: &PendingTransfer, amount: U256) {
        let lookup = match self.store.email_lookup(&row.identifier).await {
            Ok(Some(lookup)) => lookup,
            Ok(None) => {
                debug!("No email on file for {}; skipping receipt", row.identifier);
                return;
            }
            Err(e) => {
                warn!("Email lookup for {} failed: {}", row.identifier, e);
                return;
            }
        };

        let email = match self.secrets.decrypt_pii(&lookup.email_encrypted) {
            Ok(email) => email,
            Err(e) => {
                warn!("Could not decrypt email for {}: {}", row.identifier, e);
                return;
            }
        };

        let receipt = ClaimReceiptMail {
            amount: format_amount(amount, row.decimals),
            symbol: self.symbol.clone(),
            tx_hash: transfer.tx_hash.clone(),
            recipient: transfer.recipient.clone(),
        };
        if let Err(e) = self.mailer.send_claim_receipt(&email, &receipt).await {
            warn!("Claim receipt for {} not delivered: {}", row.identifier, e);
        }
    }

    /// Bound an RPC read by the configured timeout.
    async fn rpc<T, E>(&self, call: &'static str, request: impl Future<Output = Result<T, E>>) -> ClaimResult<T>
    where
        ClaimError: From<E>,
    {
        match timeout(self.rpc_timeout, request).await {
            Ok(result) => result.map_err(ClaimError::from),
            Err(_) => {
                warn!("RPC call {} timed out after {:?}", call, self.rpc_timeout);
                Err(ClaimError::RpcTimeout(call))
            }
        }
    }
}

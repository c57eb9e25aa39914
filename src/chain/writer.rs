//! Transaction submission from the operator key.
//!
//! The writer owns the operator's nonce: it is fetched once from the
//! pending transaction count, then incremented locally on every accepted
//! submission. A rejected submission, or a transaction whose receipt never
//! shows up, clears it so the next call re-syncs with the node.
//! Confirmation polls for the receipt until it appears or the configured
//! timeout elapses.

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::contracts::encode_call;
use super::{ChainWriter, ContractCall, Receipt, RelayMode, StepFailure, TxHandle};
use crate::config::OperatorKey;

/// Confirmation settings.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// `ChainWriter` signing with the operator key over HTTP.
pub struct EvmWriter {
    provider: DynProvider,
    sender: Address,
    factory: Address,
    relay: RelayMode,
    chain_id: Option<u64>,
    confirm: ConfirmPolicy,
    next_nonce: Mutex<Option<u64>>,
}

impl EvmWriter {
    pub fn new(
        rpc_url: &str,
        key: &OperatorKey,
        factory: Address,
        relay: RelayMode,
        chain_id: Option<u64>,
        confirm: ConfirmPolicy,
    ) -> Result<Self> {
        let signer = key.signer()?;
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(
                rpc_url
                    .parse()
                    .with_context(|| format!("Invalid RPC URL: {rpc_url}"))?,
            )
            .erased();

        Ok(Self::with_provider(
            provider,
            key.address(),
            factory,
            relay,
            chain_id,
            confirm,
        ))
    }

    /// Writer over an already built provider that signs for `sender`.
    pub fn with_provider(
        provider: DynProvider,
        sender: Address,
        factory: Address,
        relay: RelayMode,
        chain_id: Option<u64>,
        confirm: ConfirmPolicy,
    ) -> Self {
        Self {
            provider,
            sender,
            factory,
            relay,
            chain_id,
            confirm,
            next_nonce: Mutex::new(None),
        }
    }

    /// Forget the local nonce. A dropped transaction leaves a gap the node
    /// will never fill, so the next submit has to ask again.
    async fn resync_nonce(&self) {
        *self.next_nonce.lock().await = None;
    }

    async fn fetch_nonce(&self, label: &'static str) -> Result<u64, StepFailure> {
        self.provider
            .get_transaction_count(self.sender)
            .pending()
            .await
            .map_err(|e| StepFailure::Submit {
                label,
                reason: format!("nonce lookup failed: {e}"),
            })
    }
}

#[async_trait]
impl ChainWriter for EvmWriter {
    async fn submit(&self, call: ContractCall) -> Result<TxHandle, StepFailure> {
        let label = call.label();
        let (to, data) = encode_call(self.relay, self.factory, &call);

        // Held across the send so two submissions can never share a nonce.
        let mut next = self.next_nonce.lock().await;
        let nonce = match *next {
            Some(n) => n,
            None => self.fetch_nonce(label).await?,
        };

        let mut tx = TransactionRequest::default()
            .with_from(self.sender)
            .with_to(to)
            .with_input(data)
            .with_nonce(nonce);
        if let Some(id) = self.chain_id {
            tx = tx.with_chain_id(id);
        }

        match self.provider.send_transaction(tx).await {
            Ok(pending) => {
                *next = Some(nonce + 1);
                let handle = TxHandle {
                    hash: *pending.tx_hash(),
                    nonce,
                    label,
                };
                info!(tx = %handle.hash, nonce, call = label, "Transaction sent");
                Ok(handle)
            }
            Err(e) => {
                *next = None;
                warn!(nonce, call = label, error = %e, "Transaction rejected");
                Err(StepFailure::Submit {
                    label,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn confirm(&self, handle: &TxHandle) -> Result<Receipt, StepFailure> {
        let started = Instant::now();
        let poll = async {
            loop {
                match self.provider.get_transaction_receipt(handle.hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => {
                        debug!(tx = %handle.hash, "Receipt not yet available");
                        tokio::time::sleep(self.confirm.poll_interval).await;
                    }
                    Err(e) => {
                        return Err(StepFailure::Receipt {
                            label: handle.label,
                            hash: handle.hash,
                            reason: e.to_string(),
                        })
                    }
                }
            }
        };

        let receipt = match tokio::time::timeout(self.confirm.timeout, poll).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(failure)) => {
                warn!(tx = %handle.hash, call = handle.label, error = %failure, "Receipt lookup failed");
                self.resync_nonce().await;
                return Err(failure);
            }
            Err(_) => {
                warn!(tx = %handle.hash, call = handle.label, "Confirmation timed out");
                self.resync_nonce().await;
                return Err(StepFailure::Timeout {
                    label: handle.label,
                    hash: handle.hash,
                    waited: started.elapsed(),
                });
            }
        };

        if !receipt.status() {
            return Err(StepFailure::Reverted {
                label: handle.label,
                hash: handle.hash,
            });
        }

        info!(
            tx = %handle.hash,
            block = ?receipt.block_number,
            gas_used = receipt.gas_used,
            "Transaction confirmed"
        );

        Ok(Receipt {
            hash: handle.hash,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
        })
    }

    fn sender(&self) -> Address {
        self.sender
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

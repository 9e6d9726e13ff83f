use anyhow::{anyhow, Result};
use async_trait::async_trait;
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use solana_transaction_status::TransactionStatus;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{TokenAmount, TokenMetadata, NATIVE_MINT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    pub skip_preflight: bool,
    /// Leave `None` to let the node apply its own rebroadcast policy.
    pub max_retries: Option<usize>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self { skip_preflight: true, max_retries: None }
    }
}

/// What the ledger currently knows about a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Unknown to the node yet, or seen but below `confirmed`.
    Pending,
    Confirmed,
    /// Landed with an error.
    Failed(String),
}

/// Ledger capability used by the desk. Failures propagate unchanged; callers decide policy.
///
/// An instance is bound to one endpoint for its whole life. Rebinding hands back a new
/// instance, so calls already in flight keep the endpoint they started with.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    fn endpoint(&self) -> &str;

    fn with_endpoint(&self, url: &str) -> Arc<dyn LedgerRpc>;

    fn reset_to_default(&self) -> Arc<dyn LedgerRpc>;

    /// Lamports held by `owner`.
    async fn get_balance(&self, owner: &Pubkey) -> Result<u64>;

    /// `Ok(None)` when the token account does not exist or is not initialized.
    async fn get_token_account_balance(&self, account: &Pubkey) -> Result<Option<TokenAmount>>;

    async fn get_token_decimals(&self, mint: &str) -> Result<u8>;

    /// Submits a serialized signed transaction and returns its signature.
    async fn submit_transaction(&self, tx_bytes: &[u8], opts: SubmitOptions) -> Result<String>;

    async fn confirm_transaction(&self, signature: &str) -> Result<ConfirmationStatus>;
}

#[derive(Debug, Clone)]
pub struct RpcEndpoint {
    pub url: String,
    pub default_url: String,
    pub timeout: Duration,
}

impl RpcEndpoint {
    pub fn new(default_url: impl Into<String>, timeout: Duration) -> Self {
        let default_url = default_url.into();
        Self { url: default_url.clone(), default_url, timeout }
    }

    pub fn rebind(&self, url: &str) -> Self {
        Self { url: url.trim().to_string(), ..self.clone() }
    }
}

/// `LedgerRpc` over the Solana JSON-RPC client.
pub struct RpcGateway {
    endpoint: RpcEndpoint,
    rpc: RpcClient,
    /// Mint decimals never change; cached for the life of this binding.
    metadata: RwLock<HashMap<String, TokenMetadata>>,
}

impl RpcGateway {
    pub fn new(endpoint: RpcEndpoint) -> Self {
        let rpc = RpcClient::new_with_timeout_and_commitment(
            endpoint.url.clone(),
            endpoint.timeout,
            CommitmentConfig::confirmed(),
        );
        Self { endpoint, rpc, metadata: RwLock::new(HashMap::new()) }
    }

    pub fn bound(default_url: impl Into<String>, timeout: Duration) -> Arc<dyn LedgerRpc> {
        Arc::new(Self::new(RpcEndpoint::new(default_url, timeout)))
    }

    /// Mint metadata, fetched once per mint and binding. Native SOL is never fetched.
    pub async fn token_metadata(&self, mint: &str) -> Result<TokenMetadata> {
        let mint = mint.trim();
        if mint == NATIVE_MINT {
            return Ok(TokenMetadata::native());
        }
        if let Some(meta) = self.metadata.read().await.get(mint) {
            return Ok(meta.clone());
        }

        let supply = self.rpc.get_token_supply(&parse_pubkey(mint)?).await?;
        debug!(mint, decimals = supply.decimals, endpoint = %self.endpoint.url, "rpc.mint_decimals");
        let meta = TokenMetadata { mint: mint.to_string(), decimals: supply.decimals };
        self.metadata.write().await.insert(mint.to_string(), meta.clone());
        Ok(meta)
    }
}

fn parse_pubkey(raw: &str) -> Result<Pubkey> {
    Pubkey::from_str(raw.trim()).map_err(|e| anyhow!("invalid address {raw}: {e}"))
}

fn is_missing_account(err: &ClientError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("could not find account") || msg.contains("not a token account") || msg.contains("uninitialized")
}

#[async_trait]
impl LedgerRpc for RpcGateway {
    fn endpoint(&self) -> &str {
        &self.endpoint.url
    }

    fn with_endpoint(&self, url: &str) -> Arc<dyn LedgerRpc> {
        Arc::new(Self::new(self.endpoint.rebind(url)))
    }

    fn reset_to_default(&self) -> Arc<dyn LedgerRpc> {
        let default_url = self.endpoint.default_url.clone();
        Arc::new(Self::new(self.endpoint.rebind(&default_url)))
    }

    async fn get_balance(&self, owner: &Pubkey) -> Result<u64> {
        Ok(self.rpc.get_balance(owner).await?)
    }

    async fn get_token_account_balance(&self, account: &Pubkey) -> Result<Option<TokenAmount>> {
        match self.rpc.get_token_account_balance(account).await {
            Ok(ui) => {
                let amount = ui
                    .amount
                    .parse::<u64>()
                    .map_err(|e| anyhow!("bad token amount {:?}: {e}", ui.amount))?;
                Ok(Some(TokenAmount { amount, decimals: ui.decimals }))
            }
            Err(e) if is_missing_account(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_token_decimals(&self, mint: &str) -> Result<u8> {
        Ok(self.token_metadata(mint).await?.decimals)
    }

    async fn submit_transaction(&self, tx_bytes: &[u8], opts: SubmitOptions) -> Result<String> {
        let tx: VersionedTransaction = bincode::deserialize(tx_bytes)?;
        let sig = self
            .rpc
            .send_transaction_with_config(
                &tx,
                RpcSendTransactionConfig {
                    skip_preflight: opts.skip_preflight,
                    preflight_commitment: Some(CommitmentConfig::processed().commitment),
                    max_retries: opts.max_retries,
                    ..RpcSendTransactionConfig::default()
                },
            )
            .await?;
        Ok(sig.to_string())
    }

    async fn confirm_transaction(&self, signature: &str) -> Result<ConfirmationStatus> {
        let sig = Signature::from_str(signature).map_err(|e| anyhow!("invalid signature {signature}: {e}"))?;
        let statuses = self.rpc.get_signature_statuses(&[sig]).await?;
        Ok(classify_status(statuses.value.into_iter().next().flatten()))
    }
}

/// Unknown signatures and anything short of `confirmed` are still pending.
fn classify_status(status: Option<TransactionStatus>) -> ConfirmationStatus {
    let Some(status) = status else {
        return ConfirmationStatus::Pending;
    };
    if let Some(err) = status.err.as_ref() {
        return ConfirmationStatus::Failed(err.to_string());
    }
    if status.satisfies_commitment(CommitmentConfig::confirmed()) {
        ConfirmationStatus::Confirmed
    } else {
        ConfirmationStatus::Pending
    }
}

//! In-memory collaborators for unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine as _;
use rust_decimal::Decimal;
use solana_sdk::message::{Message, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{Quote, TokenAmount, TransactionFormat, NATIVE_DECIMALS, NATIVE_MINT};
use crate::error::TradeError;
use crate::pricing::{GeneratedTrade, PricingService, RateRequest, TradeRequest};
use crate::rpc::{ConfirmationStatus, LedgerRpc, SubmitOptions};
use crate::wallet::WalletSigner;

pub const TOKEN_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

pub fn quote(protocol: &str, expected_output: u64) -> Quote {
    Quote {
        protocol: protocol.to_string(),
        expected_output,
        minimum_received: expected_output * 9 / 10,
        price_impact: Decimal::new(1, 2),
        token_decimals: 6,
    }
}

pub fn unsigned_tx(payer: &Pubkey) -> VersionedTransaction {
    VersionedTransaction {
        signatures: vec![Signature::default()],
        message: VersionedMessage::Legacy(Message::new(&[], Some(payer))),
    }
}

pub fn generated_trade(payer: &Pubkey, format: TransactionFormat) -> GeneratedTrade {
    let bytes = bincode::serialize(&unsigned_tx(payer)).unwrap();
    GeneratedTrade {
        transaction: base64::engine::general_purpose::STANDARD.encode(bytes),
        format,
    }
}

// ---------------------------------------------------------------------------

pub struct MockLedger {
    pub endpoint: String,
    pub native_balance: Mutex<Result<u64, String>>,
    pub token_accounts: Mutex<HashMap<Pubkey, TokenAmount>>,
    pub token_account_error: Mutex<Option<String>>,
    pub decimals: Mutex<HashMap<String, u8>>,
    pub decimals_calls: AtomicUsize,
    pub balance_delay: Mutex<Duration>,
    pub submitted: Mutex<Vec<(Vec<u8>, SubmitOptions)>>,
    pub submit_error: Mutex<Option<String>>,
    /// Popped per confirmation check; empty means `Pending`.
    pub confirmations: Mutex<VecDeque<ConfirmationStatus>>,
    pub confirm_calls: AtomicUsize,
}

impl MockLedger {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            native_balance: Mutex::new(Ok(2_000_000_000)),
            token_accounts: Mutex::new(HashMap::new()),
            token_account_error: Mutex::new(None),
            decimals: Mutex::new(HashMap::from([(TOKEN_MINT.to_string(), 6)])),
            decimals_calls: AtomicUsize::new(0),
            balance_delay: Mutex::new(Duration::ZERO),
            submitted: Mutex::new(Vec::new()),
            submit_error: Mutex::new(None),
            confirmations: Mutex::new(VecDeque::new()),
            confirm_calls: AtomicUsize::new(0),
        }
    }

    pub fn confirm_with(&self, statuses: impl IntoIterator<Item = ConfirmationStatus>) {
        self.confirmations.lock().unwrap().extend(statuses);
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn with_endpoint(&self, url: &str) -> Arc<dyn LedgerRpc> {
        Arc::new(MockLedger::new(url))
    }

    fn reset_to_default(&self) -> Arc<dyn LedgerRpc> {
        Arc::new(MockLedger::new("mock://default"))
    }

    async fn get_balance(&self, _owner: &Pubkey) -> Result<u64> {
        let delay = *self.balance_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.native_balance.lock().unwrap().clone().map_err(|e| anyhow!(e))
    }

    async fn get_token_account_balance(&self, account: &Pubkey) -> Result<Option<TokenAmount>> {
        if let Some(err) = self.token_account_error.lock().unwrap().clone() {
            return Err(anyhow!(err));
        }
        Ok(self.token_accounts.lock().unwrap().get(account).copied())
    }

    async fn get_token_decimals(&self, mint: &str) -> Result<u8> {
        if mint == NATIVE_MINT {
            return Ok(NATIVE_DECIMALS);
        }
        self.decimals_calls.fetch_add(1, Ordering::SeqCst);
        self.decimals
            .lock()
            .unwrap()
            .get(mint)
            .copied()
            .ok_or_else(|| anyhow!("mint {mint} not found"))
    }

    async fn submit_transaction(&self, tx_bytes: &[u8], opts: SubmitOptions) -> Result<String> {
        if let Some(err) = self.submit_error.lock().unwrap().clone() {
            return Err(anyhow!(err));
        }
        let tx: VersionedTransaction = bincode::deserialize(tx_bytes)?;
        self.submitted.lock().unwrap().push((tx_bytes.to_vec(), opts));
        Ok(tx.signatures[0].to_string())
    }

    async fn confirm_transaction(&self, _signature: &str) -> Result<ConfirmationStatus> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .confirmations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConfirmationStatus::Pending))
    }
}

// ---------------------------------------------------------------------------

pub struct MockPricing {
    pub rate_calls: Mutex<Vec<RateRequest>>,
    /// Scripted answers, consumed in call order. Falls back to `default_rates`.
    pub rate_script: Mutex<VecDeque<(Duration, Result<Vec<Quote>, TradeError>)>>,
    pub default_rates: Mutex<Result<Vec<Quote>, TradeError>>,
    pub trade_calls: Mutex<Vec<TradeRequest>>,
    pub trade_response: Mutex<Option<Result<GeneratedTrade, TradeError>>>,
}

impl MockPricing {
    pub fn new() -> Self {
        Self {
            rate_calls: Mutex::new(Vec::new()),
            rate_script: Mutex::new(VecDeque::new()),
            default_rates: Mutex::new(Ok(vec![quote("raydium", 1_000), quote("pumpfun", 1_200)])),
            trade_calls: Mutex::new(Vec::new()),
            trade_response: Mutex::new(None),
        }
    }

    pub fn script_rates(&self, delay: Duration, result: Result<Vec<Quote>, TradeError>) {
        self.rate_script.lock().unwrap().push_back((delay, result));
    }

    pub fn respond_trade(&self, result: Result<GeneratedTrade, TradeError>) {
        *self.trade_response.lock().unwrap() = Some(result);
    }

    pub fn rate_call_count(&self) -> usize {
        self.rate_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PricingService for MockPricing {
    async fn rates(&self, req: RateRequest) -> Result<Vec<Quote>, TradeError> {
        self.rate_calls.lock().unwrap().push(req);
        let scripted = self.rate_script.lock().unwrap().pop_front();
        match scripted {
            Some((delay, result)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result
            }
            None => self.default_rates.lock().unwrap().clone(),
        }
    }

    async fn generate_trade(&self, req: TradeRequest) -> Result<GeneratedTrade, TradeError> {
        let payer = req.public_key.parse::<Pubkey>().unwrap_or_default();
        self.trade_calls.lock().unwrap().push(req);
        self.trade_response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(generated_trade(&payer, TransactionFormat::V0)))
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletBehaviour {
    Sign,
    Reject,
    /// Never answers, like a wallet popup left open.
    Hang,
}

pub struct MockWallet {
    pub identity: Pubkey,
    pub behaviour: WalletBehaviour,
    pub sign_calls: AtomicUsize,
}

impl MockWallet {
    pub fn new(behaviour: WalletBehaviour) -> Self {
        Self { identity: Pubkey::new_unique(), behaviour, sign_calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletSigner for MockWallet {
    fn identity(&self) -> Pubkey {
        self.identity
    }

    async fn sign_transaction(&self, mut tx: VersionedTransaction) -> Result<VersionedTransaction, TradeError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            WalletBehaviour::Sign => {
                tx.signatures[0] = Signature::new_unique();
                Ok(tx)
            }
            WalletBehaviour::Reject => Err(TradeError::SignatureRejected("User rejected the request.".into())),
            WalletBehaviour::Hang => std::future::pending().await,
        }
    }
}

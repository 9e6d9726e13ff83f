//! Trade lifecycle: selected quote -> unsigned transaction -> wallet signature
//! -> broadcast -> confirmation.
//!
//! `TradeStatus` is the single source of truth and every change goes through
//! [`TradeOrchestrator::transition`], which refuses edges the lifecycle does
//! not allow. Observers follow along on a `watch` channel.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::Rng;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::VersionedTransaction;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{Quote, TradeAction, TradeIntent, TransactionFormat, NATIVE_DECIMALS};
use crate::error::TradeError;
use crate::pricing::{GeneratedTrade, PricingService, TradeRequest};
use crate::rpc::{ConfirmationStatus, LedgerRpc, SubmitOptions};
use crate::units::{parse_amount, slippage_percent, to_base_units};
use crate::wallet::WalletSigner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeStatus {
    Idle,
    Building,
    AwaitingSignature,
    Broadcasting,
    Confirming { signature: String },
    Confirmed { signature: String },
    Failed { error: TradeError },
}

impl TradeStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TradeStatus::Idle => "idle",
            TradeStatus::Building => "building",
            TradeStatus::AwaitingSignature => "awaiting_signature",
            TradeStatus::Broadcasting => "broadcasting",
            TradeStatus::Confirming { .. } => "confirming",
            TradeStatus::Confirmed { .. } => "confirmed",
            TradeStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Confirmed { .. } | TradeStatus::Failed { .. })
    }

    /// An execution is under way and must not be disturbed.
    pub fn is_active(&self) -> bool {
        !matches!(self, TradeStatus::Idle) && !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: &TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (self, next),
            (Idle | Confirmed { .. } | Failed { .. }, Building)
                | (Building, AwaitingSignature)
                | (AwaitingSignature, Broadcasting)
                | (Broadcasting, Confirming { .. })
                | (Confirming { .. }, Confirmed { .. })
                | (Building | AwaitingSignature | Broadcasting | Confirming { .. }, Failed { .. })
                | (Confirmed { .. } | Failed { .. }, Idle)
        )
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeStatus::Idle => Ok(()),
            TradeStatus::Building => write!(f, "Generating transaction..."),
            TradeStatus::AwaitingSignature => write!(f, "Please sign the transaction..."),
            TradeStatus::Broadcasting => write!(f, "Sending transaction..."),
            TradeStatus::Confirming { .. } => write!(f, "Confirming transaction..."),
            TradeStatus::Confirmed { signature } => write!(f, "Transaction confirmed! Signature: {signature}"),
            TradeStatus::Failed { error } => write!(f, "Trade failed: {error}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeExecution {
    pub id: u64,
    pub intent: TradeIntent,
    pub quote: Quote,
    pub identity: Pubkey,
    pub unsigned_transaction: Option<Vec<u8>>,
    pub format: Option<TransactionFormat>,
    pub status: TradeStatus,
    pub signature: Option<String>,
    pub error: Option<TradeError>,
    pub started_at: DateTime<Utc>,
}

/// How long to keep asking the ledger about a broadcast signature.
#[derive(Debug, Clone)]
pub struct ConfirmPolicy {
    /// Wait before the first check; a fresh signature is never visible instantly.
    pub grace: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// Overall budget measured from the first check.
    pub timeout: Duration,
}

impl ConfirmPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            grace: Duration::from_millis(cfg.confirm_grace_ms),
            initial_backoff: Duration::from_millis(cfg.confirm_initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.confirm_max_backoff_ms),
            max_attempts: cfg.confirm_max_attempts.max(1),
            timeout: Duration::from_secs(cfg.confirm_timeout_secs),
        }
    }

    /// One look after the grace period and nothing more.
    pub fn single_check(grace: Duration) -> Self {
        Self {
            grace,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_attempts: 1,
            timeout: Duration::ZERO,
        }
    }

    /// Exponential, capped, with up to 10% jitter. `attempt` starts at 1.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self.initial_backoff.saturating_mul(exp).min(self.max_backoff);
        let jitter_ms = (base.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub confirm: ConfirmPolicy,
    pub signing_timeout: Duration,
    pub priority_fee_sol: String,
    pub max_slippage_bps: u64,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            confirm: ConfirmPolicy::from_config(cfg),
            signing_timeout: Duration::from_secs(cfg.signing_timeout_secs),
            priority_fee_sol: cfg.priority_fee_sol.clone(),
            max_slippage_bps: cfg.max_slippage_bps,
        }
    }
}

/// Everything `execute` needs, captured at the moment the user hits the button.
#[derive(Clone)]
pub struct ExecuteRequest {
    pub intent: TradeIntent,
    pub quote: Option<Quote>,
    pub wallet: Option<Arc<dyn WalletSigner>>,
}

/// An execution that passed its preconditions and is now `Building`.
pub struct StartedExecution {
    pub id: u64,
    intent: TradeIntent,
    quote: Quote,
    wallet: Arc<dyn WalletSigner>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub id: u64,
    /// Always terminal.
    pub status: TradeStatus,
}

#[derive(Default)]
struct OrchestratorState {
    next_id: u64,
    execution: Option<TradeExecution>,
}

pub struct TradeOrchestrator {
    settings: OrchestratorSettings,
    pricing: Arc<dyn PricingService>,
    state: Mutex<OrchestratorState>,
    status_tx: watch::Sender<TradeStatus>,
}

impl TradeOrchestrator {
    pub fn new(settings: OrchestratorSettings, pricing: Arc<dyn PricingService>) -> Self {
        let (status_tx, _) = watch::channel(TradeStatus::Idle);
        Self { settings, pricing, state: Mutex::new(OrchestratorState::default()), status_tx }
    }

    pub fn status(&self) -> TradeStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TradeStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.status_tx.borrow().is_active()
    }

    pub async fn current_execution(&self) -> Option<TradeExecution> {
        self.state.lock().await.execution.clone()
    }

    /// Runs one trade to a terminal state.
    ///
    /// Precondition failures come back as `Err` and leave the status untouched.
    /// Once the trade has started every failure ends in `Failed` and the call
    /// returns `Ok` with that outcome.
    pub async fn execute(&self, req: ExecuteRequest, rpc: Arc<dyn LedgerRpc>) -> Result<ExecutionOutcome, TradeError> {
        let started = self.start(req).await?;
        Ok(self.drive(started, rpc).await)
    }

    /// Takes a started execution through to `Confirmed` or `Failed`.
    pub async fn drive(&self, started: StartedExecution, rpc: Arc<dyn LedgerRpc>) -> ExecutionOutcome {
        let StartedExecution { id, intent, quote, wallet } = started;
        info!(
            execution = id,
            token = %intent.token,
            amount = %intent.amount,
            action = intent.action.as_str(),
            protocol = %quote.protocol,
            endpoint = rpc.endpoint(),
            "orchestrator.execute"
        );

        let status = match self.run(id, &intent, &quote, wallet, rpc).await {
            Ok(signature) => TradeStatus::Confirmed { signature },
            Err(error) => TradeStatus::Failed { error },
        };
        if let Err(e) = self.transition(id, status.clone()).await {
            // Only reachable if the lifecycle was already driven into a terminal state.
            warn!(execution = id, error = %e, "orchestrator.final_transition_rejected");
        }
        ExecutionOutcome { id, status: self.status() }
    }

    /// Returns to `Idle` after the terminal status has been shown.
    ///
    /// Ignored (returns false) when `id` is no longer the current execution or
    /// it has not finished yet.
    pub async fn acknowledge(&self, id: u64) -> bool {
        let mut state = self.state.lock().await;
        let Some(exec) = state.execution.as_ref() else {
            return false;
        };
        if exec.id != id || !exec.status.is_terminal() {
            return false;
        }
        state.execution = None;
        self.status_tx.send_replace(TradeStatus::Idle);
        info!(execution = id, "orchestrator.reset");
        true
    }

    /// Checks preconditions and moves to `Building`. Nothing else happens
    /// until the returned execution is driven.
    pub async fn start(&self, req: ExecuteRequest) -> Result<StartedExecution, TradeError> {
        let ExecuteRequest { intent, quote, wallet } = req;

        let Some(wallet) = wallet else {
            return Err(TradeError::precondition("Wallet not connected"));
        };
        if intent.token.is_empty() || intent.amount.is_empty() {
            return Err(TradeError::precondition("Please enter token address and amount"));
        }
        if parse_amount(&intent.amount)?.is_zero() {
            return Err(TradeError::precondition("Amount must be greater than zero"));
        }
        if intent.slippage_bps > self.settings.max_slippage_bps {
            return Err(TradeError::precondition(format!(
                "slippage {}bps exceeds the {}bps limit",
                intent.slippage_bps, self.settings.max_slippage_bps
            )));
        }
        let Some(quote) = quote else {
            return Err(TradeError::precondition("No quote selected"));
        };

        let mut state = self.state.lock().await;
        let current = self.status();
        if !current.can_transition_to(&TradeStatus::Building) {
            return Err(TradeError::precondition("A trade is already in progress"));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.execution = Some(TradeExecution {
            id,
            intent: intent.clone(),
            quote: quote.clone(),
            identity: wallet.identity(),
            unsigned_transaction: None,
            format: None,
            status: TradeStatus::Building,
            signature: None,
            error: None,
            started_at: Utc::now(),
        });
        self.status_tx.send_replace(TradeStatus::Building);
        info!(execution = id, status = "building", "orchestrator.status");
        Ok(StartedExecution { id, intent, quote, wallet })
    }

    /// The only way the status of a running execution changes.
    async fn transition(&self, id: u64, next: TradeStatus) -> Result<(), TradeError> {
        let mut state = self.state.lock().await;
        let exec = state
            .execution
            .as_mut()
            .filter(|e| e.id == id)
            .ok_or(TradeError::IllegalTransition { from: "idle", to: next.name() })?;

        if !exec.status.can_transition_to(&next) {
            return Err(TradeError::IllegalTransition { from: exec.status.name(), to: next.name() });
        }

        match &next {
            TradeStatus::Confirming { signature } | TradeStatus::Confirmed { signature } => {
                exec.signature = Some(signature.clone());
            }
            TradeStatus::Failed { error } => exec.error = Some(error.clone()),
            _ => {}
        }
        exec.status = next.clone();
        match &next {
            TradeStatus::Failed { error } => warn!(execution = id, status = next.name(), error = %error, "orchestrator.status"),
            _ => info!(execution = id, status = next.name(), "orchestrator.status"),
        }
        self.status_tx.send_replace(next);
        Ok(())
    }

    async fn run(
        &self,
        id: u64,
        intent: &TradeIntent,
        quote: &Quote,
        wallet: Arc<dyn WalletSigner>,
        rpc: Arc<dyn LedgerRpc>,
    ) -> Result<String, TradeError> {
        // Building
        let decimals = match intent.action {
            TradeAction::Buy => NATIVE_DECIMALS,
            TradeAction::Sell => rpc.get_token_decimals(&intent.token).await.map_err(TradeError::network)?,
        };
        let amount = to_base_units(&intent.amount, decimals)?;
        let trade = self
            .pricing
            .generate_trade(TradeRequest {
                protocol_identifier: Some(quote.protocol.clone()),
                token: intent.token.clone(),
                amount: amount.to_string(),
                public_key: wallet.identity().to_string(),
                action: intent.action,
                slippage: Some(slippage_percent(intent.slippage_bps)),
                sol_priority_fee: Some(self.settings.priority_fee_sol.clone()),
            })
            .await?;

        // Awaiting signature
        self.transition(id, TradeStatus::AwaitingSignature).await?;
        let (unsigned, bytes) = decode_unsigned(&trade)?;
        self.record_unsigned(id, bytes, trade.format.clone()).await;

        let signed = tokio::time::timeout(self.settings.signing_timeout, wallet.sign_transaction(unsigned))
            .await
            .map_err(|_| {
                TradeError::SignatureRejected(format!(
                    "wallet did not respond within {}s",
                    self.settings.signing_timeout.as_secs()
                ))
            })??;

        // Broadcasting
        self.transition(id, TradeStatus::Broadcasting).await?;
        let signed_bytes = bincode::serialize(&signed).map_err(|e| TradeError::InvalidTransaction(e.to_string()))?;
        let signature = rpc
            .submit_transaction(&signed_bytes, SubmitOptions { skip_preflight: true, max_retries: None })
            .await
            .map_err(|e| TradeError::BroadcastFailed(e.to_string()))?;

        // Confirming
        self.transition(id, TradeStatus::Confirming { signature: signature.clone() }).await?;
        self.await_confirmation(id, rpc.as_ref(), &signature).await?;
        Ok(signature)
    }

    async fn record_unsigned(&self, id: u64, bytes: Vec<u8>, format: TransactionFormat) {
        let mut state = self.state.lock().await;
        if let Some(exec) = state.execution.as_mut().filter(|e| e.id == id) {
            exec.unsigned_transaction = Some(bytes);
            exec.format = Some(format);
        }
    }

    async fn await_confirmation(&self, id: u64, rpc: &dyn LedgerRpc, signature: &str) -> Result<(), TradeError> {
        let policy = &self.settings.confirm;
        tokio::time::sleep(policy.grace).await;

        let deadline = Instant::now() + policy.timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match rpc.confirm_transaction(signature).await {
                Ok(ConfirmationStatus::Confirmed) => return Ok(()),
                Ok(ConfirmationStatus::Failed(reason)) => {
                    return Err(TradeError::TransactionFailed { signature: signature.to_string(), reason });
                }
                Ok(ConfirmationStatus::Pending) => debug!(execution = id, attempt, signature, "orchestrator.confirm_pending"),
                Err(e) => warn!(execution = id, attempt, signature, error = %e, "orchestrator.confirm_check_failed"),
            }

            if attempt >= policy.max_attempts {
                break;
            }
            let wait = policy.backoff(attempt);
            if Instant::now() + wait > deadline {
                break;
            }
            tokio::time::sleep(wait).await;
        }

        Err(TradeError::ConfirmationTimeout { signature: signature.to_string(), attempts: attempt })
    }
}

/// base64 -> bytes -> `VersionedTransaction`. Anything but v0 is refused before decoding.
fn decode_unsigned(trade: &GeneratedTrade) -> Result<(VersionedTransaction, Vec<u8>), TradeError> {
    if trade.format != TransactionFormat::V0 {
        return Err(TradeError::UnsupportedTransactionFormat(trade.format.label().to_string()));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(trade.transaction.trim())
        .map_err(|e| TradeError::InvalidTransaction(format!("not base64: {e}")))?;
    let tx: VersionedTransaction =
        bincode::deserialize(&bytes).map_err(|e| TradeError::InvalidTransaction(e.to_string()))?;
    Ok((tx, bytes))
}

use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

use crate::balances::{BalanceResolver, Balances};
use crate::config::Config;
use crate::domain::{Quote, TradeAction, TradeIntent};
use crate::error::TradeError;
use crate::orchestrator::{ExecuteRequest, OrchestratorSettings, TradeOrchestrator, TradeStatus};
use crate::pricing::PricingService;
use crate::quotes::{QuoteAggregator, QuoteSnapshot};
use crate::rpc::LedgerRpc;
use crate::wallet::WalletSigner;

/// Everything a front end renders.
#[derive(Debug, Clone)]
pub struct DeskSnapshot {
    pub identity: Option<Pubkey>,
    pub intent: TradeIntent,
    pub quotes: QuoteSnapshot,
    pub status: TradeStatus,
    pub balances: Balances,
    pub endpoint: String,
}

/// One user session: the connected wallet, the trade being edited, and the
/// RPC binding every new operation starts from.
pub struct TradeDesk {
    config: Config,
    rpc: RwLock<Arc<dyn LedgerRpc>>,
    wallet: RwLock<Option<Arc<dyn WalletSigner>>>,
    intent: RwLock<TradeIntent>,
    quotes: QuoteAggregator,
    orchestrator: TradeOrchestrator,
    balances: BalanceResolver,
    /// Serializes intent and wallet changes against trade start, so a trade
    /// always pairs a quote with the intent it was priced for.
    edits: Mutex<()>,
}

impl TradeDesk {
    pub fn new(config: Config, pricing: Arc<dyn PricingService>, rpc: Arc<dyn LedgerRpc>) -> Self {
        let intent = TradeIntent::new("", "", TradeAction::Buy, config.default_slippage_bps);
        Self {
            quotes: QuoteAggregator::new(pricing.clone(), config.quote_debounce()),
            orchestrator: TradeOrchestrator::new(OrchestratorSettings::from_config(&config), pricing),
            balances: BalanceResolver::new(),
            rpc: RwLock::new(rpc),
            wallet: RwLock::new(None),
            intent: RwLock::new(intent),
            edits: Mutex::new(()),
            config,
        }
    }

    /// Binding used by an operation starting now. In-flight work keeps its own.
    async fn bound_rpc(&self) -> Arc<dyn LedgerRpc> {
        Arc::clone(&*self.rpc.read().await)
    }

    pub async fn identity(&self) -> Option<Pubkey> {
        self.wallet.read().await.as_ref().map(|w| w.identity())
    }

    pub async fn endpoint(&self) -> String {
        self.rpc.read().await.endpoint().to_string()
    }

    pub async fn intent(&self) -> TradeIntent {
        self.intent.read().await.clone()
    }

    /// Rejected while a trade is running.
    pub async fn connect_wallet(&self, wallet: Arc<dyn WalletSigner>) -> Result<Balances, TradeError> {
        {
            let _edits = self.edits.lock().await;
            self.ensure_idle()?;
            info!(identity = %wallet.identity(), "desk.wallet_connected");
            *self.wallet.write().await = Some(wallet);
            self.requote().await;
        }
        Ok(self.refresh_balances_if_changed().await)
    }

    /// Rejected while a trade is running.
    pub async fn disconnect_wallet(&self) -> Result<Balances, TradeError> {
        {
            let _edits = self.edits.lock().await;
            self.ensure_idle()?;
            info!("desk.wallet_disconnected");
            *self.wallet.write().await = None;
            self.quotes.clear().await;
            self.requote().await;
        }
        Ok(self.refresh_balances_if_changed().await)
    }

    /// Replaces the intent being edited and schedules a debounced quote request.
    ///
    /// Rejected while a trade is running.
    pub async fn edit_intent(&self, intent: TradeIntent) -> Result<u64, TradeError> {
        let generation = {
            let _edits = self.edits.lock().await;
            self.ensure_idle()?;
            debug!(token = %intent.token, amount = %intent.amount, action = intent.action.as_str(), "desk.edit_intent");
            *self.intent.write().await = intent;
            self.requote().await
        };
        self.refresh_balances_if_changed().await;
        Ok(generation)
    }

    pub async fn select_quote(&self, protocol: &str) -> Result<Quote, TradeError> {
        self.quotes.select(protocol).await
    }

    /// Runs the selected quote through the whole trade lifecycle.
    ///
    /// After the terminal status has been visible for the configured display
    /// time the desk goes back to idle and refreshes quotes and balances.
    pub async fn execute(self: &Arc<Self>) -> Result<TradeStatus, TradeError> {
        let (started, rpc) = {
            let _edits = self.edits.lock().await;
            // Intent and selection come from one snapshot: the quote was priced for this intent.
            let quotes = self.quotes.snapshot().await;
            let intent = match quotes.intent {
                Some(intent) => intent,
                None => self.intent().await,
            };
            let req = ExecuteRequest {
                intent,
                quote: quotes.quotes.selected().cloned(),
                wallet: self.wallet.read().await.clone(),
            };
            (self.orchestrator.start(req).await?, self.bound_rpc().await)
        };
        let outcome = self.orchestrator.drive(started, rpc).await;
        info!(execution = outcome.id, status = outcome.status.name(), "desk.trade_finished");

        let desk = Arc::clone(self);
        let id = outcome.id;
        let display = self.config.status_display();
        tokio::spawn(async move {
            tokio::time::sleep(display).await;
            if desk.orchestrator.acknowledge(id).await {
                let rpc = desk.bound_rpc().await;
                desk.quotes.refresh(rpc).await;
                desk.refresh_balances().await;
            }
        });

        Ok(outcome.status)
    }

    pub fn status(&self) -> TradeStatus {
        self.orchestrator.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TradeStatus> {
        self.orchestrator.subscribe()
    }

    /// Switches the ledger endpoint for everything started from now on.
    pub async fn set_endpoint(&self, url: &str) -> Balances {
        {
            let mut rpc = self.rpc.write().await;
            let rebound = rpc.with_endpoint(url);
            info!(from = rpc.endpoint(), to = rebound.endpoint(), "desk.endpoint_changed");
            *rpc = rebound;
        }
        self.refresh_balances().await
    }

    pub async fn reset_endpoint(&self) -> Balances {
        {
            let mut rpc = self.rpc.write().await;
            let rebound = rpc.reset_to_default();
            info!(from = rpc.endpoint(), to = rebound.endpoint(), "desk.endpoint_reset");
            *rpc = rebound;
        }
        self.refresh_balances().await
    }

    pub async fn refresh_balances(&self) -> Balances {
        let (rpc, identity, token) = self.balance_inputs().await;
        self.balances.refresh(rpc, identity, token).await
    }

    pub async fn balances(&self) -> Balances {
        self.balances.current().await
    }

    pub async fn quotes(&self) -> QuoteSnapshot {
        self.quotes.snapshot().await
    }

    /// Resolves once the latest quote request has an answer.
    pub async fn wait_for_quotes(&self) -> QuoteSnapshot {
        self.quotes.wait_settled().await
    }

    pub async fn snapshot(&self) -> DeskSnapshot {
        DeskSnapshot {
            identity: self.identity().await,
            intent: self.intent().await,
            quotes: self.quotes.snapshot().await,
            status: self.orchestrator.status(),
            balances: self.balances.current().await,
            endpoint: self.endpoint().await,
        }
    }

    fn ensure_idle(&self) -> Result<(), TradeError> {
        if self.orchestrator.is_busy() {
            return Err(TradeError::precondition("A trade is in progress; wait for it to finish"));
        }
        Ok(())
    }

    /// Requests quotes for the current intent and identity. Callers hold `edits`.
    async fn requote(&self) -> u64 {
        let intent = self.intent().await;
        let rpc = self.bound_rpc().await;
        self.quotes.request_quotes(intent, self.identity().await, rpc).await
    }

    async fn refresh_balances_if_changed(&self) -> Balances {
        let (rpc, identity, token) = self.balance_inputs().await;
        self.balances.refresh_if_changed(rpc, identity, token).await
    }

    async fn balance_inputs(&self) -> (Arc<dyn LedgerRpc>, Option<Pubkey>, Option<String>) {
        let token = Some(self.intent.read().await.token.clone()).filter(|t| !t.is_empty());
        (self.bound_rpc().await, self.identity().await, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ConfirmationStatus;
    use crate::testing::{MockLedger, MockPricing, MockWallet, WalletBehaviour, TOKEN_MINT};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn desk() -> (Arc<TradeDesk>, Arc<MockPricing>, Arc<MockLedger>) {
        let pricing = Arc::new(MockPricing::new());
        let ledger = Arc::new(MockLedger::new("mock://default"));
        let cfg = Config { pricing_api_base_url: "mock://pricing".into(), ..Config::default() };
        let desk = Arc::new(TradeDesk::new(cfg, pricing.clone(), ledger.clone()));
        (desk, pricing, ledger)
    }

    fn buy(amount: &str) -> TradeIntent {
        TradeIntent::new(TOKEN_MINT, amount, TradeAction::Buy, 1500)
    }

    #[tokio::test(start_paused = true)]
    async fn quote_then_trade_then_reset_and_refresh() {
        let (desk, pricing, ledger) = desk();
        ledger.confirm_with([ConfirmationStatus::Confirmed]);
        desk.connect_wallet(Arc::new(MockWallet::new(WalletBehaviour::Sign))).await.unwrap();

        desk.edit_intent(buy("1.5")).await.unwrap();
        let quotes = desk.wait_for_quotes().await;
        assert_eq!(quotes.quotes.selected().unwrap().protocol, "pumpfun");
        assert_eq!(pricing.rate_call_count(), 1);

        let status = desk.execute().await.unwrap();
        assert!(matches!(status, TradeStatus::Confirmed { .. }));
        assert_eq!(pricing.trade_calls.lock().unwrap()[0].protocol_identifier.as_deref(), Some("pumpfun"));
        assert!(matches!(desk.status(), TradeStatus::Confirmed { .. }));

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(desk.status(), TradeStatus::Idle);
        assert_eq!(pricing.rate_call_count(), 2);
        let snap = desk.snapshot().await;
        assert_eq!(snap.balances.native_lamports, Some(2_000_000_000));
        assert_eq!(snap.quotes.quotes.quotes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_without_wallet_or_quote_is_rejected() {
        let (desk, _pricing, _ledger) = desk();
        desk.edit_intent(buy("1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(desk.execute().await, Err(TradeError::PreconditionNotMet(_))));

        desk.connect_wallet(Arc::new(MockWallet::new(WalletBehaviour::Sign))).await.unwrap();
        // Quotes are still being debounced; nothing is selected yet.
        assert!(matches!(desk.execute().await, Err(TradeError::PreconditionNotMet(_))));
        assert_eq!(desk.status(), TradeStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn edits_are_refused_while_a_trade_runs() {
        let (desk, pricing, _ledger) = desk();
        desk.connect_wallet(Arc::new(MockWallet::new(WalletBehaviour::Hang))).await.unwrap();
        desk.edit_intent(buy("1")).await.unwrap();
        desk.wait_for_quotes().await;

        let running = {
            let desk = desk.clone();
            tokio::spawn(async move { desk.execute().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(desk.status(), TradeStatus::AwaitingSignature);
        assert!(matches!(desk.edit_intent(buy("2")).await, Err(TradeError::PreconditionNotMet(_))));
        assert_eq!(desk.intent().await.amount, "1");
        assert!(matches!(desk.disconnect_wallet().await, Err(TradeError::PreconditionNotMet(_))));
        assert!(matches!(
            desk.connect_wallet(Arc::new(MockWallet::new(WalletBehaviour::Sign))).await,
            Err(TradeError::PreconditionNotMet(_))
        ));
        assert!(desk.identity().await.is_some());
        assert_eq!(pricing.rate_call_count(), 1);

        let status = running.await.unwrap().unwrap();
        assert!(matches!(status, TradeStatus::Failed { .. }));
        // Terminal: edits are accepted again.
        assert!(desk.edit_intent(buy("2")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_switch_only_affects_new_operations() {
        let (desk, _pricing, ledger) = desk();
        assert_eq!(desk.endpoint().await, "mock://default");
        ledger.confirm_with([ConfirmationStatus::Confirmed]);
        desk.connect_wallet(Arc::new(MockWallet::new(WalletBehaviour::Sign))).await.unwrap();
        desk.edit_intent(buy("1")).await.unwrap();
        desk.wait_for_quotes().await;

        let running = {
            let desk = desk.clone();
            tokio::spawn(async move { desk.execute().await })
        };
        // Inside the confirmation grace period.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(desk.status().name(), "confirming");

        desk.set_endpoint("mock://custom").await;
        assert_eq!(desk.endpoint().await, "mock://custom");

        // The running trade keeps confirming against the endpoint it started on.
        let status = running.await.unwrap().unwrap();
        assert!(matches!(status, TradeStatus::Confirmed { .. }));
        assert_eq!(ledger.submitted.lock().unwrap().len(), 1);
        assert_eq!(ledger.confirm_calls.load(Ordering::SeqCst), 1);

        desk.reset_endpoint().await;
        assert_eq!(desk.endpoint().await, "mock://default");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_clears_quotes_and_balances() {
        let (desk, _pricing, _ledger) = desk();
        desk.connect_wallet(Arc::new(MockWallet::new(WalletBehaviour::Sign))).await.unwrap();
        desk.edit_intent(buy("1")).await.unwrap();
        desk.wait_for_quotes().await;
        assert!(desk.balances().await.native_lamports.is_some());

        desk.disconnect_wallet().await.unwrap();
        let snap = desk.snapshot().await;
        assert!(snap.identity.is_none());
        assert!(snap.quotes.quotes.is_empty());
        assert_eq!(snap.balances, Balances::default());
    }

    #[tokio::test(start_paused = true)]
    async fn trade_uses_the_intent_its_quote_was_priced_for() {
        let (desk, pricing, ledger) = desk();
        ledger.confirm_with([ConfirmationStatus::Confirmed]);
        desk.connect_wallet(Arc::new(MockWallet::new(WalletBehaviour::Sign))).await.unwrap();
        desk.edit_intent(buy("1.5")).await.unwrap();
        desk.wait_for_quotes().await;

        // The edited intent moved on, but no new quote has replaced the old one yet.
        *desk.intent.write().await = buy("9");

        let status = desk.execute().await.unwrap();
        assert!(matches!(status, TradeStatus::Confirmed { .. }));
        assert_eq!(pricing.trade_calls.lock().unwrap()[0].amount, "1500000000");
    }
}

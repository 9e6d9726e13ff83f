//! Debounced quote fetching.
//!
//! Every intent update bumps a generation counter. The debounce sleep is a
//! real task that gets aborted when a newer intent arrives; once a request is
//! on the wire it is left alone and its answer is simply dropped if the
//! generation moved on in the meantime.

use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{Quote, TradeAction, TradeIntent, NATIVE_DECIMALS};
use crate::error::TradeError;
use crate::pricing::{PricingService, RateRequest};
use crate::rpc::LedgerRpc;
use crate::units::{slippage_percent, to_base_units};

/// Quotes for one intent, unique by protocol, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteSet {
    quotes: Vec<Quote>,
    selected: Option<String>,
}

impl QuoteSet {
    /// Keeps the first quote per protocol and auto-selects the best one.
    pub fn from_arrivals(arrivals: Vec<Quote>) -> Self {
        let mut quotes: Vec<Quote> = Vec::with_capacity(arrivals.len());
        for q in arrivals {
            if !quotes.iter().any(|seen| seen.protocol == q.protocol) {
                quotes.push(q);
            }
        }
        let mut set = Self { quotes, selected: None };
        set.selected = set.best().map(|q| q.protocol.clone());
        set
    }

    /// Highest `expected_output`; the earliest arrival wins a tie.
    pub fn best(&self) -> Option<&Quote> {
        self.quotes.iter().fold(None, |best: Option<&Quote>, q| match best {
            Some(b) if b.expected_output >= q.expected_output => Some(b),
            _ => Some(q),
        })
    }

    pub fn select(&mut self, protocol: &str) -> Result<&Quote, TradeError> {
        let Some(q) = self.quotes.iter().find(|q| q.protocol == protocol) else {
            return Err(TradeError::precondition(format!("no quote from protocol {protocol}")));
        };
        self.selected = Some(q.protocol.clone());
        Ok(q)
    }

    pub fn selected(&self) -> Option<&Quote> {
        let protocol = self.selected.as_deref()?;
        self.quotes.iter().find(|q| q.protocol == protocol)
    }

    pub fn quotes(&self) -> &[Quote] {
        &self.quotes
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

/// What a renderer needs to show the quote panel.
#[derive(Debug, Clone, Default)]
pub struct QuoteSnapshot {
    /// Latest requested generation.
    pub generation: u64,
    /// Generation whose result (or failure) is currently shown.
    pub completed: u64,
    pub intent: Option<TradeIntent>,
    pub quotes: QuoteSet,
    pub error: Option<String>,
    pub loading: bool,
}

#[derive(Default)]
struct QuoteBook {
    generation: u64,
    completed: u64,
    intent: Option<TradeIntent>,
    identity: Option<Pubkey>,
    quotes: QuoteSet,
    error: Option<String>,
    loading: bool,
    pending: Option<JoinHandle<()>>,
}

impl QuoteBook {
    fn snapshot(&self) -> QuoteSnapshot {
        QuoteSnapshot {
            generation: self.generation,
            completed: self.completed,
            intent: self.intent.clone(),
            quotes: self.quotes.clone(),
            error: self.error.clone(),
            loading: self.loading,
        }
    }

    /// Starts a new generation and drops everything tied to the old one.
    fn supersede(&mut self) -> u64 {
        // Only a task still sleeping out its debounce window is cancelled.
        if !self.loading {
            if let Some(task) = self.pending.take() {
                task.abort();
            }
        }
        self.pending = None;
        self.generation += 1;
        self.quotes = QuoteSet::default();
        self.error = None;
        self.loading = false;
        self.generation
    }

    fn ready(&self) -> Option<(TradeIntent, Pubkey)> {
        let intent = self.intent.as_ref().filter(|i| i.is_complete())?;
        Some((intent.clone(), self.identity?))
    }
}

pub struct QuoteAggregator {
    pricing: Arc<dyn PricingService>,
    debounce: Duration,
    book: Arc<Mutex<QuoteBook>>,
    settled: Arc<Notify>,
}

impl QuoteAggregator {
    pub fn new(pricing: Arc<dyn PricingService>, debounce: Duration) -> Self {
        Self {
            pricing,
            debounce,
            book: Arc::new(Mutex::new(QuoteBook::default())),
            settled: Arc::new(Notify::new()),
        }
    }

    /// Schedules a quote request for `intent` after the debounce window.
    ///
    /// Returns the generation assigned to this intent. Nothing is requested
    /// while the token, amount or identity is missing.
    pub async fn request_quotes(&self, intent: TradeIntent, identity: Option<Pubkey>, rpc: Arc<dyn LedgerRpc>) -> u64 {
        let mut book = self.book.lock().await;
        let generation = book.supersede();
        book.intent = Some(intent);
        book.identity = identity;

        let Some((intent, identity)) = book.ready() else {
            debug!(generation, "quotes.incomplete_input");
            book.completed = generation;
            self.settled.notify_waiters();
            return generation;
        };

        let task = self.spawn_fetch(generation, intent, identity, rpc, self.debounce);
        book.pending = Some(task);
        generation
    }

    /// Re-requests the current intent right away (after a trade settles, for instance).
    pub async fn refresh(&self, rpc: Arc<dyn LedgerRpc>) -> Option<u64> {
        let mut book = self.book.lock().await;
        let (intent, identity) = book.ready()?;
        let generation = book.supersede();
        let task = self.spawn_fetch(generation, intent, identity, rpc, Duration::ZERO);
        book.pending = Some(task);
        Some(generation)
    }

    /// Drops all quotes, e.g. when the wallet disconnects.
    pub async fn clear(&self) {
        let mut book = self.book.lock().await;
        let generation = book.supersede();
        book.identity = None;
        book.completed = generation;
        self.settled.notify_waiters();
    }

    pub async fn select(&self, protocol: &str) -> Result<Quote, TradeError> {
        let mut book = self.book.lock().await;
        let q = book.quotes.select(protocol)?.clone();
        info!(protocol, expected_output = q.expected_output, "quotes.selected");
        Ok(q)
    }

    pub async fn selected(&self) -> Option<Quote> {
        self.book.lock().await.quotes.selected().cloned()
    }

    pub async fn snapshot(&self) -> QuoteSnapshot {
        self.book.lock().await.snapshot()
    }

    /// Waits until the latest generation has a result (or was never sent).
    pub async fn wait_settled(&self) -> QuoteSnapshot {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let book = self.book.lock().await;
                if book.completed >= book.generation {
                    return book.snapshot();
                }
            }
            notified.await;
        }
    }

    fn spawn_fetch(
        &self,
        generation: u64,
        intent: TradeIntent,
        identity: Pubkey,
        rpc: Arc<dyn LedgerRpc>,
        delay: Duration,
    ) -> JoinHandle<()> {
        let book = Arc::clone(&self.book);
        let pricing = Arc::clone(&self.pricing);
        let settled = Arc::clone(&self.settled);

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                let mut b = book.lock().await;
                if b.generation != generation {
                    return;
                }
                b.loading = true;
            }

            let result = fetch_quotes(pricing.as_ref(), rpc.as_ref(), &intent, &identity).await;

            let mut b = book.lock().await;
            if b.generation != generation {
                debug!(generation, latest = b.generation, "quotes.stale_response_dropped");
                return;
            }
            b.loading = false;
            b.pending = None;
            b.completed = generation;
            match result {
                Ok(quotes) => {
                    b.quotes = QuoteSet::from_arrivals(quotes);
                    b.error = None;
                    info!(
                        generation,
                        count = b.quotes.quotes().len(),
                        selected = b.quotes.selected().map(|q| q.protocol.as_str()).unwrap_or(""),
                        "quotes.updated"
                    );
                }
                Err(e) => {
                    warn!(generation, error = %e, "quotes.failed");
                    b.quotes = QuoteSet::default();
                    b.error = Some(e.to_string());
                }
            }
            settled.notify_waiters();
        })
    }
}

async fn fetch_quotes(
    pricing: &dyn PricingService,
    rpc: &dyn LedgerRpc,
    intent: &TradeIntent,
    identity: &Pubkey,
) -> Result<Vec<Quote>, TradeError> {
    let decimals = match intent.action {
        TradeAction::Buy => NATIVE_DECIMALS,
        TradeAction::Sell => rpc.get_token_decimals(&intent.token).await.map_err(TradeError::network)?,
    };
    let amount = to_base_units(&intent.amount, decimals)?;

    pricing
        .rates(RateRequest {
            token: intent.token.clone(),
            amount: amount.to_string(),
            action: intent.action,
            slippage: Some(slippage_percent(intent.slippage_bps)),
            public_key: identity.to_string(),
        })
        .await
}

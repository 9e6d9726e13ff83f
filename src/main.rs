use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use solana_swap_desk::config::Config;
use solana_swap_desk::domain::{TradeAction, TradeIntent, NATIVE_DECIMALS};
use solana_swap_desk::logger::init_tracing;
use solana_swap_desk::pricing::PricingClient;
use solana_swap_desk::rpc::RpcGateway;
use solana_swap_desk::units::{slippage_percent, to_human_units};
use solana_swap_desk::wallet::KeypairWallet;
use solana_swap_desk::{TradeDesk, TradeStatus};

/// One trade from the environment: quote it, optionally pick a protocol,
/// and execute unless DRY_RUN is on.
struct TradeInputs {
    token: String,
    amount: String,
    action: TradeAction,
    slippage_bps: Option<u64>,
    protocol: Option<String>,
}

impl TradeInputs {
    fn from_env() -> Result<Self> {
        let var = |k: &str| std::env::var(k).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let token = var("TRADE_TOKEN").ok_or_else(|| anyhow!("TRADE_TOKEN is required"))?;
        let amount = var("TRADE_AMOUNT").ok_or_else(|| anyhow!("TRADE_AMOUNT is required"))?;
        let action = match var("TRADE_ACTION") {
            Some(a) => a.parse::<TradeAction>().map_err(|e| anyhow!(e))?,
            None => TradeAction::Buy,
        };
        let slippage_bps = var("TRADE_SLIPPAGE_BPS")
            .map(|v| v.parse::<u64>().context("TRADE_SLIPPAGE_BPS must be an integer"))
            .transpose()?;

        Ok(Self { token, amount, action, slippage_bps, protocol: var("TRADE_PROTOCOL") })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load local .env if present (no-op in prod/systemd envs)
    let _ = dotenvy::dotenv();

    init_tracing();

    let cfg = Config::from_env()?;
    info!(
        pricing = %cfg.pricing_api_base_url,
        rpc = %cfg.rpc_http_url,
        dry_run = cfg.dry_run,
        default_slippage_bps = cfg.default_slippage_bps,
        "boot"
    );

    let inputs = TradeInputs::from_env()?;
    let keypair_path = cfg
        .sol_keypair_path
        .clone()
        .ok_or_else(|| anyhow!("SOL_KEYPAIR_PATH is required"))?;
    let wallet = Arc::new(KeypairWallet::from_file(&keypair_path)?);

    let pricing = Arc::new(PricingClient::new(cfg.pricing_api_base_url.clone(), cfg.pricing_api_key.clone()));
    let rpc = RpcGateway::bound(cfg.rpc_http_url.clone(), cfg.rpc_timeout());
    let dry_run = cfg.dry_run;
    let display = cfg.status_display();
    let slippage_bps = inputs.slippage_bps.unwrap_or(cfg.default_slippage_bps);

    let desk = Arc::new(TradeDesk::new(cfg, pricing, rpc));
    let balances = desk.connect_wallet(wallet).await?;
    info!(
        identity = ?desk.identity().await,
        sol = balances.native_sol().as_deref().unwrap_or("-"),
        "wallet.connected"
    );

    let intent = TradeIntent::new(inputs.token, inputs.amount, inputs.action, slippage_bps);
    info!(
        token = %intent.token,
        amount = %intent.amount,
        action = intent.action.as_str(),
        slippage_pct = %slippage_percent(intent.slippage_bps),
        "trade.intent"
    );
    desk.edit_intent(intent.clone()).await?;

    let snapshot = desk.wait_for_quotes().await;
    if let Some(err) = &snapshot.error {
        error!(error = %err, "quotes.failed");
        return Err(anyhow!("quote request failed: {err}"));
    }
    if snapshot.quotes.is_empty() {
        warn!("quotes.none");
        return Ok(());
    }
    for q in snapshot.quotes.quotes() {
        let out_decimals = match intent.action {
            TradeAction::Buy => q.token_decimals,
            TradeAction::Sell => NATIVE_DECIMALS,
        };
        info!(
            protocol = %q.protocol,
            expected = %to_human_units(q.expected_output, out_decimals),
            minimum = %to_human_units(q.minimum_received, out_decimals),
            price_impact = %q.price_impact,
            "quote"
        );
    }

    if let Some(protocol) = &inputs.protocol {
        desk.select_quote(protocol).await?;
    }
    let Some(selected) = desk.quotes().await.quotes.selected().cloned() else {
        warn!("quotes.no_selection");
        return Ok(());
    };
    info!(protocol = %selected.protocol, "quote.selected");

    if dry_run {
        info!("DRY_RUN=true, not executing");
        return Ok(());
    }

    let mut status_rx = desk.subscribe_status();
    let status_log = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            info!(status = status.name(), "{status}");
            if status == TradeStatus::Idle {
                break;
            }
        }
    });

    match desk.execute().await {
        Ok(TradeStatus::Confirmed { signature }) => info!(%signature, "trade.confirmed"),
        Ok(other) => warn!(status = other.name(), "{other}"),
        Err(e) => {
            status_log.abort();
            return Err(e.into());
        }
    }

    // Let the desk return to idle and refresh balances before exiting.
    tokio::time::sleep(display + std::time::Duration::from_secs(1)).await;
    status_log.abort();

    let balances = desk.balances().await;
    info!(
        sol = balances.native_sol().as_deref().unwrap_or("-"),
        token = balances.token_ui().as_deref().unwrap_or("-"),
        "balances"
    );
    Ok(())
}

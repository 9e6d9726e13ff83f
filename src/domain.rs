use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Wrapped SOL mint. The pricing service and the ledger both use it for the native leg.
pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";
/// Lamports per SOL is 10^9; never fetched from chain.
pub const NATIVE_DECIMALS: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    /// Spend SOL, receive the token.
    Buy,
    /// Spend the token, receive SOL.
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        }
    }
}

impl std::str::FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(TradeAction::Buy),
            "sell" => Ok(TradeAction::Sell),
            other => Err(format!("unknown trade action: {other}")),
        }
    }
}

/// What the user currently wants to trade.
///
/// A snapshot is taken whenever a quote request is scheduled; edits produce a
/// new intent instead of mutating the one already in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeIntent {
    /// Mint address of the token being bought or sold.
    pub token: String,
    /// Human decimal amount. SOL for buys, the token for sells.
    pub amount: String,
    pub action: TradeAction,
    pub slippage_bps: u64,
}

impl TradeIntent {
    pub fn new(token: impl Into<String>, amount: impl Into<String>, action: TradeAction, slippage_bps: u64) -> Self {
        Self {
            token: token.into().trim().to_string(),
            amount: amount.into().trim().to_string(),
            action,
            slippage_bps,
        }
    }

    /// Mint whose decimals denominate `amount`.
    pub fn input_mint(&self) -> &str {
        match self.action {
            TradeAction::Buy => NATIVE_MINT,
            TradeAction::Sell => &self.token,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.token.is_empty() && !self.amount.is_empty()
    }
}

/// One protocol's priced estimate for an intent. Amounts are base units of the output side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub protocol: String,
    pub expected_output: u64,
    pub minimum_received: u64,
    pub price_impact: Decimal,
    pub token_decimals: u8,
}

/// What the desk needs to know about a mint. Decimals never change once minted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub mint: String,
    pub decimals: u8,
}

impl TokenMetadata {
    pub fn native() -> Self {
        Self { mint: NATIVE_MINT.to_string(), decimals: NATIVE_DECIMALS }
    }
}

/// Raw token account amount as reported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAmount {
    pub amount: u64,
    pub decimals: u8,
}

/// Wire format of the unsigned transaction handed back by the pricing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionFormat {
    V0,
    Legacy,
    Other(String),
}

impl TransactionFormat {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "v0" | "0" => TransactionFormat::V0,
            "legacy" => TransactionFormat::Legacy,
            _ => TransactionFormat::Other(raw.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            TransactionFormat::V0 => "v0",
            TransactionFormat::Legacy => "legacy",
            TransactionFormat::Other(raw) => raw,
        }
    }
}

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;
use tracing::debug;

use crate::domain::{Quote, TradeAction, TransactionFormat};
use crate::error::TradeError;

/// Remote quote + trade generation service.
#[async_trait]
pub trait PricingService: Send + Sync {
    /// One quote per protocol able to route the trade, in the service's order.
    async fn rates(&self, req: RateRequest) -> Result<Vec<Quote>, TradeError>;

    /// Unsigned transaction for the chosen protocol.
    async fn generate_trade(&self, req: TradeRequest) -> Result<GeneratedTrade, TradeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRequest {
    pub token: String,
    /// Input side base units.
    pub amount: String,
    pub action: TradeAction,
    /// Percent, e.g. `"15"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage: Option<String>,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRequest {
    #[serde(rename = "protocolIdentifier", skip_serializing_if = "Option::is_none")]
    pub protocol_identifier: Option<String>,
    pub token: String,
    pub amount: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub action: TradeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage: Option<String>,
    /// SOL, decimal string.
    #[serde(rename = "solPriorityFee", skip_serializing_if = "Option::is_none")]
    pub sol_priority_fee: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedTrade {
    /// base64 encoded serialized transaction
    pub transaction: String,
    pub format: TransactionFormat,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default = "Option::default")]
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RateResponse {
    #[serde(rename = "protocolIdentifier")]
    protocol_identifier: String,
    #[serde(rename = "expectedOutput", deserialize_with = "string_or_number")]
    expected_output: String,
    #[serde(rename = "minimumReceived", deserialize_with = "string_or_number")]
    minimum_received: String,
    #[serde(rename = "priceImpact", default, deserialize_with = "optional_string_or_number")]
    price_impact: Option<String>,
    #[serde(rename = "tokenDecimals")]
    token_decimals: u8,
}

#[derive(Debug, Deserialize)]
struct TradeResponse {
    txn: String,
    #[serde(rename = "type")]
    tx_type: String,
}

/// Amount fields show up both as JSON strings and numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

impl RateResponse {
    fn into_quote(self) -> Result<Quote, TradeError> {
        let parse_units = |field: &str, raw: &str| {
            raw.trim()
                .parse::<u64>()
                .map_err(|_| TradeError::NetworkError(format!("malformed {field} {raw:?} for {}", self.protocol_identifier)))
        };
        let expected_output = parse_units("expectedOutput", &self.expected_output)?;
        let minimum_received = parse_units("minimumReceived", &self.minimum_received)?;
        let price_impact = match self.price_impact.as_deref() {
            None => Decimal::ZERO,
            Some(raw) => Decimal::from_str(raw.trim())
                .or_else(|_| Decimal::from_scientific(raw.trim()))
                .map_err(|_| TradeError::NetworkError(format!("malformed priceImpact {raw:?}")))?,
        };
        Ok(Quote {
            protocol: self.protocol_identifier,
            expected_output,
            minimum_received,
            price_impact,
            token_decimals: self.token_decimals,
        })
    }
}

#[derive(Clone)]
pub struct PricingClient {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl PricingClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http: Client::new(),
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, TradeError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url).json(body);
        if let Some(key) = self.api_key.as_deref() {
            req = req.header("X-API-Key", key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        // A rejection envelope wins over the HTTP status: it carries the message worth showing.
        match serde_json::from_slice::<ApiResponse<T>>(&body) {
            Ok(envelope) if !envelope.success => Err(TradeError::RemoteRejected(
                envelope.message.unwrap_or_else(|| "request rejected".to_string()),
            )),
            Ok(envelope) if status.is_success() => envelope
                .data
                .ok_or_else(|| TradeError::NetworkError(format!("{path}: response has no data"))),
            Ok(_) => Err(TradeError::NetworkError(format!("{path}: HTTP {status}"))),
            Err(e) if status.is_success() => Err(TradeError::NetworkError(format!("{path}: malformed response: {e}"))),
            Err(_) => Err(TradeError::NetworkError(format!("{path}: HTTP {status}"))),
        }
    }
}

#[async_trait]
impl PricingService for PricingClient {
    async fn rates(&self, req: RateRequest) -> Result<Vec<Quote>, TradeError> {
        debug!(token = %req.token, amount = %req.amount, action = req.action.as_str(), "pricing.rates");
        let raw: Vec<RateResponse> = self.post("/trade/rate", &req).await?;
        raw.into_iter().map(RateResponse::into_quote).collect()
    }

    async fn generate_trade(&self, req: TradeRequest) -> Result<GeneratedTrade, TradeError> {
        debug!(
            token = %req.token,
            protocol = req.protocol_identifier.as_deref().unwrap_or(""),
            action = req.action.as_str(),
            "pricing.generate_trade"
        );
        let raw: TradeResponse = self.post("/trade/", &req).await?;
        Ok(GeneratedTrade {
            transaction: raw.txn,
            format: TransactionFormat::parse(&raw.tx_type),
        })
    }
}

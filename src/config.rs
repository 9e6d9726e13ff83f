use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Pricing service
    pub pricing_api_base_url: String,
    #[serde(skip_serializing)]
    pub pricing_api_key: Option<String>,

    // RPC
    pub rpc_http_url: String,
    pub rpc_timeout_secs: u64,

    // Trade defaults
    pub default_slippage_bps: u64,
    pub max_slippage_bps: u64,
    /// Priority fee in SOL, sent as a decimal string.
    pub priority_fee_sol: String,

    // Timing
    pub quote_debounce_ms: u64,
    pub confirm_grace_ms: u64,
    pub confirm_max_attempts: u32,
    pub confirm_initial_backoff_ms: u64,
    pub confirm_max_backoff_ms: u64,
    pub confirm_timeout_secs: u64,
    pub signing_timeout_secs: u64,
    pub status_display_ms: u64,

    // Runtime
    pub dry_run: bool,

    // Keys
    pub sol_keypair_path: Option<String>,
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().map(|s| s.trim().to_lowercase()) {
        None => default,
        Some(v) if v.is_empty() => default,
        Some(v) if v == "1" || v == "true" || v == "yes" || v == "y" || v == "on" => true,
        Some(v) if v == "0" || v == "false" || v == "no" || v == "n" || v == "off" => false,
        Some(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|x| x.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pricing_api_base_url: String::new(),
            pricing_api_key: None,
            rpc_http_url: DEFAULT_RPC_URL.to_string(),
            rpc_timeout_secs: 30,
            default_slippage_bps: 1500,
            max_slippage_bps: 10_000,
            priority_fee_sol: "0.001".to_string(),
            quote_debounce_ms: 500,
            confirm_grace_ms: 3000,
            confirm_max_attempts: 8,
            confirm_initial_backoff_ms: 500,
            confirm_max_backoff_ms: 5000,
            confirm_timeout_secs: 60,
            signing_timeout_secs: 120,
            status_display_ms: 5000,
            dry_run: true,
            sol_keypair_path: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        // Pricing service
        let pricing_api_base_url =
            env_string("PRICING_API_BASE_URL").ok_or_else(|| anyhow!("PRICING_API_BASE_URL is required"))?;
        let pricing_api_key = env_string("PRICING_API_KEY");

        // RPC
        let rpc_http_url = env_string("SOLANA_RPC_URL").unwrap_or(d.rpc_http_url);
        let rpc_timeout_secs = env_parse::<u64>("RPC_TIMEOUT_SECS").unwrap_or(d.rpc_timeout_secs);

        // Trade defaults
        let default_slippage_bps = env_parse::<u64>("DEFAULT_SLIPPAGE_BPS").unwrap_or(d.default_slippage_bps);
        let max_slippage_bps = env_parse::<u64>("MAX_SLIPPAGE_BPS").unwrap_or(d.max_slippage_bps);
        let priority_fee_sol = env_string("PRIORITY_FEE_SOL").unwrap_or(d.priority_fee_sol);

        // Timing
        let quote_debounce_ms = env_parse::<u64>("QUOTE_DEBOUNCE_MS").unwrap_or(d.quote_debounce_ms);
        let confirm_grace_ms = env_parse::<u64>("CONFIRM_GRACE_MS").unwrap_or(d.confirm_grace_ms);
        let confirm_max_attempts = env_parse::<u32>("CONFIRM_MAX_ATTEMPTS").unwrap_or(d.confirm_max_attempts);
        let confirm_initial_backoff_ms =
            env_parse::<u64>("CONFIRM_INITIAL_BACKOFF_MS").unwrap_or(d.confirm_initial_backoff_ms);
        let confirm_max_backoff_ms = env_parse::<u64>("CONFIRM_MAX_BACKOFF_MS").unwrap_or(d.confirm_max_backoff_ms);
        let confirm_timeout_secs = env_parse::<u64>("CONFIRM_TIMEOUT_SECS").unwrap_or(d.confirm_timeout_secs);
        let signing_timeout_secs = env_parse::<u64>("SIGNING_TIMEOUT_SECS").unwrap_or(d.signing_timeout_secs);
        let status_display_ms = env_parse::<u64>("STATUS_DISPLAY_MS").unwrap_or(d.status_display_ms);

        // Runtime
        let dry_run = env_bool("DRY_RUN", d.dry_run);

        let sol_keypair_path = env_string("SOL_KEYPAIR_PATH");

        let cfg = Self {
            pricing_api_base_url,
            pricing_api_key,
            rpc_http_url,
            rpc_timeout_secs,
            default_slippage_bps,
            max_slippage_bps,
            priority_fee_sol,
            quote_debounce_ms,
            confirm_grace_ms,
            confirm_max_attempts,
            confirm_initial_backoff_ms,
            confirm_max_backoff_ms,
            confirm_timeout_secs,
            signing_timeout_secs,
            status_display_ms,
            dry_run,
            sol_keypair_path,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_slippage_bps > self.max_slippage_bps {
            return Err(anyhow!("DEFAULT_SLIPPAGE_BPS cannot exceed MAX_SLIPPAGE_BPS"));
        }
        if self.max_slippage_bps > 10_000 {
            return Err(anyhow!("MAX_SLIPPAGE_BPS cannot exceed 10000 (100%)"));
        }
        if self.confirm_max_attempts == 0 {
            return Err(anyhow!("CONFIRM_MAX_ATTEMPTS must be at least 1"));
        }
        if self.confirm_initial_backoff_ms > self.confirm_max_backoff_ms {
            return Err(anyhow!("CONFIRM_INITIAL_BACKOFF_MS cannot exceed CONFIRM_MAX_BACKOFF_MS"));
        }
        crate::units::parse_amount(&self.priority_fee_sol)
            .map_err(|e| anyhow!("PRIORITY_FEE_SOL: {e}"))?;
        Ok(())
    }

    pub fn quote_debounce(&self) -> Duration {
        Duration::from_millis(self.quote_debounce_ms)
    }

    pub fn status_display(&self) -> Duration {
        Duration::from_millis(self.status_display_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

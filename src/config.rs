use anyhow::{Context, Result};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeCfg {
    pub rest_base_url: String,
    pub ws_url: String,
    pub time_sync_interval_sec: u64,
    pub request_timeout_sec: u64,
    /// Pause between consecutive venue calls inside a batch loop.
    pub inter_call_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketCfg {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: Option<String>,
    pub step_size: Option<String>,
    pub min_qty: Option<String>,
    pub min_notional: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCfg {
    pub submit_interval_sec: u64,
    pub submit_batch: usize,
    pub poll_interval_sec: u64,
    /// An order is due for a poll once neither channel has touched it
    /// for this long.
    pub poll_grace_sec: u64,
    pub push_grace_sec: u64,
    pub poll_batch: usize,
    pub push_base_timeout_sec: u64,
    pub push_per_order_timeout_sec: u64,
    pub price_sample_interval_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackCfg {
    pub enabled: bool,
    pub check_interval_sec: u64,
    pub max_age_sec: u64,
    /// Fractional move of last price away from the resting limit that
    /// triggers conversion, e.g. "0.0025" for 25 bps.
    pub price_move_threshold: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementCfg {
    pub interval_sec: u64,
    /// Fraction of each manual or synced deposit kept as platform fee,
    /// e.g. "0.0075".
    pub platform_fee_rate: String,
    pub sweep_fees: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerCfg {
    pub enabled: bool,
    pub interval_sec: u64,
    pub lookback_sec: u64,
    pub page_limit: u32,
    pub base_tolerance: String,
    pub quote_tolerance: String,
    pub auto_correct: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceCfg {
    pub sqlite_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminCfg {
    pub bind: String,
    pub require_token: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityCfg {
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub org_id: String,
    pub exchange: ExchangeCfg,
    pub market: MarketCfg,
    pub execution: ExecutionCfg,
    pub fallback: FallbackCfg,
    pub settlement: SettlementCfg,
    pub reconciler: ReconcilerCfg,
    pub persistence: PersistenceCfg,
    pub admin: AdminCfg,
    pub observability: ObservabilityCfg,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::File::with_name("config.example").required(false))
            .add_source(config::Environment::default().separator("__"));

        if let Ok(path) = std::env::var("DCA_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        builder
            .build()
            .context("failed to build config")?
            .try_deserialize()
            .context("failed to deserialize config")
    }
}

/// Venue API credentials. Kept out of the config file on purpose; the
/// secret never appears in logs or serialized state.
pub struct Credentials {
    pub api_key: String,
    pub api_secret: SecretString,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("DCA_API_KEY").context("DCA_API_KEY not set")?;
        let api_secret =
            std::env::var("DCA_API_SECRET").context("DCA_API_SECRET not set")?;
        Ok(Credentials {
            api_key,
            api_secret: SecretString::new(api_secret),
        })
    }
}

/// Parse a decimal knob kept as a string in the config file.
pub fn parse_decimal(value: &str, what: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("invalid decimal for {what}: {value}"))
}

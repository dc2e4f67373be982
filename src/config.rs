//! Configuration management
//!
//! Loads the JSON configuration file. Credentials never live in the config:
//! they come from the keyed secret file it points to, or from the
//! `BITGET_API_*` environment variables (a `.env` file is honoured).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bands::{AdaptiveBands, AverageMethod, BandMode};
use crate::exchange::bitget::{ClientConfig, API_BASE_URL};
use crate::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(dir) = std::env::var("ENVELOPE_STATE_DIR") {
            config.state.dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Reject settings that would produce nonsense orders
    pub fn validate(&self) -> Result<()> {
        let s = &self.strategy;

        s.average_method()?;
        if s.average_period == 0 {
            bail!("strategy.average_period must be at least 1");
        }
        if s.ohlcv_limit <= s.average_period {
            bail!(
                "strategy.ohlcv_limit ({}) must exceed average_period ({})",
                s.ohlcv_limit,
                s.average_period
            );
        }
        if !(s.balance_fraction > 0.0 && s.balance_fraction <= 1.0) {
            bail!("strategy.balance_fraction must be in (0, 1], got {}", s.balance_fraction);
        }
        if !(s.stop_loss_pct > 0.0 && s.stop_loss_pct < 1.0) {
            bail!("strategy.stop_loss_pct must be in (0, 1), got {}", s.stop_loss_pct);
        }
        if let Some(jump) = s.price_jump_pct {
            if !(jump > 0.0 && jump < 1.0) {
                bail!("strategy.price_jump_pct must be in (0, 1), got {}", jump);
            }
        }
        for (name, value) in [
            ("trigger_price_delta", s.trigger_price_delta),
            ("stop_limit_margin", s.stop_limit_margin),
        ] {
            if !(0.0..0.1).contains(&value) {
                bail!("strategy.{} must be in [0, 0.1), got {}", name, value);
            }
        }

        match &s.adaptive {
            Some(adaptive) => {
                if !(adaptive.base_envelope_pct > 0.0) {
                    bail!("strategy.adaptive.base_envelope_pct must be positive");
                }
                if adaptive.atr_period == 0 || adaptive.min_bands == 0 {
                    bail!("strategy.adaptive atr_period and min_bands must be at least 1");
                }
                if adaptive.min_bands > adaptive.max_bands {
                    bail!(
                        "strategy.adaptive.min_bands ({}) exceeds max_bands ({})",
                        adaptive.min_bands,
                        adaptive.max_bands
                    );
                }
            }
            None => {
                if s.envelopes.is_empty() {
                    bail!("strategy.envelopes must not be empty");
                }
                if s.envelopes.iter().any(|e| !(*e > 0.0 && *e < 1.0)) {
                    bail!("strategy.envelopes must all be in (0, 1): {:?}", s.envelopes);
                }
            }
        }

        if !matches!(self.state.backend.as_str(), "json" | "sqlite") {
            bail!("state.backend must be 'json' or 'sqlite', got '{}'", self.state.backend);
        }
        if self.monitor.interval_secs == 0 {
            bail!("monitor.interval_secs must be at least 1");
        }

        Ok(())
    }
}

/// Exchange connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Keyed secret file with `apiKey`, `secret`, `password` entries
    #[serde(default = "default_secret_path")]
    pub secret_path: PathBuf,
    #[serde(default = "default_key_name")]
    pub key_name: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for read-only calls; order actions are never retried
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
}

fn default_base_url() -> String {
    API_BASE_URL.to_string()
}

fn default_secret_path() -> PathBuf {
    PathBuf::from("secret.json")
}

fn default_key_name() -> String {
    "envelope".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_rate_limit() -> u32 {
    10
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            base_url: default_base_url(),
            secret_path: default_secret_path(),
            key_name: default_key_name(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            rate_limit: default_rate_limit(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
        }
    }
}

impl ExchangeConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_base_url(self.base_url.clone())
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_max_retries(self.max_retries)
            .with_rate_limit(self.rate_limit)
            .with_circuit_breaker_threshold(self.circuit_breaker_threshold)
    }
}

/// Envelope strategy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_symbol")]
    pub symbol: Symbol,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    /// Candles requested per cycle, including the one still forming
    #[serde(default = "default_ohlcv_limit")]
    pub ohlcv_limit: usize,
    /// Share of the free quote balance spread across the bands
    #[serde(default = "default_balance_fraction")]
    pub balance_fraction: f64,
    /// SMA, EMA, WMA or DCM
    #[serde(default = "default_average_type")]
    pub average_type: String,
    #[serde(default = "default_average_period")]
    pub average_period: usize,
    #[serde(default = "default_envelopes")]
    pub envelopes: Vec<f64>,
    /// Replaces `envelopes` with an ATR-scaled ladder when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveBands>,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_jump_pct: Option<f64>,
    #[serde(default = "default_trigger_price_delta")]
    pub trigger_price_delta: f64,
    #[serde(default = "default_stop_limit_margin")]
    pub stop_limit_margin: f64,
}

fn default_symbol() -> Symbol {
    Symbol::new("BTC/USDT")
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_ohlcv_limit() -> usize {
    100
}

fn default_balance_fraction() -> f64 {
    1.0
}

fn default_average_type() -> String {
    "DCM".to_string()
}

fn default_average_period() -> usize {
    5
}

fn default_envelopes() -> Vec<f64> {
    vec![0.07, 0.11, 0.14]
}

fn default_stop_loss_pct() -> f64 {
    0.4
}

fn default_trigger_price_delta() -> f64 {
    0.005
}

fn default_stop_limit_margin() -> f64 {
    0.005
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            symbol: default_symbol(),
            timeframe: default_timeframe(),
            ohlcv_limit: default_ohlcv_limit(),
            balance_fraction: default_balance_fraction(),
            average_type: default_average_type(),
            average_period: default_average_period(),
            envelopes: default_envelopes(),
            adaptive: None,
            stop_loss_pct: default_stop_loss_pct(),
            price_jump_pct: None,
            trigger_price_delta: default_trigger_price_delta(),
            stop_limit_margin: default_stop_limit_margin(),
        }
    }
}

impl StrategyConfig {
    pub fn average_method(&self) -> Result<AverageMethod> {
        Ok(self.average_type.parse::<AverageMethod>()?)
    }

    pub fn band_mode(&self) -> BandMode {
        match &self.adaptive {
            Some(adaptive) => BandMode::Adaptive(adaptive.clone()),
            None => BandMode::Fixed(self.envelopes.clone()),
        }
    }
}

/// Tracker persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    /// `json` or `sqlite`
    #[serde(default = "default_backend")]
    pub backend: String,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_backend() -> String {
    "json".to_string()
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            dir: default_state_dir(),
            backend: default_backend(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval_secs: default_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.strategy.symbol, Symbol::new("BTC/USDT"));
        assert_eq!(config.strategy.timeframe, "1h");
        assert_eq!(config.strategy.envelopes, vec![0.07, 0.11, 0.14]);
        assert_eq!(config.strategy.average_period, 5);
        assert_eq!(config.strategy.stop_loss_pct, 0.4);
        assert!(config.strategy.price_jump_pct.is_none());
        assert_eq!(config.state.backend, "json");
        assert_eq!(config.monitor.interval_secs, 60);
        assert_eq!(config.exchange.key_name, "envelope");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_adaptive_section_switches_mode() {
        let config: Config = serde_json::from_str(
            r#"{"strategy": {"adaptive": {"base_envelope_pct": 0.01}}}"#,
        )
        .unwrap();
        match config.strategy.band_mode() {
            BandMode::Adaptive(a) => {
                assert_eq!(a.atr_period, 14);
                assert_eq!(a.min_bands, 3);
                assert_eq!(a.max_bands, 10);
            }
            other => panic!("expected adaptive mode, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.strategy.average_type = "HMA".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.strategy.balance_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.strategy.envelopes = vec![0.07, 1.2];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.state.backend = "redis".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/envelope_btc_usdt.json");
        let config = Config::from_file(path).unwrap();
        config.validate().unwrap();
    }
}

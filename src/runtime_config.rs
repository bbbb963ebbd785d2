// =============================================================================
// Runtime Configuration — JSON file + environment overrides
// =============================================================================
//
// Every field carries a serde default so older config files keep loading as
// fields are added. Precedence: defaults < config file < MERIDIAN_* env vars
// < CLI flags (applied in main). Broker credentials are required; a missing
// credential is a startup error and the process exits with code 1.
// =============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_broker_port() -> u16 {
    5035
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_symbols() -> Vec<String> {
    vec![
        "EURUSD".to_string(),
        "GBPUSD".to_string(),
        "USDJPY".to_string(),
        "AUDUSD".to_string(),
        "USDCHF".to_string(),
    ]
}

fn default_adr_window_days() -> usize {
    5
}

// =============================================================================
// Aggregator tuning
// =============================================================================

/// Price the ADR band is centered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdrAnchor {
    TodaysOpen,
    PreviousClose,
}

impl Default for AdrAnchor {
    fn default() -> Self {
        Self::TodaysOpen
    }
}

/// Price series that classifies market-profile ticks as buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationPrice {
    Mid,
    Bid,
}

impl Default for ClassificationPrice {
    fn default() -> Self {
        Self::Mid
    }
}

/// Tunables shared by every aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSettings {
    /// Completed sessions averaged into the ADR.
    #[serde(default = "default_adr_window_days")]
    pub adr_window_days: usize,

    #[serde(default)]
    pub adr_anchor: AdrAnchor,

    #[serde(default)]
    pub profile_classification: ClassificationPrice,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            adr_window_days: default_adr_window_days(),
            adr_anchor: AdrAnchor::default(),
            profile_classification: ClassificationPrice::default(),
        }
    }
}

// =============================================================================
// Broker credentials
// =============================================================================

/// Connection and identity settings for the broker Open API.
/// The secret and token are never logged.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub account_id: i64,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Gateway bind address, `host:port`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Watchlist warmed into the catalog at startup; this is what the
    /// `symbolList` hello advertises before any client subscribes.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub aggregator: AggregatorSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig {
                host: String::new(),
                port: default_broker_port(),
                client_id: String::new(),
                client_secret: String::new(),
                access_token: String::new(),
                account_id: 0,
            },
            bind_addr: default_bind_addr(),
            symbols: default_symbols(),
            aggregator: AggregatorSettings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file. A missing file is not an error:
    /// defaults are returned and env vars may still complete the config.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file; using defaults + environment");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            symbols = ?config.symbols,
            "runtime config loaded"
        );
        Ok(config)
    }

    /// Overlay `MERIDIAN_*` environment variables onto the loaded config.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("MERIDIAN_BROKER_HOST") {
            self.broker.host = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_BROKER_PORT") {
            self.broker.port = v.parse().map_err(|_| ConfigError::Invalid {
                name: "MERIDIAN_BROKER_PORT",
                detail: format!("{v:?} is not a port number"),
            })?;
        }
        if let Ok(v) = std::env::var("MERIDIAN_CLIENT_ID") {
            self.broker.client_id = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_CLIENT_SECRET") {
            self.broker.client_secret = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_ACCESS_TOKEN") {
            self.broker.access_token = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_ACCOUNT_ID") {
            self.broker.account_id = v.parse().map_err(|_| ConfigError::Invalid {
                name: "MERIDIAN_ACCOUNT_ID",
                detail: format!("{v:?} is not an account id"),
            })?;
        }
        if let Ok(v) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_SYMBOLS") {
            self.symbols = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    /// Reject configs that cannot possibly authenticate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Missing("broker.host"));
        }
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Missing("broker.client_id"));
        }
        if self.broker.client_secret.is_empty() {
            return Err(ConfigError::Missing("broker.client_secret"));
        }
        if self.broker.access_token.is_empty() {
            return Err(ConfigError::Missing("broker.access_token"));
        }
        if self.broker.account_id <= 0 {
            return Err(ConfigError::Missing("broker.account_id"));
        }
        if self.aggregator.adr_window_days == 0 {
            return Err(ConfigError::Invalid {
                name: "aggregator.adr_window_days",
                detail: "must be at least 1".into(),
            });
        }
        self.bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                name: "bind_addr",
                detail: e.to_string(),
            })?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.broker.host = "demo.ctraderapi.example".into();
        cfg.broker.client_id = "cid".into();
        cfg.broker.client_secret = "secret".into();
        cfg.broker.access_token = "token".into();
        cfg.broker.account_id = 123;
        cfg
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.broker.port, 5035);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.symbols[0], "EURUSD");
        assert_eq!(cfg.aggregator.adr_window_days, 5);
        assert_eq!(cfg.aggregator.adr_anchor, AdrAnchor::TodaysOpen);
        assert_eq!(
            cfg.aggregator.profile_classification,
            ClassificationPrice::Mid
        );
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.broker.port, 5035);
        assert_eq!(cfg.aggregator.adr_window_days, 5);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{
            "broker": { "host": "live.example", "account_id": 42 },
            "aggregator": { "adr_anchor": "previous_close" }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.broker.host, "live.example");
        assert_eq!(cfg.broker.port, 5035);
        assert_eq!(cfg.aggregator.adr_anchor, AdrAnchor::PreviousClose);
        assert_eq!(cfg.aggregator.adr_window_days, 5);
    }

    #[test]
    fn validate_requires_credentials() {
        let cfg = RuntimeConfig::default();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Missing("broker.host"))
        ));

        let cfg = complete();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_bind_addr() {
        let mut cfg = complete();
        cfg.bind_addr = "not-an-addr".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { name: "bind_addr", .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_adr_window() {
        let mut cfg = complete();
        cfg.aggregator.adr_window_days = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = complete();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.broker.host, cfg.broker.host);
        assert_eq!(back.symbols, cfg.symbols);
        assert_eq!(back.aggregator.adr_window_days, cfg.aggregator.adr_window_days);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let cfg = RuntimeConfig::load("/nonexistent/meridian.json").unwrap();
        assert_eq!(cfg.broker.port, 5035);
    }
}

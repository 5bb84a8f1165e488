use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load and validate a TOML configuration file. Configuration errors are
    /// fatal at startup.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.name.is_empty() {
                bail!("account with empty name");
            }
            if !names.insert(account.name.as_str()) {
                bail!("duplicate account name: {}", account.name);
            }
            if !account.enabled {
                continue;
            }
            if account.client_id.is_empty() || account.client_secret.is_empty() {
                bail!("account {}: client_id and client_secret must be set", account.name);
            }
            if account.account_id <= 0 {
                bail!("account {}: account_id must be positive", account.name);
            }
            if account.lot_multiplier <= 0.0 {
                bail!("account {}: lot_multiplier must be positive", account.name);
            }
            if account.min_lot_size > account.max_lot_size {
                bail!(
                    "account {}: min_lot_size {} exceeds max_lot_size {}",
                    account.name,
                    account.min_lot_size,
                    account.max_lot_size
                );
            }
            match account.risk_mode {
                RiskMode::FixedLot if account.fixed_lot <= 0.0 => {
                    bail!("account {}: risk_mode FIXED_LOT requires fixed_lot", account.name)
                }
                RiskMode::FixedUsd if account.fixed_usd_risk <= 0.0 => {
                    bail!(
                        "account {}: risk_mode FIXED_USD requires fixed_usd_risk",
                        account.name
                    )
                }
                RiskMode::PercentEquity if account.risk_percent <= 0.0 => {
                    bail!(
                        "account {}: risk_mode PERCENT_EQUITY requires risk_percent",
                        account.name
                    )
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3140,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable file logging
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,
    /// Directory for log files (relative to executable or absolute path)
    #[serde(default = "default_log_directory")]
    pub directory: String,
    /// Prefix for log file names
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
    /// Rotation strategy: "daily", "hourly", or "never"
    #[serde(default = "default_log_rotation")]
    pub rotation: String,
    /// Maximum number of log files to keep (0 = unlimited)
    #[serde(default = "default_max_files")]
    pub max_files: u32,
    /// Maximum age of log files in days (0 = unlimited)
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_logging_enabled() -> bool {
    true
}
fn default_log_directory() -> String {
    "logs".to_string()
}
fn default_log_file_prefix() -> String {
    "bridge-server".to_string()
}
fn default_log_rotation() -> String {
    "daily".to_string()
}
fn default_max_files() -> u32 {
    30
}
fn default_max_age_days() -> u32 {
    90
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            directory: default_log_directory(),
            file_prefix: default_log_file_prefix(),
            rotation: default_log_rotation(),
            max_files: default_max_files(),
            max_age_days: default_max_age_days(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Demo,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskMode {
    #[default]
    SourceVolume,
    FixedLot,
    FixedUsd,
    PercentEquity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskReference {
    #[default]
    Equity,
    Balance,
}

/// Per-account replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub environment: Environment,

    // Credentials
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub account_id: i64,
    #[serde(default)]
    pub access_token: String,

    // Symbol mapping
    #[serde(default)]
    pub symbol_prefix: String,
    #[serde(default)]
    pub symbol_suffix: String,
    #[serde(default)]
    pub custom_symbols: HashMap<String, String>,

    // Trading behaviour
    #[serde(default = "default_lot_multiplier")]
    pub lot_multiplier: f64,
    #[serde(default = "default_min_lot_size")]
    pub min_lot_size: f64,
    #[serde(default = "default_max_lot_size")]
    pub max_lot_size: f64,
    #[serde(default = "default_true")]
    pub copy_sl: bool,
    #[serde(default = "default_true")]
    pub copy_tp: bool,

    // Risk sizing
    #[serde(default)]
    pub risk_mode: RiskMode,
    #[serde(default)]
    pub reject_if_no_sl: bool,
    #[serde(default)]
    pub fixed_lot: f64,
    #[serde(default = "default_true")]
    pub source_volume_fallback: bool,
    #[serde(default)]
    pub fixed_usd_risk: f64,
    #[serde(default)]
    pub risk_percent: f64,
    #[serde(default)]
    pub risk_reference: RiskReference,
    /// Opt-in to the 100,000 units/lot forex convention for instruments
    /// without a reported lot size.
    #[serde(default)]
    pub assume_forex_contract: bool,

    // Caps (0 = unlimited)
    #[serde(default)]
    pub max_daily_trades: u32,
    #[serde(default)]
    pub max_concurrent_positions: u32,

    // Filters
    #[serde(default)]
    pub magic_numbers: Option<Vec<i64>>,
    #[serde(default)]
    pub allowed_symbols: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_symbols: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_lot_multiplier() -> f64 {
    1.0
}
fn default_min_lot_size() -> f64 {
    0.01
}
fn default_max_lot_size() -> f64 {
    100.0
}

impl AccountConfig {
    /// Minimal config for tests and defaults.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            environment: Environment::Demo,
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            account_id: 1,
            access_token: String::new(),
            symbol_prefix: String::new(),
            symbol_suffix: String::new(),
            custom_symbols: HashMap::new(),
            lot_multiplier: default_lot_multiplier(),
            min_lot_size: default_min_lot_size(),
            max_lot_size: default_max_lot_size(),
            copy_sl: true,
            copy_tp: true,
            risk_mode: RiskMode::SourceVolume,
            reject_if_no_sl: false,
            fixed_lot: 0.0,
            source_volume_fallback: true,
            fixed_usd_risk: 0.0,
            risk_percent: 0.0,
            risk_reference: RiskReference::Equity,
            assume_forex_contract: false,
            max_daily_trades: 0,
            max_concurrent_positions: 0,
            magic_numbers: None,
            allowed_symbols: None,
            blocked_symbols: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            host = "0.0.0.0"
            port = 8080

            [[accounts]]
            name = "alpha"
            client_id = "id"
            client_secret = "secret"
            account_id = 7001
            access_token = "token"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server_address(), "0.0.0.0:8080");
        assert_eq!(config.accounts.len(), 1);

        let account = &config.accounts[0];
        assert!(account.enabled);
        assert_eq!(account.environment, Environment::Demo);
        assert_eq!(account.lot_multiplier, 1.0);
        assert_eq!(account.risk_mode, RiskMode::SourceVolume);
        assert!(account.copy_sl);
        assert!(account.copy_tp);
    }

    #[test]
    fn test_parse_risk_and_filter_options() {
        let toml = r#"
            [[accounts]]
            name = "beta"
            environment = "live"
            client_id = "id"
            client_secret = "secret"
            account_id = 7002
            risk_mode = "FIXED_USD"
            fixed_usd_risk = 50.0
            reject_if_no_sl = true
            risk_reference = "BALANCE"
            max_daily_trades = 10
            max_concurrent_positions = 3
            magic_numbers = [7, 42]
            allowed_symbols = ["EURUSD", "XAUUSD"]
            blocked_symbols = ["GBPJPY"]
            symbol_suffix = ".m"

            [accounts.custom_symbols]
            XAUUSD = "GOLD"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        let account = &config.accounts[0];
        assert_eq!(account.environment, Environment::Live);
        assert_eq!(account.risk_mode, RiskMode::FixedUsd);
        assert_eq!(account.risk_reference, RiskReference::Balance);
        assert_eq!(account.magic_numbers, Some(vec![7, 42]));
        assert_eq!(account.blocked_symbols, vec!["GBPJPY".to_string()]);
        assert_eq!(account.custom_symbols.get("XAUUSD"), Some(&"GOLD".to_string()));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = Config::default();
        config.accounts.push(AccountConfig::named("alpha"));
        config.accounts.push(AccountConfig::named("alpha"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unconfigured_risk_mode() {
        let mut config = Config::default();
        let mut account = AccountConfig::named("alpha");
        account.risk_mode = RiskMode::FixedLot;
        account.fixed_lot = 0.0;
        config.accounts.push(account);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_skips_disabled_accounts() {
        let mut config = Config::default();
        let mut account = AccountConfig::named("alpha");
        account.enabled = false;
        account.client_id = String::new();
        config.accounts.push(account);
        assert!(config.validate().is_ok());
    }
}

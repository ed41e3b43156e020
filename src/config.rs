use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bitcoin: BitcoinConfig,
    pub withdrawal: WithdrawalConfig,
    pub release: ReleaseConfig,
    pub reconciler: ReconcilerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bitcoin network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    /// Bitcoin testnet (the network deposit addresses were originally issued on).
    #[default]
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }

    /// Convert to bitcoin crate network type.
    pub fn to_bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinConfig {
    #[serde(default)]
    pub network: Network,
    /// Esplora REST endpoint (mempool.space compatible)
    pub esplora_url: String,
    /// Upper bound for every chain provider call in milliseconds
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalConfig {
    /// Flat fee paid by every withdrawal transaction
    pub fee_sats: u64,
    /// Change at or below this value is left to the miner instead of creating an output
    pub dust_threshold_sats: u64,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            fee_sats: 1000,
            dust_threshold_sats: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseConfig {
    /// Reward rate applied when a request does not carry one (e.g., 0.01 = 1%)
    pub default_reward_rate: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Run the background reconciliation loops
    pub enabled: bool,
    /// Deposit polling interval in seconds
    pub deposit_interval_secs: u64,
    /// Withdrawal status polling interval in seconds
    pub withdrawal_interval_secs: u64,
    /// Maximum pages of confirmed history fetched per address and tick
    pub max_address_pages: u32,
    /// Maximum pending withdrawals checked per tick
    pub pending_batch_size: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deposit_interval_secs: 60,
            withdrawal_interval_secs: 60,
            max_address_pages: 4,
            pending_batch_size: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 {
    3000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files (console only when unset)
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("bitcoin.network", "testnet")?
            .set_default("bitcoin.esplora_url", "https://mempool.space/testnet/api")?
            .set_default("bitcoin.request_timeout_ms", 10_000)?
            .set_default("withdrawal.fee_sats", 1000)?
            .set_default("withdrawal.dust_threshold_sats", 500)?
            .set_default("release.default_reward_rate", "0.01")?
            .set_default("reconciler.enabled", true)?
            .set_default("reconciler.deposit_interval_secs", 60)?
            .set_default("reconciler.withdrawal_interval_secs", 60)?
            .set_default("reconciler.max_address_pages", 4)?
            .set_default("reconciler.pending_batch_size", 200)?
            .set_default("database.max_connections", 5)?
            .set_default("api.port", 3000)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CUSTODIAN_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CUSTODIAN__DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("CUSTODIAN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for local runs and tests (in-memory store, testnet)
    pub fn default_config(database_url: &str) -> Self {
        use rust_decimal_macros::dec;

        Self {
            bitcoin: BitcoinConfig {
                network: Network::Testnet,
                esplora_url: "https://mempool.space/testnet/api".to_string(),
                request_timeout_ms: 10_000,
            },
            withdrawal: WithdrawalConfig::default(),
            release: ReleaseConfig {
                default_reward_rate: dec!(0.01),
            },
            reconciler: ReconcilerConfig::default(),
            database: DatabaseConfig {
                url: database_url.to_string(),
                max_connections: 5,
            },
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bitcoin.request_timeout_ms == 0 {
            errors.push("bitcoin.request_timeout_ms must be positive".to_string());
        }

        if self.bitcoin.esplora_url.trim().is_empty() {
            errors.push("bitcoin.esplora_url must be set".to_string());
        }

        if self.withdrawal.fee_sats == 0 {
            errors.push("withdrawal.fee_sats must be positive".to_string());
        }

        if self.withdrawal.dust_threshold_sats == 0 {
            errors.push("withdrawal.dust_threshold_sats must be positive".to_string());
        }

        let rate = self.release.default_reward_rate;
        if rate < Decimal::ZERO || rate > Decimal::ONE {
            errors.push(format!(
                "release.default_reward_rate must be between 0 and 1, got {rate}"
            ));
        }

        if self.reconciler.deposit_interval_secs == 0
            || self.reconciler.withdrawal_interval_secs == 0
        {
            errors.push("reconciler intervals must be positive".to_string());
        }

        if self.reconciler.max_address_pages == 0 {
            errors.push("reconciler.max_address_pages must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config("postgres://localhost/custodian");
        assert!(config.validate().is_ok());
        assert_eq!(config.withdrawal.fee_sats, 1000);
        assert_eq!(config.withdrawal.dust_threshold_sats, 500);
        assert_eq!(
            config.bitcoin.network.to_bitcoin_network(),
            bitcoin::Network::Testnet
        );
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = AppConfig::default_config("postgres://localhost/custodian");
        config.withdrawal.fee_sats = 0;
        config.release.default_reward_rate = dec!(1.5);
        config.reconciler.deposit_interval_secs = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("default_reward_rate")));
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        std::env::set_var("CUSTODIAN__DATABASE__URL", "postgres://env/custodian");
        let config = AppConfig::load_from("does-not-exist").expect("defaults should load");
        std::env::remove_var("CUSTODIAN__DATABASE__URL");

        assert_eq!(config.database.url, "postgres://env/custodian");
        assert_eq!(config.bitcoin.network, Network::Testnet);
        assert_eq!(config.release.default_reward_rate, dec!(0.01));
        assert_eq!(config.api.port, 3000);
    }
}

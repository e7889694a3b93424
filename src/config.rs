use anyhow::Context;
use config::{Config, Environment, File};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Loads configuration from a given config file or environment variables.
pub fn load_config(config_file_path: Option<&Path>) -> anyhow::Result<AppConfig> {
    // Load .env file if it exists, ignore if not present
    dotenv().ok();

    let mut settings = Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(File::from(path).required(true));
    }

    // e.g. WITHDRAWAL__RECONCILE__MAX_RETRIES=5
    settings = settings.add_source(
        Environment::with_prefix("WITHDRAWAL")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let app_config = settings.build()?.try_deserialize::<AppConfig>()?;

    Ok(app_config)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub quorum: QuorumConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { max_connections: 10 }
    }
}

impl DatabaseConfig {
    pub fn get_db_url(&self) -> anyhow::Result<String> {
        std::env::var("DATABASE_URL").context("DATABASE_URL is not set in environment or .env file")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Every withdrawal is paid out to this address.
    pub destination_address: String,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_connect_attempts() -> u32 {
    30
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            destination_address: String::new(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

impl LedgerConfig {
    pub fn get_rpc_url(&self) -> anyhow::Result<String> {
        std::env::var("LEDGER_RPC_URL")
            .context("LEDGER_RPC_URL is not set in environment or .env file")
    }

    /// Hex private key of the custodial account.
    pub fn get_signer_key(&self) -> anyhow::Result<String> {
        std::env::var("LEDGER_SIGNER_KEY")
            .context("LEDGER_SIGNER_KEY is not set in environment or .env file")
    }
}

/// Retry budget for one reconciliation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl ReconcileConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumConfig {
    pub threshold: u32,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self { threshold: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String, // "debug" | "info" | "warn" | "error"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::reconciliation::Commission;
use crate::settlement::evm::{EvmSettlementConfig, DEFAULT_GAS_LIMIT, DEFAULT_MAX_GAS_PRICE_WEI};
use crate::sources::DataSource;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pool/config.json";
const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/pool";

/// Settings as read from the config file and `POOL__*` environment variables
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub region: String,
    pub version: String,
    pub commission_percent: u8,
    pub bind_address: Option<String>,
    pub storage: StorageSettings,
    pub data_loader: DataLoaderSettings,
    pub payout: PayoutSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: String,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "postgres".to_string(),
            database_url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DataLoaderSettings {
    pub fetch_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub data_sources: Vec<DataSourceSettings>,
}

impl Default for DataLoaderSettings {
    fn default() -> Self {
        Self {
            fetch_interval_secs: 60,
            request_timeout_secs: 10,
            data_sources: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataSourceSettings {
    pub endpoint: String,
    #[serde(alias = "nodeType")]
    pub node_type: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PayoutSettings {
    pub enabled: bool,
    pub rpc_url: Option<String>,
    pub keystore_path: Option<PathBuf>,
    pub keystore_passphrase_path: Option<PathBuf>,
    pub frequency_secs: u64,
    /// Decimal wei
    pub threshold: String,
    pub max_gas_price_wei: u128,
    pub gas_limit: u64,
    pub rpc_timeout_secs: u64,
}

impl Default for PayoutSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_url: None,
            keystore_path: None,
            keystore_passphrase_path: None,
            frequency_secs: 3600,
            threshold: "0".to_string(),
            max_gas_price_wei: DEFAULT_MAX_GAS_PRICE_WEI,
            gas_limit: DEFAULT_GAS_LIMIT,
            rpc_timeout_secs: 15,
        }
    }
}

/// Validated, typed configuration the rest of the process runs on
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub region: String,
    pub version: String,
    pub commission: Commission,
    pub bind_address: Option<SocketAddr>,
    pub storage: StorageBackend,
    pub data_sources: Vec<DataSource>,
    pub fetch_interval: Duration,
    pub request_timeout: Duration,
    pub payout: Option<PayoutConfig>,
}

impl PoolConfig {
    /// Distinct node types served by the configured sources
    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.data_sources.iter().map(|s| s.node_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres { database_url: String, max_connections: u32 },
    Memory,
}

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    pub threshold: i64,
    pub frequency: Duration,
    pub settlement: EvmSettlementConfig,
}

impl Settings {
    /// Load from `POOL_CONFIG` (default `/etc/pool/config.json`) plus the environment.
    pub fn load() -> AppResult<Self> {
        let path = std::env::var("POOL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> AppResult<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("POOL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Resolve into typed values. Any failure here is fatal at startup.
    pub fn validate(&self) -> AppResult<PoolConfig> {
        let commission = Commission::try_from_percent(self.commission_percent)
            .map_err(|e| AppError::Config(e.to_string()))?;

        let bind_address = match &self.bind_address {
            Some(addr) if !addr.trim().is_empty() => Some(
                addr.trim()
                    .parse::<SocketAddr>()
                    .map_err(|e| AppError::Config(format!("bind_address {}: {}", addr, e)))?,
            ),
            _ => None,
        };

        let storage = match self.storage.backend.as_str() {
            "postgres" => StorageBackend::Postgres {
                database_url: self
                    .storage
                    .database_url
                    .clone()
                    .or_else(|| std::env::var("DATABASE_URL").ok())
                    .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: self.storage.max_connections.max(1),
            },
            "memory" => StorageBackend::Memory,
            other => {
                return Err(AppError::Config(format!(
                    "unknown storage backend '{}', expected postgres or memory",
                    other
                )))
            }
        };

        let mut data_sources = Vec::with_capacity(self.data_loader.data_sources.len());
        for source in &self.data_loader.data_sources {
            let endpoint = source.endpoint.trim();
            if endpoint.is_empty() {
                return Err(AppError::Config("data source with empty endpoint".to_string()));
            }
            reqwest::Url::parse(endpoint)
                .map_err(|e| AppError::Config(format!("data source {}: {}", endpoint, e)))?;
            data_sources.push(DataSource::new(endpoint, source.node_type.trim()));
        }

        if self.data_loader.fetch_interval_secs == 0 {
            return Err(AppError::Config("fetch_interval_secs must be positive".to_string()));
        }

        let payout = if self.payout.enabled {
            Some(self.payout.validate()?)
        } else {
            None
        };

        Ok(PoolConfig {
            region: self.region.clone(),
            version: self.version.clone(),
            commission,
            bind_address,
            storage,
            data_sources,
            fetch_interval: Duration::from_secs(self.data_loader.fetch_interval_secs),
            request_timeout: Duration::from_secs(self.data_loader.request_timeout_secs.max(1)),
            payout,
        })
    }
}

impl PayoutSettings {
    fn validate(&self) -> AppResult<PayoutConfig> {
        let threshold = self
            .threshold
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|t| *t >= 0)
            .ok_or_else(|| {
                AppError::Config(format!(
                    "payout threshold '{}' is not a non-negative wei amount",
                    self.threshold
                ))
            })?;

        let required = |value: &Option<String>, name: &str| -> AppResult<String> {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::Config(format!("payout enabled but {} is missing", name)))
        };
        let required_path = |value: &Option<PathBuf>, name: &str| -> AppResult<PathBuf> {
            value
                .clone()
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or_else(|| AppError::Config(format!("payout enabled but {} is missing", name)))
        };

        if self.frequency_secs == 0 {
            return Err(AppError::Config("payout frequency_secs must be positive".to_string()));
        }

        Ok(PayoutConfig {
            threshold,
            frequency: Duration::from_secs(self.frequency_secs),
            settlement: EvmSettlementConfig {
                rpc_url: required(&self.rpc_url, "rpc_url")?,
                keystore_path: required_path(&self.keystore_path, "keystore_path")?,
                keystore_passphrase_path: required_path(
                    &self.keystore_passphrase_path,
                    "keystore_passphrase_path",
                )?,
                max_gas_price_wei: self.max_gas_price_wei,
                gas_limit: self.gas_limit,
                rpc_timeout: Duration::from_secs(self.rpc_timeout_secs.max(1)),
            },
        })
    }
}

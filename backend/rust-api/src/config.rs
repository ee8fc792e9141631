use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::models::AutoSaveConfig;
use crate::services::persistence_gateway::GatewayConfig;
use crate::utils::circuit_breaker::CircuitBreakerConfig;
use crate::utils::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Mongo,
    Memory,
}

impl StorageBackend {
    fn parse(value: &str) -> Result<Self, config::ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StorageBackend::Mongo),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(config::ConfigError::Message(format!(
                "unknown storage.backend '{}', expected 'mongo' or 'memory'",
                other
            ))),
        }
    }
}

/// Tunables of the sync core. Defaults apply to every key not set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub read_cache_ttl_secs: u64,
    pub read_cache_capacity: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub save_max_retries: usize,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub batch_size: usize,
    pub connection_idle_secs: u64,
    pub heartbeat_secs: u64,
    /// Per-attempt stats are dropped after this long without an operation.
    pub stats_idle_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            read_cache_ttl_secs: 30,
            read_cache_capacity: 10_000,
            failure_threshold: 5,
            cooldown_secs: 60,
            save_max_retries: 3,
            retry_base_backoff_ms: 50,
            retry_max_backoff_ms: 1000,
            batch_size: 10,
            connection_idle_secs: 3600,
            heartbeat_secs: 15,
            stats_idle_secs: 7200,
        }
    }
}

impl SyncSettings {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            cache_ttl: Duration::from_secs(self.read_cache_ttl_secs.max(1)),
            cache_capacity: self.read_cache_capacity,
            breaker: CircuitBreakerConfig {
                failure_threshold: self.failure_threshold.max(1),
                cooldown: Duration::from_secs(self.cooldown_secs),
            },
            retry: RetryConfig {
                max_attempts: self.save_max_retries.max(1),
                base_backoff: Duration::from_millis(self.retry_base_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
                ..RetryConfig::default()
            },
        }
    }

    pub fn auto_save_defaults(&self) -> AutoSaveConfig {
        AutoSaveConfig {
            batch_size: self.batch_size.max(1),
            max_retries: self.save_max_retries.max(1),
            ..AutoSaveConfig::default()
        }
    }

    pub fn connection_idle(&self) -> Duration {
        Duration::from_secs(self.connection_idle_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn stats_idle(&self) -> Duration {
        Duration::from_secs(self.stats_idle_secs.max(1))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage_backend: StorageBackend,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub redis_uri: Option<String>,
    pub sync: SyncSettings,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then the local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml, then APP_* overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let port = settings
            .get_int("server.port")
            .ok()
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(8081);

        let storage_backend = match settings.get_string("storage.backend") {
            Ok(value) => StorageBackend::parse(&value)?,
            Err(_) if app_env == "prod" => StorageBackend::Mongo,
            Err(_) => StorageBackend::Memory,
        };

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"));
        let mongo_uri = match (mongo_uri, storage_backend) {
            (Ok(uri), _) => uri,
            (Err(_), StorageBackend::Mongo) if app_env == "prod" => {
                return Err(config::ConfigError::Message(
                    "database.mongo_uri (or MONGO_URI) must be set in production".into(),
                ));
            }
            (Err(_), _) => "mongodb://localhost:27017".to_string(),
        };

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "attempt_sync".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .ok()
            .filter(|uri| !uri.is_empty());

        let sync = match settings.get::<SyncSettings>("sync") {
            Ok(sync) => sync,
            Err(config::ConfigError::NotFound(_)) => SyncSettings::default(),
            Err(e) => return Err(e),
        };

        Ok(Config {
            port,
            storage_backend,
            mongo_uri,
            mongo_database,
            redis_uri,
            sync,
        })
    }

    /// In-process configuration with an in-memory store and no Redis.
    pub fn in_memory() -> Self {
        Config {
            port: 0,
            storage_backend: StorageBackend::Memory,
            mongo_uri: String::new(),
            mongo_database: String::new(),
            redis_uri: None,
            sync: SyncSettings::default(),
        }
    }
}

use crate::config::{Config, StorageBackend};
use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;
use std::sync::Arc;

use activity_log::{ActivitySink, InMemoryActivitySink, MongoActivitySink};
use attempt_store::{AttemptStore, MongoAttemptStore};
use attempt_sync_service::AttemptSyncService;
use cache_invalidation::{CacheInvalidator, NoopCacheInvalidator, RedisCacheInvalidator};
use memory_store::InMemoryAttemptStore;

pub struct AppState {
    pub config: Config,
    pub sync: AttemptSyncService,
}

impl AppState {
    /// Connects the configured backends and wires the sync core on top.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        // Attempt store backend
        let mongo = match config.storage_backend {
            StorageBackend::Mongo => {
                let client = MongoClient::with_uri_str(&config.mongo_uri).await?;
                tracing::info!("MongoDB client initialized ({})", config.mongo_database);
                Some(client.database(&config.mongo_database))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory attempt store, state is lost on restart");
                None
            }
        };

        // Optional Redis for cross-node cache invalidation
        let redis = match &config.redis_uri {
            Some(uri) => Some(connect_redis(uri).await?),
            None => {
                tracing::info!("No redis.uri configured, external cache invalidation disabled");
                None
            }
        };

        let (store, sink): (Arc<dyn AttemptStore>, Arc<dyn ActivitySink>) = match &mongo {
            Some(db) => (
                Arc::new(MongoAttemptStore::new(db.clone())),
                Arc::new(MongoActivitySink::new(db.clone())),
            ),
            None => (
                Arc::new(InMemoryAttemptStore::new()),
                Arc::new(InMemoryActivitySink::new()),
            ),
        };
        let invalidator: Arc<dyn CacheInvalidator> = match &redis {
            Some(conn) => Arc::new(RedisCacheInvalidator::new(conn.clone())),
            None => Arc::new(NoopCacheInvalidator),
        };

        // Sync core on top of the chosen backends
        let sync = AttemptSyncService::new(store, invalidator, sink, &config.sync);
        Ok(Self { config, sync })
    }

    /// Builds state around caller-supplied backends (tests, embedding).
    pub fn with_components(
        config: Config,
        store: Arc<dyn AttemptStore>,
        invalidator: Arc<dyn CacheInvalidator>,
        sink: Arc<dyn ActivitySink>,
    ) -> Self {
        let sync = AttemptSyncService::new(store, invalidator, sink, &config.sync);
        Self { config, sync }
    }
}

async fn connect_redis(uri: &str) -> anyhow::Result<ConnectionManager> {
    tracing::info!("Attempting to connect to Redis...");
    let client = redis::Client::open(uri)?;

    let redis = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        ConnectionManager::new(client),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

    let mut conn = redis.clone();
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

    tracing::info!("Redis connection established successfully");
    Ok(redis)
}

pub mod activity_log;
pub mod attempt_store;
pub mod attempt_sync_service;
pub mod auto_save_engine;
pub mod cache_invalidation;
pub mod conflict_resolver;
pub mod connection_registry;
pub mod memory_store;
pub mod persistence_gateway;
pub mod stats_service;
pub mod sync_coordinator;
pub mod update_hub;

#[cfg(test)]
pub(crate) mod test_support;

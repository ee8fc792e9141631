use async_trait::async_trait;
use redis::aio::ConnectionManager;

const SCAN_BATCH: usize = 200;

/// Collaborator owning the external read-cache tiers.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Drops every cached key matching a glob-style `key_pattern`.
    async fn invalidate(&self, key_pattern: &str) -> anyhow::Result<()>;

    async fn health(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Used when no shared cache tier is configured.
#[derive(Debug, Default)]
pub struct NoopCacheInvalidator;

#[async_trait]
impl CacheInvalidator for NoopCacheInvalidator {
    async fn invalidate(&self, _key_pattern: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Deletes matching keys from Redis with cursor-based SCAN, never KEYS.
pub struct RedisCacheInvalidator {
    redis: ConnectionManager,
}

impl RedisCacheInvalidator {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CacheInvalidator for RedisCacheInvalidator {
    async fn invalidate(&self, key_pattern: &str) -> anyhow::Result<()> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(key_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                removed += keys.len();
                redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<()>(&mut conn)
                    .await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!("Invalidated {} cache keys for {}", removed, key_pattern);
        Ok(())
    }

    async fn health(&self) -> anyhow::Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

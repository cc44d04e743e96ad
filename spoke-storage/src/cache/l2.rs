//! Shared network cache (Redis) — level 2 of the cache tier.
//!
//! Entries expire by TTL; there is no explicit eviction. Transport
//! failures surface as `Unavailable` so the tier can fall through to the
//! authoritative store; an L2 outage never fails a request. The
//! connection manager reconnects on its own, bounded by the configured
//! retry budget.

use crate::config::NetworkCacheConfig;
use crate::context::OpContext;
use crate::errors::StorageError;
use bytes::Bytes;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::IntoConnectionInfo;
use std::time::Duration;

pub struct L2Cache {
    conn: ConnectionManager,
}

impl L2Cache {
    /// Connect to the configured Redis instance. Fails when the URL is
    /// malformed or the initial connection cannot be established; the
    /// caller decides whether that disables the tier or aborts bootstrap.
    pub async fn connect(config: &NetworkCacheConfig) -> Result<Self, StorageError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| StorageError::Unavailable("no network cache configured".to_string()))?;

        let mut info = url
            .into_connection_info()
            .map_err(|e| StorageError::Internal(format!("cache url: {}", e)))?;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }
        if config.db != 0 {
            info.redis.db = config.db;
        }

        let client = redis::Client::open(info)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(config.max_retries as usize)
            .set_connection_timeout(Duration::from_secs(2));
        let conn = ConnectionManager::new_with_config(client, manager_config).await?;
        Ok(Self { conn })
    }

    pub async fn get(&self, ctx: &OpContext, key: &str) -> Result<Option<Bytes>, StorageError> {
        let mut conn = self.conn.clone();
        let payload: Option<Vec<u8>> = ctx
            .bound(redis::cmd("GET").arg(key).query_async(&mut conn))
            .await??;
        Ok(payload.map(Bytes::from))
    }

    pub async fn set(
        &self,
        ctx: &OpContext,
        key: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = ctx
            .bound(
                redis::cmd("SET")
                    .arg(key)
                    .arg(payload)
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async(&mut conn),
            )
            .await??;
        Ok(())
    }

    pub async fn delete(&self, ctx: &OpContext, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let removed: u64 = ctx.bound(cmd.query_async(&mut conn)).await??;
        Ok(removed)
    }

    /// Delete every key matching a glob pattern via SCAN, so large
    /// keyspaces are walked incrementally instead of blocking the server.
    pub async fn delete_pattern(
        &self,
        ctx: &OpContext,
        pattern: &str,
    ) -> Result<u64, StorageError> {
        let mut conn = self.conn.clone();
        let mut victims: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = ctx
                .bound(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(200)
                        .query_async(&mut conn),
                )
                .await??;
            victims.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        self.delete(ctx, &victims).await
    }

    pub async fn ping(&self, ctx: &OpContext) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: String = ctx
            .bound(redis::cmd("PING").query_async(&mut conn))
            .await??;
        Ok(())
    }
}

impl std::fmt::Debug for L2Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L2Cache").finish_non_exhaustive()
    }
}

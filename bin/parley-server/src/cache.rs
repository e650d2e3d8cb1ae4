//! Redis-backed [`CacheClient`].

use std::time::Duration;

use async_trait::async_trait;
use parley_core::CacheError;
use parley_core::cache::CacheClient;
use redis::aio::ConnectionManager;

/// Keys examined per `SCAN` round trip during pattern deletes.
const SCAN_BATCH: usize = 100;

/// Shared Redis connection; cheap to clone, reconnects on its own.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RedisCache")
    }
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(CacheError::backend)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(CacheError::backend)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(CacheError::backend)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(CacheError::backend)?;
        Ok(())
    }

    async fn delete(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();

        if !pattern.contains('*') {
            let removed: u64 = redis::cmd("DEL")
                .arg(pattern)
                .query_async(&mut conn)
                .await
                .map_err(CacheError::backend)?;
            return Ok(removed);
        }

        let mut removed = 0;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(CacheError::backend)?;

            if !keys.is_empty() {
                let n: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(CacheError::backend)?;
                removed += n;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let err = RedisCache::connect("not a redis url").await.unwrap_err();
        assert!(matches!(err, CacheError::Backend(_)));
    }
}

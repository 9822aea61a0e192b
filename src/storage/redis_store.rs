//! Redis key-value backend

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

use super::KvStore;
use crate::{GenproxyError, Result};

/// Redis-backed store
///
/// The `ConnectionManager` multiplexes one reconnecting connection; clones
/// share it, so the store can be used from any number of tasks at once.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL is invalid or the server is
    /// unreachable; the proxy must not start serving in that case
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GenproxyError::Config(format!("Invalid redis URL '{url}': {e}")))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| GenproxyError::Config(format!("Cannot connect to redis at {url}: {e}")))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| GenproxyError::Config(format!("Redis at {url} did not answer PING: {e}")))?;
        info!("Connected to redis at {} ({})", url, pong);

        Ok(Self { conn })
    }
}

/// `PX` argument for `ttl`; `None` when it does not fit a redis integer
fn expiry_millis(ttl: Duration) -> Option<u64> {
    u64::try_from(ttl.as_millis())
        .ok()
        .filter(|&millis| i64::try_from(millis).is_ok())
        .map(|millis| millis.max(1))
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        match ttl.map(expiry_millis) {
            Some(Some(millis)) => {
                cmd.arg("PX").arg(millis);
            }
            Some(None) => warn!("TTL for {} out of range, storing without expiry", key),
            None => {}
        }
        let () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_millis() {
        assert_eq!(expiry_millis(Duration::from_secs(60)), Some(60_000));
        assert_eq!(expiry_millis(Duration::from_micros(10)), Some(1));
        assert_eq!(expiry_millis(Duration::from_secs(u64::MAX)), None);
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let err = RedisStore::connect("not a url").await.err().unwrap();
        assert!(matches!(err, GenproxyError::Config(_)));
    }

    #[tokio::test]
    #[ignore = "requires a local redis server"]
    async fn test_roundtrip_against_local_redis() {
        let store = RedisStore::connect("redis://127.0.0.1:6379").await.unwrap();
        let key = "genproxy-test:roundtrip";

        store
            .set(key, b"value".to_vec(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(store.get(key).await.unwrap().unwrap(), b"value");
        assert!(store.delete(key).await.unwrap());
        assert!(store.get(key).await.unwrap().is_none());
    }
}

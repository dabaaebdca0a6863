//! Redis-backed binding store

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use super::store::BindingStore;
use crate::error::{RelayError, Result};

const REMOVE_IF_EQUAL: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    return redis.call('HDEL', KEYS[1], ARGV[1])
end
return 0
"#;

/// Binding store over a shared Redis deployment.
/// The connection manager reconnects on its own after failures.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    remove_if_equal: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RelayError::config(format!("Invalid redis url {}: {}", url, e)))?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to redis at {}", url);

        Ok(Self {
            conn,
            remove_if_equal: redis::Script::new(REMOVE_IF_EQUAL),
        })
    }
}

#[async_trait]
impl BindingStore for RedisStore {
    async fn add_service(&self, key: &str, addr: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, addr).await?;
        Ok(())
    }

    async fn remove_service(&self, key: &str, addr: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, addr).await?;
        Ok(())
    }

    async fn services(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn get_binding(&self, key: &str, user_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, user_id).await?)
    }

    async fn set_binding(&self, key: &str, user_id: &str, addr: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hset(key, user_id, addr).await?;
        Ok(())
    }

    async fn remove_binding_if(&self, key: &str, user_id: &str, addr: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .remove_if_equal
            .key(key)
            .arg(user_id)
            .arg(addr)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

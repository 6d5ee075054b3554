//! Routing-label mirror in the cache store.
//!
//! Active containers `SET` each routing label with a TTL of one poll
//! interval plus a buffer, so an entry silently expires if no sweep
//! re-asserts it.  Inactive containers `DEL` their labels.  Keys live in the
//! store's global namespace; when two containers declare the same key the
//! last write wins.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{error, info};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::sleep;

use crate::error::Result;

const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// The two operations the daemon needs from a key/value store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
}

/// Redis-backed store.  The connection manager reconnects on its own after
/// the initial connection succeeded.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect, retrying with capped exponential backoff until the store is
    /// ready.  Only an unusable URL fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let mut backoff = Duration::from_secs(1);
        loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => {
                    info!("connected to cache store");
                    return Ok(Self { conn });
                }
                Err(e) => {
                    error!("cache store not ready: {}. Retrying in {:?}...", e, backoff);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_CONNECT_BACKOFF);
                }
            }
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

pub struct CacheSync {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl CacheSync {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Mirror one container's routing labels.  Keys are written
    /// concurrently; returns the number of failed writes, each of which has
    /// been logged.
    pub async fn sync(&self, routing: &BTreeMap<String, String>, active: bool) -> usize {
        let writes = routing.iter().map(|(key, value)| async move {
            let result = if active {
                self.store.set(key, value, self.ttl).await
            } else {
                self.store.del(key).await
            };
            if let Err(e) = &result {
                let op = if active { "set" } else { "del" };
                error!("{} [{}] failed: {}", op, key, e);
            }
            result.is_err()
        });

        join_all(writes).await.into_iter().filter(|failed| *failed).count()
    }
}

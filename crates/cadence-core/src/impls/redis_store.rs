//! Redis-backed `Store`.
//!
//! - Plain commands share one multiplexed connection.
//! - `BLMOVE` parks a connection indefinitely, so each blocking call checks out
//!   a dedicated connection from a small pool and returns it afterwards.
//! - Batches become `MULTI`/`EXEC` pipelines.
//! - Expirations arrive on the keyspace-event channel (`__keyevent@0__:expired`
//!   by default) and are forwarded by a background task.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, mpsc};

use crate::config::CadenceConfig;
use crate::ports::{Batch, ExpiredKeys, Store, StoreError, StoreOp};

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStoreOptions {
    /// Channel announcing expired key names.
    pub expired_channel: String,

    /// Run `CONFIG SET notify-keyspace-events Ex` on connect.
    pub configure_keyspace_events: bool,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            expired_channel: "__keyevent@0__:expired".to_string(),
            configure_keyspace_events: true,
        }
    }
}

pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    options: RedisStoreOptions,
}

impl RedisStore {
    pub async fn connect(url: &str, options: RedisStoreOptions) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        if options.configure_keyspace_events {
            // managed instances may forbid CONFIG; expirations then depend on server config
            if let Err(e) = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Ex")
                .query_async::<_, ()>(&mut conn)
                .await
            {
                tracing::warn!(error = %e, "could not enable keyspace expiration events");
            }
        }

        tracing::info!(url = %url, "connected to redis");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            options,
        })
    }

    pub async fn from_config(config: &CadenceConfig) -> Result<Self, StoreError> {
        let options = RedisStoreOptions {
            expired_channel: config.expired_key_events.clone(),
            configure_keyspace_events: config.configure_keyspace_events,
        };
        Self::connect(&config.redis_url, options).await
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking.lock().await.push(conn);
    }
}

/// Translate a batch into one atomic pipeline.
fn pipeline_for(batch: Batch) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for op in batch.into_ops() {
        match op {
            StoreOp::Set { key, value } => {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            }
            StoreOp::SetPx { key, value, ttl_ms } => {
                pipe.cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_ms.max(1))
                    .ignore();
            }
            StoreOp::Del { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
            StoreOp::RPush { key, value } => {
                pipe.cmd("RPUSH").arg(key).arg(value).ignore();
            }
            StoreOp::LRem { key, value } => {
                pipe.cmd("LREM").arg(key).arg(0).arg(value).ignore();
            }
        }
    }
    pipe
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(redis::cmd("MGET")
            .arg(keys)
            .query_async::<_, Vec<Option<String>>>(&mut conn)
            .await?)
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async::<_, Vec<String>>(&mut conn)
            .await?)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LLEN")
            .arg(key)
            .query_async::<_, usize>(&mut conn)
            .await?)
    }

    async fn blocking_move(&self, source: &str, destination: &str) -> Result<String, StoreError> {
        let mut conn = self.checkout_blocking().await?;
        let moved = redis::cmd("BLMOVE")
            .arg(source)
            .arg(destination)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(0)
            .query_async::<_, Option<String>>(&mut conn)
            .await;

        match moved {
            Ok(Some(id)) => {
                self.checkin_blocking(conn).await;
                Ok(id)
            }
            // timeout 0 never yields nil; treat it as a dropped connection
            Ok(None) => Err(StoreError::Connection(
                "BLMOVE returned no element".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(&self, batch: Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        tracing::debug!(ops = batch.len(), "exec batch");
        let mut conn = self.conn.clone();
        pipeline_for(batch).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn subscribe_expired(&self) -> Result<ExpiredKeys, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.options.expired_channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.options.expired_channel.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let key: String = match msg.get_payload() {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::warn!(error = %e, "unreadable expiration payload");
                        continue;
                    }
                };
                if tx.send(key).is_err() {
                    return;
                }
            }
            tracing::warn!(channel = %channel, "expiration subscription closed");
        });

        Ok(rx)
    }
}

//! 基于 Redis 的远程存储
//!
//! 批量读写走一次往返（MGET / 流水线 SET），清空命名空间用 SCAN 游标遍历，
//! 订阅使用独立的 PSUBSCRIBE 连接

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use tiercache_errors::{AppError, AppResult};
use tiercache_ports::{MessageHandler, RemoteStore, Subscription};
use tracing::{debug, error, info, warn};

use crate::config::RedisStoreConfig;
use crate::connection::{create_client, create_connection_manager, map_redis_error};

const DELETE_IF_EQUALS: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// 毫秒精度的 TTL，至少 1ms
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis 远程存储
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    config: RedisStoreConfig,
    delete_if_equals: Script,
}

impl RedisStore {
    /// 连接 Redis
    pub async fn connect(config: RedisStoreConfig) -> AppResult<Self> {
        let client = create_client(&config.url)?;
        let conn = create_connection_manager(&client, &config).await?;
        info!(
            response_timeout_ms = config.response_timeout.as_millis() as u64,
            "Redis store connected"
        );

        Ok(Self {
            client,
            conn,
            config,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        })
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    /// 带响应超时执行命令
    async fn run<T, Fut>(&self, operation: &str, fut: Fut) -> AppResult<T>
    where
        Fut: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.response_timeout, fut).await {
            Ok(result) => result.map_err(|e| map_redis_error(operation, e)),
            Err(_) => Err(AppError::timeout(format!(
                "Redis {} exceeded {}ms",
                operation,
                self.config.response_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        self.run("get", async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> AppResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                self.run("set", async move {
                    conn.pset_ex(key, value, ttl_millis(ttl)).await
                })
                .await
            }
            None => self.run("set", async move { conn.set(key, value).await }).await,
        }
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = self.run("del", async move { conn.del(key).await }).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        self.run("exists", async move { conn.exists(key).await }).await
    }

    async fn multi_get(&self, keys: &[String]) -> AppResult<HashMap<String, Vec<u8>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = self
            .run("mget", async move {
                redis::cmd("MGET").arg(keys).query_async(&mut conn).await
            })
            .await?;

        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect())
    }

    async fn multi_set(&self, entries: &[(String, Vec<u8>)], ttl: Option<Duration>) -> AppResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for (key, value) in entries {
            match ttl {
                Some(ttl) => pipe.pset_ex(key, value, ttl_millis(ttl)).ignore(),
                None => pipe.set(key, value).ignore(),
            };
        }

        let mut conn = self.conn.clone();
        self.run("pipeline set", async move {
            pipe.query_async::<()>(&mut conn).await
        })
        .await?;
        debug!(count = entries.len(), "Redis pipelined set completed");
        Ok(())
    }

    async fn multi_delete(&self, keys: &[String]) -> AppResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        self.run("del", async move { conn.del(keys).await }).await
    }

    async fn keys_matching(&self, pattern: &str) -> AppResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut conn = self.conn.clone();
            let (next, batch): (u64, Vec<String>) = self
                .run("scan", async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(self.config.scan_count)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN 可能重复返回同一个键
        keys.sort_unstable();
        keys.dedup();
        debug!(pattern = %pattern, count = keys.len(), "Redis scan completed");
        Ok(keys)
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = self
            .run("set nx", async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(result.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .run("delete_if_equals", async move {
                self.delete_if_equals
                    .key(key)
                    .arg(expected)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        Ok(deleted > 0)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let receivers: u64 = self
            .run("publish", async move { conn.publish(channel, payload).await })
            .await?;
        debug!(channel = %channel, receivers, "Redis message published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> AppResult<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| map_redis_error("pubsub connect", e))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| map_redis_error("psubscribe", e))?;
        info!(pattern = %pattern, "Subscribed to Redis pattern");

        let owned_pattern = pattern.to_string();
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<Vec<u8>>() {
                    Ok(payload) => handler(channel, payload),
                    Err(e) => error!(channel = %channel, error = %e, "Failed to read message payload"),
                }
            }
            warn!(pattern = %owned_pattern, "Redis subscription stream ended");
        });

        Ok(Subscription::new(pattern, handle))
    }

    async fn ping(&self) -> AppResult<Duration> {
        let started = Instant::now();
        let mut conn = self.conn.clone();
        let _: String = self
            .run("ping", async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(started.elapsed())
    }
}

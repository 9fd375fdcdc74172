/*
 * CHAPPS postfix policy delegate
 * Copyright (C) 2023 The CHAPPS developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
 */

use crate::{Cache, CacheError, QuotaDecision, QuotaReservation};
use chapps_config::field::FieldRedis;
use redis::AsyncCommands;

/// The quota accept path as one server-side step: trim the window, apply
/// the optional `min_delta` throttle, compare against the allowance,
/// insert and refresh the expiry. Keeps the window total within the
/// allowance under concurrent reservations for the same user.
const QUOTA_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local allowance = tonumber(ARGV[3])
local min_delta = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - interval)
local used = redis.call('ZCARD', key)
if min_delta > 0 then
  local latest = redis.call('ZRANGE', key, -1, -1, 'WITHSCORES')
  if #latest == 2 and now - tonumber(latest[2]) < min_delta then
    redis.call('ZADD', key, 'XX', now, latest[1])
    return {'throttled', used}
  end
end
local count = #ARGV - 4
if used + count <= allowance then
  for i = 5, #ARGV do
    redis.call('ZADD', key, now, ARGV[i])
  end
  redis.call('EXPIRE', key, interval)
  return {'accepted', used + count}
end
return {'denied', used}
";

enum Backend {
    Direct(redis::aio::ConnectionManager),
    Sentinel {
        client: tokio::sync::Mutex<redis::sentinel::SentinelClient>,
        cached: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    },
}

enum Conn {
    Manager(redis::aio::ConnectionManager),
    Multiplexed(redis::aio::MultiplexedConnection),
}

impl redis::aio::ConnectionLike for Conn {
    fn req_packed_command<'a>(
        &'a mut self,
        cmd: &'a redis::Cmd,
    ) -> redis::RedisFuture<'a, redis::Value> {
        match self {
            Self::Manager(conn) => conn.req_packed_command(cmd),
            Self::Multiplexed(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a redis::Pipeline,
        offset: usize,
        count: usize,
    ) -> redis::RedisFuture<'a, Vec<redis::Value>> {
        match self {
            Self::Manager(conn) => conn.req_packed_commands(cmd, offset, count),
            Self::Multiplexed(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Manager(conn) => conn.get_db(),
            Self::Multiplexed(conn) => conn.get_db(),
        }
    }
}

/// The production [`Cache`]: one process-wide redis client, direct or
/// Sentinel-resolved, every operation bounded by the configured timeout.
pub struct RedisCache {
    backend: Backend,
    op_timeout: std::time::Duration,
    quota_script: redis::Script,
}

impl RedisCache {
    /// Connect according to `[Redis]`: Sentinel when `sentinel_servers` is
    /// non-empty, the plain `server`/`port` pair otherwise.
    ///
    /// # Errors
    ///
    /// * [`CacheError::Unavailable`] when no backend answers
    pub async fn connect(config: &FieldRedis) -> Result<Self, CacheError> {
        let backend = if config.sentinel_servers.is_empty() {
            let client = redis::Client::open(config.url())?;
            let manager = redis::aio::ConnectionManager::new(client).await?;
            tracing::info!(url = %config.url(), "redis cache connected");
            Backend::Direct(manager)
        } else {
            let urls = config
                .sentinel_servers
                .iter()
                .map(|node| format!("redis://{node}"))
                .collect::<Vec<_>>();
            let client = redis::sentinel::SentinelClient::build(
                urls,
                config.sentinel_dataset.clone(),
                None,
                redis::sentinel::SentinelServerType::Master,
            )?;
            tracing::info!(
                sentinels = config.sentinel_servers.len(),
                dataset = %config.sentinel_dataset,
                "redis cache using sentinel",
            );
            Backend::Sentinel {
                client: tokio::sync::Mutex::new(client),
                cached: tokio::sync::Mutex::new(None),
            }
        };

        Ok(Self {
            backend,
            op_timeout: config.op_timeout,
            quota_script: redis::Script::new(QUOTA_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<Conn, CacheError> {
        match &self.backend {
            Backend::Direct(manager) => Ok(Conn::Manager(manager.clone())),
            Backend::Sentinel { client, cached } => {
                if let Some(conn) = cached.lock().await.as_ref() {
                    return Ok(Conn::Multiplexed(conn.clone()));
                }
                let conn = client.lock().await.get_async_connection().await?;
                *cached.lock().await = Some(conn.clone());
                Ok(Conn::Multiplexed(conn))
            }
        }
    }

    /// Drop the cached Sentinel connection so the next operation
    /// re-resolves the master (failover path).
    async fn invalidate(&self) {
        if let Backend::Sentinel { cached, .. } = &self.backend {
            *cached.lock().await = None;
        }
    }

    async fn run<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                if error.is_io_error() || error.is_connection_dropped() {
                    self.invalidate().await;
                }
                tracing::warn!(%error, op, "redis operation failed");
                Err(error.into())
            }
            Err(_elapsed) => {
                self.invalidate().await;
                tracing::warn!(op, timeout = ?self.op_timeout, "redis operation timed out");
                Err(CacheError::Timeout {
                    op,
                    timeout: self.op_timeout,
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        self.run("GET", conn.get(key)).await
    }

    async fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: std::time::Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let seconds = ttl.as_secs();
        self.run("SETEX", conn.set_ex(key, value, seconds)).await
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs());
        let reply: Option<String> = self.run("SET NX EX", cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        self.run("DEL", conn.del(keys)).await
    }

    async fn window_add(
        &self,
        key: &str,
        member: &str,
        now: i64,
        interval: u64,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        #[allow(clippy::cast_possible_truncation)]
        pipe.atomic()
            .zadd(key, member, now)
            .ignore()
            .expire(key, interval as i64)
            .ignore();
        self.run("ZADD", pipe.query_async::<_, ()>(&mut conn)).await
    }

    async fn window_count(&self, key: &str, now: i64, interval: u64) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        #[allow(clippy::cast_possible_wrap)]
        pipe.atomic()
            .zrembyscore(key, "-inf", now - interval as i64)
            .ignore()
            .zcard(key);
        let (count,): (u64,) = self.run("ZCARD", pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn reserve_quota(
        &self,
        key: &str,
        reservation: &QuotaReservation,
    ) -> Result<QuotaDecision, CacheError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.quota_script.key(key);
        invocation
            .arg(reservation.now)
            .arg(reservation.interval)
            .arg(reservation.allowance)
            .arg(reservation.min_delta);
        for member in &reservation.members {
            invocation.arg(member);
        }

        let (status, used): (String, u64) = self
            .run("EVALSHA", invocation.invoke_async(&mut conn))
            .await?;
        match status.as_str() {
            "accepted" => Ok(QuotaDecision::Accepted { used }),
            "denied" => Ok(QuotaDecision::Denied { used }),
            "throttled" => Ok(QuotaDecision::Throttled),
            other => Err(CacheError::BadReply {
                op: "EVALSHA",
                detail: other.to_owned(),
            }),
        }
    }
}

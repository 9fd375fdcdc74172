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

/// One atomic quota reservation against a sliding attempt window.
///
/// Timestamps are plain unix seconds supplied by the caller so that test
/// backends stay deterministic and clock reads happen exactly once per
/// request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaReservation {
    /// Current unix time, seconds.
    pub now: i64,
    /// Window length, seconds.
    pub interval: u64,
    /// `limit + effective margin`: the count the window may reach.
    pub allowance: i64,
    /// Members to insert on acceptance, one per counted recipient, already
    /// made unique from the instance id.
    pub members: Vec<String>,
    /// Minimum seconds between reservations; 0 disables the throttle.
    pub min_delta: u64,
}

/// What the store decided about a [`QuotaReservation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Members inserted; `used` counts them.
    Accepted {
        /// Window cardinality after insertion.
        used: u64,
    },
    /// Over allowance; nothing inserted.
    Denied {
        /// Window cardinality at the time of the check.
        used: u64,
    },
    /// Refused by the `min_delta` throttle; the newest member was
    /// re-stamped to `now` (rate reset).
    Throttled,
}

/// The Redis-shaped cache every policy keeps its state in.
///
/// One implementation per deployment: [`crate::RedisCache`] in production,
/// [`crate::MemoryCache`] under the `testing` feature. All operations are
/// bounded in time by the implementation; failures surface as
/// [`CacheError`] and the policies degrade rather than crash.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    /// Read a string key.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a string key with a TTL.
    async fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: std::time::Duration,
    ) -> Result<(), CacheError>;

    /// `SET key value NX EX ttl`: true when this call created the key.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, CacheError>;

    /// Delete keys, ignoring the ones that do not exist.
    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Record `member` at `now` in a sliding-window sorted set and refresh
    /// its expiry to `interval`.
    async fn window_add(
        &self,
        key: &str,
        member: &str,
        now: i64,
        interval: u64,
    ) -> Result<(), CacheError>;

    /// Trim entries older than `now - interval` and return the remaining
    /// cardinality.
    async fn window_count(&self, key: &str, now: i64, interval: u64) -> Result<u64, CacheError>;

    /// The quota accept path (trim, compare, insert, expire) in one
    /// server-side step, so concurrent reservations for the same user
    /// cannot both squeeze past the allowance.
    async fn reserve_quota(
        &self,
        key: &str,
        reservation: &QuotaReservation,
    ) -> Result<QuotaDecision, CacheError>;
}

/// Cache backend failure.
#[allow(clippy::module_name_repetitions)]
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The per-operation timeout elapsed.
    #[error("cache {op} timed out after {timeout:?}")]
    Timeout {
        /// Which operation.
        op: &'static str,
        /// The configured bound.
        timeout: std::time::Duration,
    },

    /// The backend refused or the connection is gone.
    #[error("cache unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    /// The backend answered something the caller cannot use.
    #[error("unexpected cache reply for {op}: {detail}")]
    BadReply {
        /// Which operation.
        op: &'static str,
        ///
        detail: String,
    },
}

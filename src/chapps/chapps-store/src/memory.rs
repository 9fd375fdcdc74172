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

struct Entry {
    value: String,
    expires_at: std::time::Instant,
}

#[derive(Default)]
struct State {
    strings: std::collections::HashMap<String, Entry>,
    windows: std::collections::HashMap<String, std::collections::BTreeMap<String, i64>>,
}

impl State {
    fn live_string(&mut self, key: &str) -> Option<&Entry> {
        if self
            .strings
            .get(key)
            .map_or(false, |entry| entry.expires_at <= std::time::Instant::now())
        {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn trim_window(
        &mut self,
        key: &str,
        now: i64,
        interval: u64,
    ) -> &mut std::collections::BTreeMap<String, i64> {
        let window = self.windows.entry(key.to_owned()).or_default();
        #[allow(clippy::cast_possible_wrap)]
        let horizon = now - interval as i64;
        window.retain(|_, score| *score > horizon);
        window
    }
}

/// Deterministic in-memory [`Cache`] for tests: same trimming, TTL and
/// reservation semantics as the redis backend, plus an operation counter
/// so tests can assert that a path performed no cache work at all.
#[derive(Default)]
pub struct MemoryCache {
    state: std::sync::Mutex<State>,
    ops: std::sync::atomic::AtomicU64,
}

impl MemoryCache {
    ///
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total trait operations performed so far.
    #[must_use]
    pub fn op_count(&self) -> u64 {
        self.ops.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn tick(&self) {
        self.ops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.tick();
        Ok(self.lock().live_string(key).map(|entry| entry.value.clone()))
    }

    async fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: std::time::Duration,
    ) -> Result<(), CacheError> {
        self.tick();
        self.lock().strings.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, CacheError> {
        self.tick();
        let mut state = self.lock();
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        self.tick();
        let mut state = self.lock();
        for key in keys {
            state.strings.remove(key);
            state.windows.remove(key);
        }
        Ok(())
    }

    async fn window_add(
        &self,
        key: &str,
        member: &str,
        now: i64,
        interval: u64,
    ) -> Result<(), CacheError> {
        self.tick();
        self.lock()
            .trim_window(key, now, interval)
            .insert(member.to_owned(), now);
        Ok(())
    }

    async fn window_count(&self, key: &str, now: i64, interval: u64) -> Result<u64, CacheError> {
        self.tick();
        Ok(self.lock().trim_window(key, now, interval).len() as u64)
    }

    async fn reserve_quota(
        &self,
        key: &str,
        reservation: &QuotaReservation,
    ) -> Result<QuotaDecision, CacheError> {
        self.tick();
        let mut state = self.lock();
        let window = state.trim_window(key, reservation.now, reservation.interval);
        let used = window.len() as u64;

        if reservation.min_delta > 0 {
            let min_delta = i64::try_from(reservation.min_delta).unwrap_or(i64::MAX);
            let latest = window
                .iter()
                .max_by_key(|(_, score)| **score)
                .map(|(member, score)| (member.clone(), *score));
            if let Some((member, score)) = latest {
                if reservation.now - score < min_delta {
                    window.insert(member, reservation.now);
                    return Ok(QuotaDecision::Throttled);
                }
            }
        }

        let requested = used + reservation.members.len() as u64;
        if i64::try_from(requested).unwrap_or(i64::MAX) <= reservation.allowance {
            for member in &reservation.members {
                window.insert(member.clone(), reservation.now);
            }
            Ok(QuotaDecision::Accepted {
                used: window.len() as u64,
            })
        } else {
            Ok(QuotaDecision::Denied { used })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DAY: u64 = 86400;

    fn reservation(now: i64, allowance: i64, members: &[&str], min_delta: u64) -> QuotaReservation {
        QuotaReservation {
            now,
            interval: DAY,
            allowance,
            members: members.iter().map(|m| (*m).to_owned()).collect(),
            min_delta,
        }
    }

    #[tokio::test]
    async fn reservations_respect_the_allowance() {
        let cache = MemoryCache::new();

        assert_eq!(
            cache
                .reserve_quota("oqp:alice:attempts", &reservation(1000, 10, &["i.0", "i.1", "i.2"], 0))
                .await
                .unwrap(),
            QuotaDecision::Accepted { used: 3 },
        );
        assert_eq!(
            cache
                .reserve_quota(
                    "oqp:alice:attempts",
                    &reservation(
                        1001,
                        10,
                        &["j.0", "j.1", "j.2", "j.3", "j.4", "j.5", "j.6", "j.7"],
                        0,
                    ),
                )
                .await
                .unwrap(),
            QuotaDecision::Denied { used: 3 },
        );
        assert_eq!(
            cache
                .window_count("oqp:alice:attempts", 1002, DAY)
                .await
                .unwrap(),
            3,
            "a denied reservation must not insert members",
        );
    }

    #[tokio::test]
    async fn old_attempts_age_out_of_the_window() {
        let cache = MemoryCache::new();
        cache
            .reserve_quota("oqp:a:attempts", &reservation(1000, 1, &["m.0"], 0))
            .await
            .unwrap();

        #[allow(clippy::cast_possible_wrap)]
        let later = 1000 + DAY as i64 + 1;
        assert_eq!(
            cache
                .reserve_quota("oqp:a:attempts", &reservation(later, 1, &["m.1"], 0))
                .await
                .unwrap(),
            QuotaDecision::Accepted { used: 1 },
        );
    }

    #[tokio::test]
    async fn min_delta_restamps_and_throttles() {
        let cache = MemoryCache::new();
        cache
            .reserve_quota("oqp:b:attempts", &reservation(1000, 10, &["m.0"], 60))
            .await
            .unwrap();

        assert_eq!(
            cache
                .reserve_quota("oqp:b:attempts", &reservation(1030, 10, &["m.1"], 60))
                .await
                .unwrap(),
            QuotaDecision::Throttled,
        );
        // the re-stamp keeps the clock running: still throttled a full
        // minute after the original attempt.
        assert_eq!(
            cache
                .reserve_quota("oqp:b:attempts", &reservation(1070, 10, &["m.2"], 60))
                .await
                .unwrap(),
            QuotaDecision::Throttled,
        );
    }

    #[tokio::test]
    async fn set_nx_only_creates_once() {
        let cache = MemoryCache::new();
        let ttl = std::time::Duration::from_secs(60);
        assert!(cache.set_nx_ex("grl:tuple:a:b:c", "1", ttl).await.unwrap());
        assert!(!cache.set_nx_ex("grl:tuple:a:b:c", "1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn delete_makes_room_for_rereads() {
        let cache = MemoryCache::new();
        let ttl = std::time::Duration::from_secs(60);
        cache.set_ex("sda:u:x", "1", ttl).await.unwrap();
        cache.delete(&["sda:u:x".to_owned()]).await.unwrap();
        assert_eq!(cache.get("sda:u:x").await.unwrap(), None);
    }
}

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

use crate::{degrade, directive, unix_now, Policy, Verdict, DAY_TTL};
use chapps_common::{Action, PolicyRequest, UserKeyPolicy};
use chapps_config::{Config, Margin};
use chapps_store::{
    keys, Cache, PolicyConfigAdapter, QuotaDecision, QuotaReservation, UserQuota,
};

/// Rolling outbound quota: a sliding 24 h window of attempts per user,
/// with a configurable grace margin and optional recipient counting.
pub struct OutboundQuota {
    cache: std::sync::Arc<dyn Cache>,
    adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
    user_key: UserKeyPolicy,
    no_user_key: Action,
    accept: Action,
    reject: Action,
    interval: u64,
    margin: Margin,
    counting_recipients: bool,
    min_delta: u64,
}

impl OutboundQuota {
    /// Build the policy from a validated configuration snapshot.
    ///
    /// # Errors
    ///
    /// * a configured directive fails to parse
    pub fn new(
        config: &Config,
        cache: std::sync::Arc<dyn Cache>,
        adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
    ) -> anyhow::Result<Self> {
        let section = &config.outbound_quota;
        Ok(Self {
            user_key: config.core.user_key_policy(),
            no_user_key: directive(
                "[CHAPPS] no_user_key_response",
                &config.core.no_user_key_response,
            )?,
            accept: directive(
                "[OutboundQuotaPolicy] acceptance_message",
                &section.acceptance_message,
            )?,
            reject: directive(
                "[OutboundQuotaPolicy] rejection_message",
                &section.rejection_message,
            )?,
            interval: section.interval,
            margin: section.margin,
            counting_recipients: section.counting_recipients,
            min_delta: section.min_delta,
            cache,
            adapter,
        })
    }

    /// Cached limit lookup with read-through to the relational store.
    /// A user without a row, or without a quota, cannot send.
    async fn limit_for(&self, user: &str) -> anyhow::Result<Option<i64>> {
        let key = keys::oqp_limit(user);
        if let Some(cached) = self.cache.get(&key).await? {
            if let Ok(limit) = cached.parse::<i64>() {
                return Ok(Some(limit));
            }
            tracing::warn!(user, %cached, "unparsable cached quota limit, re-reading");
        }

        match self.adapter.user_quota(user).await? {
            UserQuota::NoSuchUser => {
                tracing::info!(user, "unknown user may not send");
                Ok(None)
            }
            UserQuota::NoQuota => {
                tracing::info!(user, "user without a quota may not send");
                Ok(None)
            }
            UserQuota::Limit(limit) => {
                self.cache.set_ex(&key, &limit.to_string(), DAY_TTL).await?;
                Ok(Some(limit))
            }
        }
    }

    async fn decide(&self, request: &PolicyRequest) -> anyhow::Result<Verdict> {
        let user = match self.user_key.extract(request) {
            Ok(user) => user,
            Err(error) => {
                tracing::info!(%error, "rejecting unidentifiable outbound request");
                return Ok(Verdict::Final(self.no_user_key.clone()));
            }
        };

        let Some(limit) = self.limit_for(user).await? else {
            return Ok(Verdict::Final(self.reject.clone()));
        };

        let recipients = if self.counting_recipients {
            request.recipient_count()
        } else {
            1
        };
        let instance = request
            .instance()
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_owned);
        let now = unix_now();
        let reservation = QuotaReservation {
            now,
            interval: self.interval,
            allowance: limit.saturating_add(self.margin.effective(limit)),
            members: (0..recipients).map(|n| format!("{instance}:{n}")).collect(),
            min_delta: self.min_delta,
        };

        match self
            .cache
            .reserve_quota(&keys::oqp_attempts(user), &reservation)
            .await?
        {
            QuotaDecision::Accepted { used } => {
                tracing::debug!(user, used, limit, "outbound attempt recorded");
                Ok(Verdict::Final(self.accept.clone()))
            }
            QuotaDecision::Denied { used } => {
                tracing::info!(user, used, limit, recipients, "outbound quota fulfilled");
                Ok(Verdict::Final(self.reject.clone()))
            }
            QuotaDecision::Throttled => {
                tracing::info!(user, min_delta = self.min_delta, "sender rate throttled");
                Ok(Verdict::Final(self.reject.clone()))
            }
        }
    }
}

#[async_trait::async_trait]
impl Policy for OutboundQuota {
    fn name(&self) -> &'static str {
        "outbound-quota"
    }

    async fn approve(&self, request: &PolicyRequest) -> Verdict {
        self.decide(request)
            .await
            .unwrap_or_else(|error| degrade(self.name(), &error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapps_store::{MemoryCache, TestAdapter};
    use pretty_assertions::assert_eq;

    const DAY: u64 = 86400;

    fn request(pairs: &[(&str, &str)]) -> PolicyRequest {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn policy(
        ini: &str,
        adapter: TestAdapter,
    ) -> (OutboundQuota, std::sync::Arc<MemoryCache>) {
        let config = Config::from_ini_str(ini).unwrap();
        let cache = std::sync::Arc::new(MemoryCache::new());
        let policy =
            OutboundQuota::new(&config, cache.clone(), std::sync::Arc::new(adapter)).unwrap();
        (policy, cache)
    }

    #[tokio::test]
    async fn a_fresh_sender_is_accepted_and_counted() {
        let (policy, cache) = policy(
            "[OutboundQuotaPolicy]\ncounting_recipients = true\n",
            TestAdapter::new().with_quota("alice", 10),
        );
        let verdict = policy
            .approve(&request(&[
                ("sasl_username", "alice"),
                ("instance", "a413.0"),
                ("recipient_count", "3"),
            ]))
            .await;

        assert_eq!(verdict, Verdict::Final(Action::Dunno));
        assert_eq!(
            cache
                .window_count(&keys::oqp_attempts("alice"), unix_now(), DAY)
                .await
                .unwrap(),
            3,
        );
    }

    #[tokio::test]
    async fn the_margin_does_not_stretch_past_the_boundary() {
        let (policy, cache) = policy(
            "[OutboundQuotaPolicy]\ncounting_recipients = true\nmargin = 0.1\n",
            TestAdapter::new().with_quota("alice", 10),
        );

        // nine attempts already on the books.
        cache
            .reserve_quota(
                &keys::oqp_attempts("alice"),
                &QuotaReservation {
                    now: unix_now(),
                    interval: DAY,
                    allowance: 100,
                    members: (0..9).map(|n| format!("seed:{n}")).collect(),
                    min_delta: 0,
                },
            )
            .await
            .unwrap();

        let verdict = policy
            .approve(&request(&[
                ("sasl_username", "alice"),
                ("instance", "a413.1"),
                ("recipient_count", "3"),
            ]))
            .await;

        // 9 + 3 > 10 + floor(10 * 0.1) = 11: rejected, nothing recorded.
        assert_eq!(
            verdict,
            Verdict::Final("REJECT Outbound quota fulfilled".parse().unwrap()),
        );
        assert_eq!(
            cache
                .window_count(&keys::oqp_attempts("alice"), unix_now(), DAY)
                .await
                .unwrap(),
            9,
        );
    }

    #[tokio::test]
    async fn unknown_users_and_quotaless_users_are_rejected() {
        let (policy, _cache) = policy(
            "[OutboundQuotaPolicy]\n",
            TestAdapter::new().with_user("bob"),
        );
        let reject: Verdict =
            Verdict::Final("REJECT Outbound quota fulfilled".parse().unwrap());

        assert_eq!(
            policy
                .approve(&request(&[("sasl_username", "mallory"), ("instance", "i.0")]))
                .await,
            reject,
        );
        assert_eq!(
            policy
                .approve(&request(&[("sasl_username", "bob"), ("instance", "i.1")]))
                .await,
            reject,
        );
    }

    #[tokio::test]
    async fn the_limit_is_read_through_once() {
        let adapter = TestAdapter::new().with_quota("alice", 10);
        let config = Config::from_ini_str("").unwrap();
        let cache = std::sync::Arc::new(MemoryCache::new());
        let adapter = std::sync::Arc::new(adapter);
        let policy = OutboundQuota::new(&config, cache, adapter.clone()).unwrap();

        let req = request(&[("sasl_username", "alice"), ("instance", "i.2")]);
        policy.approve(&req).await;
        assert_eq!(adapter.query_count(), 1);

        policy.approve(&req).await;
        assert_eq!(adapter.query_count(), 1, "second request hits the cached limit");
    }

    #[tokio::test]
    async fn a_missing_user_key_is_an_authentication_failure() {
        let (policy, _cache) = policy("", TestAdapter::new().with_quota("alice", 10));
        assert_eq!(
            policy.approve(&request(&[("instance", "i.3")])).await,
            Verdict::Final("REJECT Rejected - unauthenticated".parse().unwrap()),
        );
    }

    #[tokio::test]
    async fn min_delta_rejects_rapid_fire_senders() {
        let (policy, _cache) = policy(
            "[OutboundQuotaPolicy]\nmin_delta = 60\n",
            TestAdapter::new().with_quota("alice", 10),
        );

        let first = policy
            .approve(&request(&[("sasl_username", "alice"), ("instance", "i.4")]))
            .await;
        assert_eq!(first, Verdict::Final(Action::Dunno));

        let second = policy
            .approve(&request(&[("sasl_username", "alice"), ("instance", "i.5")]))
            .await;
        assert_eq!(
            second,
            Verdict::Final("REJECT Outbound quota fulfilled".parse().unwrap()),
        );
    }
}

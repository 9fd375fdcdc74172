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

use crate::{degrade, directive, unix_now, Policy, Verdict, DAY_TTL, HOUR_TTL};
use chapps_common::{domain::address_domain, Action, PolicyRequest};
use chapps_config::Config;
use chapps_store::{keys, Cache, PolicyConfigAdapter};

const DAY_SECS: u64 = 86400;

/// Tuple-based greylisting: a `(client, sender, recipient)` triple is
/// deferred on first sight and deliverable ever after. The scheme leans
/// on real MTAs retrying, not on a minimum delay. Clients that deliver
/// often enough get whitelisted wholesale.
pub struct Greylisting {
    cache: std::sync::Arc<dyn Cache>,
    adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
    null_sender_ok: bool,
    whitelist_threshold: u64,
    accept: Action,
    defer: Action,
}

impl Greylisting {
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
        let section = &config.greylisting;
        Ok(Self {
            null_sender_ok: section.null_sender_ok,
            whitelist_threshold: section.whitelist_threshold,
            accept: directive(
                "[GreylistingPolicy] acceptance_message",
                &section.acceptance_message,
            )?,
            defer: directive(
                "[GreylistingPolicy] rejection_message",
                &section.rejection_message,
            )?,
            cache,
            adapter,
        })
    }

    /// Recipients whose domain has greylisting switched on, resolved
    /// through the 1 h `grl:opt:<domain>` flag cache. A recipient domain
    /// without a `domains` row is not greylisted.
    async fn gated_recipients<'req>(
        &self,
        request: &'req PolicyRequest,
    ) -> anyhow::Result<Vec<&'req str>> {
        let mut gated = Vec::new();
        for recipient in request.recipients() {
            let Some(domain) = address_domain(recipient) else {
                continue;
            };
            let key = keys::grl_option(&domain);
            let enabled = match self.cache.get(&key).await?.as_deref() {
                Some("1") => true,
                Some("0") => false,
                _ => {
                    let flags = self.adapter.domain_flags(&domain).await?;
                    let enabled = flags.map_or(false, |flags| flags.greylist);
                    self.cache
                        .set_ex(&key, if enabled { "1" } else { "0" }, HOUR_TTL)
                        .await?;
                    enabled
                }
            };
            if enabled {
                gated.push(recipient);
            }
        }
        Ok(gated)
    }

    async fn decide(&self, request: &PolicyRequest) -> anyhow::Result<Verdict> {
        let sender = request.sender();
        if sender.is_empty() && !self.null_sender_ok {
            tracing::info!("deferring null-sender delivery");
            return Ok(Verdict::Final(self.defer.clone()));
        }

        let gated = self.gated_recipients(request).await?;
        if gated.is_empty() {
            return Ok(Verdict::Final(self.accept.clone()));
        }

        let Some(client) = request.client_address() else {
            tracing::warn!("greylisting request without client_address, standing aside");
            return Ok(Verdict::Final(self.accept.clone()));
        };

        let now = unix_now();
        let tally_key = keys::grl_client(client);
        let instance = request
            .instance()
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_owned);

        // trusted-client shortcut: enough deliveries in the last day and
        // the tuples are not even consulted.
        let deliveries = self.cache.window_count(&tally_key, now, DAY_SECS).await?;
        if deliveries >= self.whitelist_threshold {
            self.cache
                .window_add(&tally_key, &instance, now, DAY_SECS)
                .await?;
            tracing::debug!(client, deliveries, "client whitelisted");
            return Ok(Verdict::Final(self.accept.clone()));
        }

        // SET NX is both the probe and the first-sighting marker, so two
        // concurrent first sightings cannot both claim novelty.
        let mut known = false;
        for recipient in &gated {
            let tuple_key = keys::grl_tuple(client, sender, recipient);
            if !self.cache.set_nx_ex(&tuple_key, "1", DAY_TTL).await? {
                known = true;
            }
        }

        if known {
            self.cache
                .window_add(&tally_key, &instance, now, DAY_SECS)
                .await?;
            tracing::debug!(client, sender, "known tuple, delivery recorded");
            Ok(Verdict::Final(self.accept.clone()))
        } else {
            tracing::info!(client, sender, "first sighting, deferring");
            Ok(Verdict::Final(self.defer.clone()))
        }
    }
}

#[async_trait::async_trait]
impl Policy for Greylisting {
    fn name(&self) -> &'static str {
        "greylisting"
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

    fn request(instance: &str) -> PolicyRequest {
        [
            ("instance", instance),
            ("client_address", "1.2.3.4"),
            ("sender", "s@x"),
            ("recipient", "r@y"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    fn policy(
        adapter: TestAdapter,
    ) -> (Greylisting, std::sync::Arc<MemoryCache>, std::sync::Arc<TestAdapter>) {
        let config = Config::from_ini_str("").unwrap();
        let cache = std::sync::Arc::new(MemoryCache::new());
        let adapter = std::sync::Arc::new(adapter);
        let policy = Greylisting::new(&config, cache.clone(), adapter.clone()).unwrap();
        (policy, cache, adapter)
    }

    fn defer() -> Verdict {
        Verdict::Final(
            "DEFER_IF_PERMIT Service temporarily unavailable - greylisted"
                .parse()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn first_sighting_defers_then_the_retry_delivers() {
        let (policy, cache, _) =
            policy(TestAdapter::new().with_domain_flags("y", true, false));

        assert_eq!(policy.approve(&request("m.0")).await, defer());
        assert_eq!(
            cache
                .get(&keys::grl_tuple("1.2.3.4", "s@x", "r@y"))
                .await
                .unwrap(),
            Some("1".to_owned()),
            "the defer must leave the tuple marker behind",
        );

        assert_eq!(
            policy.approve(&request("m.0")).await,
            Verdict::Final(Action::Dunno),
        );
        assert_eq!(
            cache
                .window_count(&keys::grl_client("1.2.3.4"), unix_now(), DAY_SECS)
                .await
                .unwrap(),
            1,
            "one delivery, one tally entry",
        );
    }

    #[tokio::test]
    async fn ungated_domains_pass_without_tuple_state() {
        let (policy, cache, _) =
            policy(TestAdapter::new().with_domain_flags("y", false, false));

        assert_eq!(
            policy.approve(&request("m.1")).await,
            Verdict::Final(Action::Dunno),
        );
        assert_eq!(
            cache
                .get(&keys::grl_tuple("1.2.3.4", "s@x", "r@y"))
                .await
                .unwrap(),
            None,
        );
    }

    #[tokio::test]
    async fn a_domain_without_a_row_is_not_greylisted() {
        let (policy, _, _) = policy(TestAdapter::new());
        assert_eq!(
            policy.approve(&request("m.2")).await,
            Verdict::Final(Action::Dunno),
        );
    }

    #[tokio::test]
    async fn the_opt_in_flag_is_cached_for_the_domain() {
        let (policy, _, adapter) =
            policy(TestAdapter::new().with_domain_flags("y", true, false));

        policy.approve(&request("m.3")).await;
        let queries = adapter.query_count();
        policy.approve(&request("m.3")).await;
        assert_eq!(adapter.query_count(), queries);
    }

    #[tokio::test]
    async fn busy_clients_are_whitelisted_past_the_tuples() {
        let (policy, cache, _) =
            policy(TestAdapter::new().with_domain_flags("y", true, false));

        let now = unix_now();
        for n in 0..10 {
            cache
                .window_add(&keys::grl_client("1.2.3.4"), &format!("d.{n}"), now, DAY_SECS)
                .await
                .unwrap();
        }

        assert_eq!(
            policy.approve(&request("m.4")).await,
            Verdict::Final(Action::Dunno),
        );
        assert_eq!(
            cache
                .get(&keys::grl_tuple("1.2.3.4", "s@x", "r@y"))
                .await
                .unwrap(),
            None,
            "whitelisted clients skip the tuple bookkeeping",
        );
        assert_eq!(
            cache
                .window_count(&keys::grl_client("1.2.3.4"), unix_now(), DAY_SECS)
                .await
                .unwrap(),
            11,
        );
    }

    #[tokio::test]
    async fn null_senders_are_deferred_unless_allowed() {
        let (policy, _, _) = policy(TestAdapter::new().with_domain_flags("y", true, false));
        let bounce: PolicyRequest = [
            ("instance", "m.5"),
            ("client_address", "1.2.3.4"),
            ("sender", ""),
            ("recipient", "r@y"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        assert_eq!(policy.approve(&bounce).await, defer());
    }
}

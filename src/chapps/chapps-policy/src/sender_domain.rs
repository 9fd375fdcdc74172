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

use crate::{degrade, directive, Policy, Verdict, DAY_TTL};
use chapps_common::{domain::address_domain, Action, PolicyRequest, UserKeyPolicy};
use chapps_config::Config;
use chapps_store::{keys, Cache, PolicyConfigAdapter};

/// Sender-domain authorisation: may this user send as this address?
///
/// Whole-email associations are checked before domain associations, and
/// both verdicts are cached as `"1"`/`"0"` flags the admin tooling can
/// invalidate by key deletion.
pub struct SenderDomainAuth {
    cache: std::sync::Arc<dyn Cache>,
    adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
    user_key: UserKeyPolicy,
    no_user_key: Action,
    null_sender_ok: bool,
    accept: Action,
    reject: Action,
}

impl SenderDomainAuth {
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
        let section = &config.sender_domain_auth;
        Ok(Self {
            user_key: config.core.user_key_policy(),
            no_user_key: directive(
                "[CHAPPS] no_user_key_response",
                &config.core.no_user_key_response,
            )?,
            null_sender_ok: section.null_sender_ok,
            accept: directive(
                "[SenderDomainAuthPolicy] acceptance_message",
                &section.acceptance_message,
            )?,
            reject: directive(
                "[SenderDomainAuthPolicy] rejection_message",
                &section.rejection_message,
            )?,
            cache,
            adapter,
        })
    }

    /// `"1"`/`"0"` cache probe; anything else is treated as a miss.
    async fn cached_flag(&self, key: &str) -> anyhow::Result<Option<bool>> {
        Ok(self.cache.get(key).await?.and_then(|flag| match flag.as_str() {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        }))
    }

    async fn decide(&self, request: &PolicyRequest) -> anyhow::Result<Verdict> {
        let user = match self.user_key.extract(request) {
            Ok(user) => user,
            Err(error) => {
                tracing::info!(%error, "rejecting unidentifiable outbound request");
                return Ok(Verdict::Final(self.no_user_key.clone()));
            }
        };

        let sender = request.sender();
        if sender.is_empty() {
            return Ok(if self.null_sender_ok {
                Verdict::Next(self.accept.clone())
            } else {
                Verdict::Final(self.reject.clone())
            });
        }

        let email_key = keys::sda(user, sender);
        let domain = address_domain(sender);
        let domain_key = domain.as_deref().map(|domain| keys::sda(user, domain));

        if let Some(authorized) = self.cached_flag(&email_key).await? {
            return Ok(self.verdict(authorized));
        }
        if let Some(key) = &domain_key {
            if let Some(authorized) = self.cached_flag(key).await? {
                return Ok(self.verdict(authorized));
            }
        }

        // miss on both: consult the store, most-specific match first.
        if self.adapter.user_authorized_email(user, sender).await? {
            self.cache.set_ex(&email_key, "1", DAY_TTL).await?;
            if let Some(key) = &domain_key {
                self.cache.set_ex(key, "1", DAY_TTL).await?;
            }
            return Ok(self.verdict(true));
        }
        if let (Some(domain), Some(key)) = (domain.as_deref(), domain_key.as_deref()) {
            if self.adapter.user_authorized_domain(user, domain).await? {
                self.cache.set_ex(key, "1", DAY_TTL).await?;
                return Ok(self.verdict(true));
            }
        }

        tracing::info!(user, sender, "sender address not authorized");
        self.cache.set_ex(&email_key, "0", DAY_TTL).await?;
        if let Some(key) = &domain_key {
            self.cache.set_ex(key, "0", DAY_TTL).await?;
        }
        Ok(self.verdict(false))
    }

    /// Acceptance lets the cascade continue into the quota policy;
    /// rejection terminates it.
    fn verdict(&self, authorized: bool) -> Verdict {
        if authorized {
            Verdict::Next(self.accept.clone())
        } else {
            Verdict::Final(self.reject.clone())
        }
    }
}

#[async_trait::async_trait]
impl Policy for SenderDomainAuth {
    fn name(&self) -> &'static str {
        "sender-domain-auth"
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

    fn request(sender: &str) -> PolicyRequest {
        [
            ("sasl_username".to_owned(), "bob".to_owned()),
            ("sender".to_owned(), sender.to_owned()),
            ("instance".to_owned(), "i.0".to_owned()),
        ]
        .into_iter()
        .collect()
    }

    fn policy(
        adapter: TestAdapter,
    ) -> (
        SenderDomainAuth,
        std::sync::Arc<MemoryCache>,
        std::sync::Arc<TestAdapter>,
    ) {
        let config = Config::from_ini_str("").unwrap();
        let cache = std::sync::Arc::new(MemoryCache::new());
        let adapter = std::sync::Arc::new(adapter);
        let policy = SenderDomainAuth::new(&config, cache.clone(), adapter.clone()).unwrap();
        (policy, cache, adapter)
    }

    fn accept() -> Verdict {
        Verdict::Next(Action::Dunno)
    }

    fn reject() -> Verdict {
        Verdict::Final(
            "REJECT Sender address not authorized for this user"
                .parse()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn a_domain_association_authorizes_and_caches() {
        let (policy, cache, adapter) = policy(TestAdapter::new().with_domain("bob", "ok.com"));

        assert_eq!(policy.approve(&request("x@ok.com")).await, accept());
        assert_eq!(
            cache.get(&keys::sda("bob", "ok.com")).await.unwrap(),
            Some("1".to_owned()),
        );

        // second call is served from the cache alone.
        let queries = adapter.query_count();
        assert_eq!(policy.approve(&request("x@ok.com")).await, accept());
        assert_eq!(adapter.query_count(), queries);
    }

    #[tokio::test]
    async fn a_whole_email_association_caches_both_keys() {
        let (policy, cache, _adapter) =
            policy(TestAdapter::new().with_email("bob", "ceo@ok.com"));

        assert_eq!(policy.approve(&request("ceo@ok.com")).await, accept());
        assert_eq!(
            cache.get(&keys::sda("bob", "ceo@ok.com")).await.unwrap(),
            Some("1".to_owned()),
        );
        assert_eq!(
            cache.get(&keys::sda("bob", "ok.com")).await.unwrap(),
            Some("1".to_owned()),
        );
    }

    #[tokio::test]
    async fn unauthorized_senders_cache_the_denial() {
        let (policy, cache, _adapter) = policy(TestAdapter::new().with_user("bob"));

        assert_eq!(policy.approve(&request("x@evil.com")).await, reject());
        assert_eq!(
            cache.get(&keys::sda("bob", "x@evil.com")).await.unwrap(),
            Some("0".to_owned()),
        );
        assert_eq!(
            cache.get(&keys::sda("bob", "evil.com")).await.unwrap(),
            Some("0".to_owned()),
        );
    }

    #[tokio::test]
    async fn deleting_the_cache_key_forces_a_reread() {
        let (policy, cache, adapter) = policy(TestAdapter::new().with_domain("bob", "ok.com"));

        policy.approve(&request("x@ok.com")).await;
        let queries = adapter.query_count();

        cache
            .delete(&[
                keys::sda("bob", "x@ok.com"),
                keys::sda("bob", "ok.com"),
            ])
            .await
            .unwrap();

        assert_eq!(policy.approve(&request("x@ok.com")).await, accept());
        assert!(adapter.query_count() > queries, "store must be consulted again");
    }

    #[tokio::test]
    async fn the_null_sender_follows_configuration() {
        let (policy, _cache, _adapter) = policy(TestAdapter::new().with_user("bob"));
        assert_eq!(policy.approve(&request("")).await, reject());

        let config =
            Config::from_ini_str("[SenderDomainAuthPolicy]\nnull_sender_ok = true\n").unwrap();
        let permissive = SenderDomainAuth::new(
            &config,
            std::sync::Arc::new(MemoryCache::new()),
            std::sync::Arc::new(TestAdapter::new()),
        )
        .unwrap();
        assert_eq!(permissive.approve(&request("")).await, accept());
    }
}

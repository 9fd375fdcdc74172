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

use crate::{degrade, Policy, Verdict, HOUR_TTL};
use chapps_common::{domain::address_domain, Action, PolicyRequest, SpfOutcome, SpfResult};
use chapps_config::field::{FieldSpfActions, SpfDirective};
use chapps_config::Config;
use chapps_store::{keys, Cache, PolicyConfigAdapter};

/// Record evaluation (RFC 7208) lives outside this crate; enforcement only
/// needs a result and an explanation back.
#[async_trait::async_trait]
pub trait SpfEvaluator: Send + Sync {
    /// Evaluate the sender identity of one delivery attempt.
    async fn evaluate(
        &self,
        client_ip: std::net::IpAddr,
        helo: Option<&str>,
        mail_from: &str,
    ) -> SpfOutcome;
}

/// Production evaluator: `viaspf` over the system DNS resolver.
pub struct ViaspfEvaluator {
    resolver: trust_dns_resolver::TokioAsyncResolver,
    config: viaspf::Config,
}

impl ViaspfEvaluator {
    /// Build the process-wide evaluator.
    ///
    /// # Errors
    ///
    /// * the system resolver configuration is unusable
    pub fn new(timeout: std::time::Duration) -> anyhow::Result<Self> {
        use anyhow::Context;
        Ok(Self {
            resolver: trust_dns_resolver::TokioAsyncResolver::tokio_from_system_conf()
                .context("cannot build the system DNS resolver")?,
            config: viaspf::Config::builder().timeout(timeout).build(),
        })
    }
}

#[async_trait::async_trait]
impl SpfEvaluator for ViaspfEvaluator {
    async fn evaluate(
        &self,
        client_ip: std::net::IpAddr,
        helo: Option<&str>,
        mail_from: &str,
    ) -> SpfOutcome {
        // RFC 7208 §2.4: fall back to the HELO identity for the null sender.
        let sender = if mail_from.is_empty() {
            let Some(helo) = helo else {
                return SpfOutcome::temperror("no identity to evaluate");
            };
            viaspf::Sender::from_domain(helo)
        } else {
            viaspf::Sender::from_address(mail_from)
        };
        let sender = match sender {
            Ok(sender) => sender,
            Err(error) => {
                return SpfOutcome {
                    result: SpfResult::Permerror,
                    explanation: error.to_string(),
                }
            }
        };

        let helo_domain = helo.and_then(|name| viaspf::DomainName::new(name).ok());
        let query = viaspf::evaluate_sender(
            &self.resolver,
            &self.config,
            client_ip,
            &sender,
            helo_domain.as_ref(),
        )
        .await;

        let result = SpfResult::from_evaluator(&query.spf_result.to_string());
        let explanation = match &query.cause {
            Some(viaspf::SpfResultCause::Match(mechanism)) => {
                format!("mechanism {mechanism} matched")
            }
            Some(viaspf::SpfResultCause::Error(error)) => error.to_string(),
            None => query.spf_result.to_string(),
        };
        SpfOutcome {
            result,
            explanation,
        }
    }
}

/// SPF enforcement: gate by recipient domain, evaluate under a total
/// duration bound, and map the result through the configured action table.
pub struct SpfEnforcement {
    cache: std::sync::Arc<dyn Cache>,
    adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
    evaluator: std::sync::Arc<dyn SpfEvaluator>,
    actions: FieldSpfActions,
    timeout: std::time::Duration,
}

impl SpfEnforcement {
    /// Build the policy from a validated configuration snapshot.
    #[must_use]
    pub fn new(
        config: &Config,
        cache: std::sync::Arc<dyn Cache>,
        adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
        evaluator: std::sync::Arc<dyn SpfEvaluator>,
    ) -> Self {
        Self {
            actions: config.spf_actions.clone(),
            timeout: config.spf.timeout,
            cache,
            adapter,
            evaluator,
        }
    }

    /// Is any recipient domain opted into SPF enforcement? Resolved
    /// through the 1 h `spf:opt:<domain>` flag cache.
    async fn gated(&self, request: &PolicyRequest) -> anyhow::Result<bool> {
        for recipient in request.recipients() {
            let Some(domain) = address_domain(recipient) else {
                continue;
            };
            let key = keys::spf_option(&domain);
            let enabled = match self.cache.get(&key).await?.as_deref() {
                Some("1") => true,
                Some("0") => false,
                _ => {
                    let flags = self.adapter.domain_flags(&domain).await?;
                    let enabled = flags.map_or(false, |flags| flags.check_spf);
                    self.cache
                        .set_ex(&key, if enabled { "1" } else { "0" }, HOUR_TTL)
                        .await?;
                    enabled
                }
            };
            if enabled {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn evaluate_request(&self, request: &PolicyRequest) -> SpfOutcome {
        let Some(client_ip) = request
            .client_address()
            .and_then(|ip| ip.parse::<std::net::IpAddr>().ok())
        else {
            return SpfOutcome::temperror("request carries no usable client_address");
        };

        match tokio::time::timeout(
            self.timeout,
            self.evaluator
                .evaluate(client_ip, request.helo_name(), request.sender()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                tracing::warn!(timeout = ?self.timeout, "SPF evaluation timed out");
                SpfOutcome::temperror("SPF evaluation timed out")
            }
        }
    }

    /// RFC 7208 §9.1 trace header, passed to Postfix as a `PREPEND`.
    fn received_spf(request: &PolicyRequest, outcome: &SpfOutcome) -> String {
        format!(
            "Received-SPF: {} ({}) client-ip={}; envelope-from={}; helo={};",
            outcome.result,
            outcome.explanation,
            request.client_address().unwrap_or("unknown"),
            request.sender(),
            request.helo_name().unwrap_or("unknown"),
        )
    }

    async fn decide(&self, request: &PolicyRequest) -> anyhow::Result<Verdict> {
        if !self.gated(request).await? {
            return Ok(Verdict::Final(Action::Dunno));
        }

        let outcome = self.evaluate_request(request).await;
        tracing::debug!(result = %outcome.result, explanation = %outcome.explanation, "spf evaluated");

        Ok(match self.actions.action_for(outcome.result) {
            SpfDirective::Prepend => {
                Verdict::Final(Action::Prepend(Self::received_spf(request, &outcome)))
            }
            SpfDirective::Okay => Verdict::Final(Action::Ok),
            SpfDirective::Dunno => Verdict::Final(Action::Dunno),
            SpfDirective::Reject => Verdict::Final(Action::Reject(Some(format!(
                "SPF check failed: {}",
                outcome.explanation,
            )))),
            SpfDirective::DeferIfPermit => Verdict::Final(Action::DeferIfPermit(
                "Service temporarily unavailable - SPF".to_owned(),
            )),
            SpfDirective::Greylist => Verdict::Greylist {
                accept: Some(Action::Prepend(Self::received_spf(request, &outcome))),
            },
            SpfDirective::Literal(text) => {
                let rendered = text.replace("{reason}", &outcome.explanation);
                match rendered.parse::<Action>() {
                    Ok(action) => Verdict::Final(action),
                    Err(error) => {
                        tracing::error!(%error, %rendered, "configured SPF directive does not parse");
                        Verdict::Final(Action::Dunno)
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl Policy for SpfEnforcement {
    fn name(&self) -> &'static str {
        "spf-enforcement"
    }

    async fn approve(&self, request: &PolicyRequest) -> Verdict {
        self.decide(request)
            .await
            .unwrap_or_else(|error| degrade(self.name(), &error))
    }
}

/// Canned evaluator for tests: fixed outcome, optional artificial latency,
/// and a call counter to assert gating.
#[cfg(any(test, feature = "testing"))]
pub struct StaticSpfEvaluator {
    outcome: SpfOutcome,
    delay: Option<std::time::Duration>,
    calls: std::sync::atomic::AtomicU64,
}

#[cfg(any(test, feature = "testing"))]
impl StaticSpfEvaluator {
    /// Always answer `result` with `explanation`.
    #[must_use]
    pub fn returning(result: SpfResult, explanation: &str) -> Self {
        Self {
            outcome: SpfOutcome {
                result,
                explanation: explanation.to_owned(),
            },
            delay: None,
            calls: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Sleep before answering (timeout tests).
    #[must_use]
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many evaluations were requested.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait::async_trait]
impl SpfEvaluator for StaticSpfEvaluator {
    async fn evaluate(
        &self,
        _client_ip: std::net::IpAddr,
        _helo: Option<&str>,
        _mail_from: &str,
    ) -> SpfOutcome {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapps_store::{MemoryCache, TestAdapter};
    use pretty_assertions::assert_eq;

    fn request() -> PolicyRequest {
        [
            ("instance", "s.0"),
            ("client_address", "1.2.3.4"),
            ("helo_name", "mx.x"),
            ("sender", "s@x"),
            ("recipient", "r@y"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    fn policy(ini: &str, adapter: TestAdapter, evaluator: StaticSpfEvaluator) -> SpfEnforcement {
        let config = Config::from_ini_str(ini).unwrap();
        SpfEnforcement::new(
            &config,
            std::sync::Arc::new(MemoryCache::new()),
            std::sync::Arc::new(adapter),
            std::sync::Arc::new(evaluator),
        )
    }

    fn spf_domain() -> TestAdapter {
        TestAdapter::new().with_domain_flags("y", false, true)
    }

    #[tokio::test]
    async fn ungated_domains_skip_the_evaluation() {
        let evaluator = StaticSpfEvaluator::returning(SpfResult::Fail, "nope");
        let policy = policy("", TestAdapter::new(), evaluator);
        assert_eq!(policy.approve(&request()).await, Verdict::Final(Action::Dunno));
    }

    #[tokio::test]
    async fn a_pass_prepends_the_trace_header() {
        let policy = policy(
            "",
            spf_domain(),
            StaticSpfEvaluator::returning(SpfResult::Pass, "mechanism ip4 matched"),
        );
        let verdict = policy.approve(&request()).await;
        let Verdict::Final(Action::Prepend(header)) = verdict else {
            panic!("expected PREPEND, got {verdict:?}");
        };
        assert!(header.starts_with("Received-SPF: pass"));
        assert!(header.contains("client-ip=1.2.3.4"));
    }

    #[tokio::test]
    async fn a_fail_renders_the_literal_with_the_reason() {
        let policy = policy(
            "",
            spf_domain(),
            StaticSpfEvaluator::returning(SpfResult::Fail, "ip not permitted"),
        );
        assert_eq!(
            policy.approve(&request()).await,
            Verdict::Final(
                "550 5.7.1 SPF check failed: ip not permitted".parse().unwrap(),
            ),
        );
    }

    #[tokio::test]
    async fn a_softfail_delegates_to_greylisting() {
        let policy = policy(
            "",
            spf_domain(),
            StaticSpfEvaluator::returning(SpfResult::Softfail, "~all"),
        );
        let verdict = policy.approve(&request()).await;
        let Verdict::Greylist { accept: Some(Action::Prepend(header)) } = verdict else {
            panic!("expected greylist delegation, got {verdict:?}");
        };
        assert!(header.starts_with("Received-SPF: softfail"));
    }

    #[tokio::test]
    async fn a_slow_evaluation_collapses_to_temperror() {
        let policy = policy(
            "[SPFEnforcementPolicy]\ntimeout = 20ms\n",
            spf_domain(),
            StaticSpfEvaluator::returning(SpfResult::Pass, "never arrives")
                .with_delay(std::time::Duration::from_secs(2)),
        );
        assert_eq!(
            policy.approve(&request()).await,
            Verdict::Final(
                "451 4.4.3 SPF record(s) temporarily unavailable: SPF evaluation timed out"
                    .parse()
                    .unwrap(),
            ),
        );
    }

    #[tokio::test]
    async fn a_missing_client_address_is_a_temperror() {
        let policy = policy(
            "",
            spf_domain(),
            StaticSpfEvaluator::returning(SpfResult::Pass, "unused"),
        );
        let no_ip: PolicyRequest = [("instance", "s.1"), ("sender", "s@x"), ("recipient", "r@y")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        let verdict = policy.approve(&no_ip).await;
        let Verdict::Final(Action::Code { code: 451, .. }) = verdict else {
            panic!("expected 451 temperror, got {verdict:?}");
        };
    }
}

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

use crate::{
    directive, Greylisting, OutboundQuota, Policy, SenderDomainAuth, SpfEnforcement,
    SpfEvaluator, Verdict,
};
use chapps_common::{Action, PolicyRequest};
use chapps_config::Config;
use chapps_store::{keys, Cache, PolicyConfigAdapter};

/// Postfix re-queries the same instance several times; remembering the
/// aggregate action this long keeps repeats byte-identical and free.
const HANDLER_TTL: std::time::Duration = std::time::Duration::from_secs(600);

/// Runs policies in order and folds their verdicts into one action.
///
/// The fold: `Final` stops the cascade, `Next` records an action a later
/// policy may override, and `Greylist` hands over to the following stage
/// while remembering the accept-side action to answer with if that stage
/// lets the message through. The aggregate is cached per Postfix instance
/// id under `handler:<instance>`.
pub struct CascadingPolicyHandler {
    policies: Vec<std::sync::Arc<dyn Policy>>,
    cache: std::sync::Arc<dyn Cache>,
    default_defer: Action,
    fallback: Action,
}

impl CascadingPolicyHandler {
    /// Compose an explicit policy list.
    #[must_use]
    pub fn from_policies(
        policies: Vec<std::sync::Arc<dyn Policy>>,
        cache: std::sync::Arc<dyn Cache>,
        default_defer: Action,
    ) -> Self {
        Self {
            policies,
            cache,
            default_defer,
            fallback: Action::Dunno,
        }
    }

    /// The outbound multipolicy: sender-domain authorisation, then quota.
    ///
    /// # Errors
    ///
    /// * a configured directive fails to parse
    pub fn outbound(
        config: &Config,
        cache: std::sync::Arc<dyn Cache>,
        adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
    ) -> anyhow::Result<Self> {
        let auth = SenderDomainAuth::new(config, cache.clone(), adapter.clone())?;
        let quota = OutboundQuota::new(config, cache.clone(), adapter)?;
        Ok(Self::from_policies(
            vec![std::sync::Arc::new(auth), std::sync::Arc::new(quota)],
            cache,
            default_defer(config)?,
        ))
    }

    /// The inbound multipolicy: SPF enforcement, then greylisting.
    ///
    /// # Errors
    ///
    /// * a configured directive fails to parse
    pub fn inbound(
        config: &Config,
        cache: std::sync::Arc<dyn Cache>,
        adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
        evaluator: std::sync::Arc<dyn SpfEvaluator>,
    ) -> anyhow::Result<Self> {
        let spf = SpfEnforcement::new(config, cache.clone(), adapter.clone(), evaluator);
        let greylist = Greylisting::new(config, cache.clone(), adapter)?;
        Ok(Self::from_policies(
            vec![std::sync::Arc::new(spf), std::sync::Arc::new(greylist)],
            cache,
            default_defer(config)?,
        ))
    }

    /// A single-policy service around the quota policy.
    ///
    /// # Errors
    ///
    /// * a configured directive fails to parse
    pub fn outbound_quota(
        config: &Config,
        cache: std::sync::Arc<dyn Cache>,
        adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
    ) -> anyhow::Result<Self> {
        let quota = OutboundQuota::new(config, cache.clone(), adapter)?;
        Ok(Self::from_policies(
            vec![std::sync::Arc::new(quota)],
            cache,
            default_defer(config)?,
        ))
    }

    /// A single-policy service around sender-domain authorisation.
    ///
    /// # Errors
    ///
    /// * a configured directive fails to parse
    pub fn sender_domain_auth(
        config: &Config,
        cache: std::sync::Arc<dyn Cache>,
        adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
    ) -> anyhow::Result<Self> {
        let auth = SenderDomainAuth::new(config, cache.clone(), adapter)?;
        Ok(Self::from_policies(
            vec![std::sync::Arc::new(auth)],
            cache,
            default_defer(config)?,
        ))
    }

    /// A single-policy service around greylisting.
    ///
    /// # Errors
    ///
    /// * a configured directive fails to parse
    pub fn greylisting(
        config: &Config,
        cache: std::sync::Arc<dyn Cache>,
        adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
    ) -> anyhow::Result<Self> {
        let greylist = Greylisting::new(config, cache.clone(), adapter)?;
        Ok(Self::from_policies(
            vec![std::sync::Arc::new(greylist)],
            cache,
            default_defer(config)?,
        ))
    }

    /// A single-policy service around SPF enforcement. `greylist`-mapped
    /// results fall back to the default defer action here, since no
    /// greylisting stage follows.
    ///
    /// # Errors
    ///
    /// * a configured directive fails to parse
    pub fn spf_enforcement(
        config: &Config,
        cache: std::sync::Arc<dyn Cache>,
        adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
        evaluator: std::sync::Arc<dyn SpfEvaluator>,
    ) -> anyhow::Result<Self> {
        let spf = SpfEnforcement::new(config, cache.clone(), adapter, evaluator);
        Ok(Self::from_policies(
            vec![std::sync::Arc::new(spf)],
            cache,
            default_defer(config)?,
        ))
    }

    /// Decide on one request.
    #[tracing::instrument(
        name = "handle-request",
        skip_all,
        fields(instance = request.instance().unwrap_or("-")),
    )]
    pub async fn handle(&self, request: &PolicyRequest) -> Action {
        let handler_key = request.instance().map(keys::handler);
        if let Some(key) = &handler_key {
            match self.cache.get(key).await {
                Ok(Some(cached)) => match cached.parse::<Action>() {
                    Ok(action) => {
                        tracing::debug!("instance already decided");
                        return action;
                    }
                    Err(error) => {
                        tracing::warn!(%error, %cached, "unparsable cached action, re-deciding");
                    }
                },
                Ok(None) => {}
                Err(error) => tracing::warn!(%error, "instance cache unavailable"),
            }
        }

        let mut action = self.fallback.clone();
        let mut greylist_accept: Option<Action> = None;
        for policy in &self.policies {
            match policy.approve(request).await {
                Verdict::Final(final_action) => {
                    tracing::debug!(policy = policy.name(), action = %final_action, "cascade terminated");
                    action = if final_action.is_rejection() {
                        final_action
                    } else {
                        greylist_accept.take().unwrap_or(final_action)
                    };
                    break;
                }
                Verdict::Next(next_action) => action = next_action,
                Verdict::Greylist { accept } => {
                    greylist_accept = accept;
                    action = self.default_defer.clone();
                }
            }
        }

        if let Some(key) = &handler_key {
            if let Err(error) = self
                .cache
                .set_ex(key, &action.to_string(), HANDLER_TTL)
                .await
            {
                tracing::warn!(%error, "cannot cache the instance action");
            }
        }
        action
    }
}

fn default_defer(config: &Config) -> anyhow::Result<Action> {
    directive(
        "[GreylistingPolicy] rejection_message",
        &config.greylisting.rejection_message,
    )
}

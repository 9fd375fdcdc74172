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

use crate::{socket_bind_anyhow, spawn_signal_listener, Server, ServiceState, SignalEvent};
use anyhow::Context;
use chapps_config::Config;
use chapps_policy::{CascadingPolicyHandler, SpfEvaluator, ViaspfEvaluator};
use chapps_store::{Cache, MySqlAdapter, PolicyConfigAdapter, RedisCache};

/// Which handler this process runs: one process per policy, or one of the
/// two multipolicy pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Sender-domain authorisation cascading into outbound quota.
    Outbound,
    /// SPF enforcement cascading into greylisting.
    Inbound,
    /// Outbound quota alone.
    OutboundQuota,
    /// Sender-domain authorisation alone.
    SenderDomainAuth,
    /// Greylisting alone.
    Greylisting,
    /// SPF enforcement alone.
    SpfEnforcement,
}

impl ServiceKind {
    /// The listener endpoint: each policy section carries its own; the
    /// multipolicies listen where their first policy does.
    #[must_use]
    pub fn listen_addr(&self, config: &Config) -> (String, u16) {
        match self {
            Self::Outbound | Self::SenderDomainAuth => (
                config.sender_domain_auth.listen_address.clone(),
                config.sender_domain_auth.listen_port,
            ),
            Self::Inbound | Self::SpfEnforcement => {
                (config.spf.listen_address.clone(), config.spf.listen_port)
            }
            Self::OutboundQuota => (
                config.outbound_quota.listen_address.clone(),
                config.outbound_quota.listen_port,
            ),
            Self::Greylisting => (
                config.greylisting.listen_address.clone(),
                config.greylisting.listen_port,
            ),
        }
    }

    const fn needs_spf(self) -> bool {
        matches!(self, Self::Inbound | Self::SpfEnforcement)
    }

    /// Assemble the policy pipeline for this service.
    ///
    /// # Errors
    ///
    /// * a configured directive fails to parse
    /// * the service needs SPF but no evaluator was supplied
    pub fn build_handler(
        self,
        config: &Config,
        cache: std::sync::Arc<dyn Cache>,
        adapter: std::sync::Arc<dyn PolicyConfigAdapter>,
        evaluator: Option<std::sync::Arc<dyn SpfEvaluator>>,
    ) -> anyhow::Result<CascadingPolicyHandler> {
        let spf_evaluator = || {
            evaluator
                .clone()
                .context("this service evaluates SPF and needs an evaluator")
        };
        match self {
            Self::Outbound => CascadingPolicyHandler::outbound(config, cache, adapter),
            Self::Inbound => {
                CascadingPolicyHandler::inbound(config, cache, adapter, spf_evaluator()?)
            }
            Self::OutboundQuota => {
                CascadingPolicyHandler::outbound_quota(config, cache, adapter)
            }
            Self::SenderDomainAuth => {
                CascadingPolicyHandler::sender_domain_auth(config, cache, adapter)
            }
            Self::Greylisting => CascadingPolicyHandler::greylisting(config, cache, adapter),
            Self::SpfEnforcement => CascadingPolicyHandler::spf_enforcement(
                config,
                cache,
                adapter,
                spf_evaluator()?,
            ),
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
            Self::OutboundQuota => "outbound-quota",
            Self::SenderDomainAuth => "sender-domain-auth",
            Self::Greylisting => "greylisting",
            Self::SpfEnforcement => "spf-enforcement",
        })
    }
}

/// Bring one policy service up and keep it up: connect the stores, build
/// the pipeline, listen, reload on `SIGHUP`, drain on `SIGTERM`.
///
/// # Errors
///
/// * startup only: unreachable stores, unusable configuration, bind
///   failures. Once listening, errors are handled per connection.
pub async fn run(kind: ServiceKind, config: Config) -> anyhow::Result<()> {
    let config = std::sync::Arc::new(config);

    let cache: std::sync::Arc<dyn Cache> = std::sync::Arc::new(
        RedisCache::connect(&config.redis)
            .await
            .context("cannot reach the redis cache")?,
    );
    let adapter: std::sync::Arc<dyn PolicyConfigAdapter> = std::sync::Arc::new(
        MySqlAdapter::new(&config.adapter).context("cannot set up the policy-config adapter")?,
    );
    let evaluator: Option<std::sync::Arc<dyn SpfEvaluator>> = if kind.needs_spf() {
        Some(std::sync::Arc::new(ViaspfEvaluator::new(
            config.spf.timeout,
        )?))
    } else {
        None
    };

    let handler = kind.build_handler(&config, cache.clone(), adapter.clone(), evaluator.clone())?;
    let (state_tx, state_rx) = tokio::sync::watch::channel(std::sync::Arc::new(ServiceState {
        config: config.clone(),
        handler,
    }));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut signals = spawn_signal_listener()?;
    let reload_path = config.path.clone();
    tokio::spawn(async move {
        while let Some(event) = signals.recv().await {
            match event {
                SignalEvent::Reload => {
                    let Some(path) = reload_path.as_deref() else {
                        tracing::warn!("SIGHUP received but no config file to re-read");
                        continue;
                    };
                    match Config::from_path(path).and_then(|fresh| {
                        let fresh = std::sync::Arc::new(fresh);
                        let handler = kind.build_handler(
                            &fresh,
                            cache.clone(),
                            adapter.clone(),
                            evaluator.clone(),
                        )?;
                        Ok(std::sync::Arc::new(ServiceState {
                            config: fresh,
                            handler,
                        }))
                    }) {
                        Ok(state) => {
                            tracing::info!("configuration reloaded");
                            let _err = state_tx.send(state);
                        }
                        Err(error) => {
                            tracing::error!(
                                error = %format!("{error:#}"),
                                "configuration reload failed, keeping the old snapshot",
                            );
                        }
                    }
                }
                SignalEvent::Shutdown => {
                    tracing::info!("shutdown requested");
                    let _err = shutdown_tx.send(true);
                    return;
                }
            }
        }
    });

    let socket = socket_bind_anyhow(kind.listen_addr(&config))?;
    tracing::info!(service = %kind, "chapps policy service starting");
    Server::new(state_rx).listen(socket, shutdown_rx).await
}

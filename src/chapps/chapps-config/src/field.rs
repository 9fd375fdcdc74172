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

use crate::Margin;
use chapps_common::{SpfResult, UserKeyPolicy};

/// `[CHAPPS]`: process-wide behaviour.
///
/// The INI front-end folds keys to lowercase, which is why the section
/// renames on [`crate::Config`] look squashed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FieldCore {
    /// WHATWG label of the payload decoder (`utf-8`, `latin1`, ...).
    #[serde(default = "FieldCore::default_payload_encoding")]
    pub payload_encoding: String,
    /// Primary user-key attribute.
    #[serde(default = "FieldCore::default_user_key")]
    pub user_key: String,
    /// Fallback attributes consulted in order when the primary is empty.
    #[serde(
        default = "FieldCore::default_user_key_candidates",
        deserialize_with = "list_of_names"
    )]
    pub user_key_candidates: Vec<String>,
    /// When set, only the primary attribute identifies the client.
    #[serde(default)]
    pub require_user_key: bool,
    /// Directive answered when no user key can be extracted.
    #[serde(default = "FieldCore::default_no_user_key_response")]
    pub no_user_key_response: String,
    /// Cap on one request, bytes.
    #[serde(default = "FieldCore::default_payload_size_limit")]
    pub payload_size_limit: usize,
    /// Total wall-clock allowed per request before the fallback answers.
    #[serde(default = "FieldCore::default_request_budget", with = "humantime_serde")]
    pub request_budget: std::time::Duration,
    ///
    #[serde(default = "FieldCore::default_log_directory")]
    pub log_directory: std::path::PathBuf,
    /// `tracing_subscriber::EnvFilter` directive(s).
    #[serde(default = "FieldCore::default_log_level")]
    pub log_level: String,
    /// Tokio worker threads; 0 means `max(4, 2 x CPU)`.
    #[serde(default)]
    pub worker_threads: usize,
    /// Concurrent connection cap; -1 disables the clamp.
    #[serde(default = "FieldCore::default_client_count_max")]
    pub client_count_max: i64,
}

impl FieldCore {
    /// The user-key extraction policy these settings describe.
    #[must_use]
    pub fn user_key_policy(&self) -> UserKeyPolicy {
        UserKeyPolicy::new(
            self.user_key.clone(),
            self.user_key_candidates.clone(),
            self.require_user_key,
        )
    }

    /// Effective tokio worker count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism().map_or(4, |cpus| (cpus.get() * 2).max(4))
        }
    }
}

/// `[Redis]`: cache backend location.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FieldRedis {
    ///
    #[serde(default = "FieldRedis::default_server")]
    pub server: String,
    ///
    #[serde(default = "FieldRedis::default_port")]
    pub port: u16,
    /// `host:port` list; non-empty switches the client to Sentinel.
    #[serde(default, deserialize_with = "list_of_names")]
    pub sentinel_servers: Vec<String>,
    /// Logical master name the Sentinels agree on.
    #[serde(default = "FieldRedis::default_sentinel_dataset")]
    pub sentinel_dataset: String,
    /// Per-operation timeout.
    #[serde(default = "FieldRedis::default_op_timeout", with = "humantime_serde")]
    pub op_timeout: std::time::Duration,
}

impl FieldRedis {
    /// Connection URL for the non-Sentinel case.
    #[must_use]
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.server, self.port)
    }
}

/// `[PolicyConfigAdapter]`: the read-only relational store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FieldAdapter {
    /// Backend name; overridable with `CHAPPS_DB_MODULE`.
    #[serde(default = "FieldAdapter::default_adapter")]
    pub adapter: String,
    ///
    #[serde(default = "FieldAdapter::default_db_host")]
    pub db_host: String,
    ///
    #[serde(default = "FieldAdapter::default_db_port")]
    pub db_port: u16,
    ///
    #[serde(default = "FieldAdapter::default_db_name")]
    pub db_name: String,
    ///
    #[serde(default = "FieldAdapter::default_db_user")]
    pub db_user: String,
    ///
    #[serde(default)]
    pub db_pass: String,
}

impl FieldAdapter {
    /// Backend selection: the `CHAPPS_DB_MODULE` environment variable wins
    /// over the configuration key.
    #[must_use]
    pub fn backend(&self) -> String {
        std::env::var(crate::DB_MODULE_ENV).unwrap_or_else(|_| self.adapter.clone())
    }
}

/// `[OutboundQuotaPolicy]`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct FieldOutboundQuota {
    ///
    #[serde(default = "FieldOutboundQuota::default_listen_address")]
    pub listen_address: String,
    ///
    #[serde(default = "FieldOutboundQuota::default_listen_port")]
    pub listen_port: u16,
    /// Sliding-window length, seconds.
    #[serde(default = "FieldOutboundQuota::default_interval")]
    pub interval: u64,
    /// Grace margin over the stored limit.
    #[serde(default)]
    pub margin: Margin,
    /// Count each RCPT TO against the quota instead of each message.
    #[serde(default)]
    pub counting_recipients: bool,
    /// Experimental send-rate floor, seconds; 0 disables it.
    #[serde(default)]
    pub min_delta: u64,
    ///
    #[serde(default = "FieldOutboundQuota::default_acceptance_message")]
    pub acceptance_message: String,
    ///
    #[serde(default = "FieldOutboundQuota::default_rejection_message")]
    pub rejection_message: String,
}

/// `[SenderDomainAuthPolicy]`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FieldSenderDomainAuth {
    ///
    #[serde(default = "FieldSenderDomainAuth::default_listen_address")]
    pub listen_address: String,
    ///
    #[serde(default = "FieldSenderDomainAuth::default_listen_port")]
    pub listen_port: u16,
    /// Accept the null sender (bounces) without a lookup.
    #[serde(default)]
    pub null_sender_ok: bool,
    ///
    #[serde(default = "FieldSenderDomainAuth::default_acceptance_message")]
    pub acceptance_message: String,
    ///
    #[serde(default = "FieldSenderDomainAuth::default_rejection_message")]
    pub rejection_message: String,
}

/// `[GreylistingPolicy]`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FieldGreylisting {
    ///
    #[serde(default = "FieldGreylisting::default_listen_address")]
    pub listen_address: String,
    ///
    #[serde(default = "FieldGreylisting::default_listen_port")]
    pub listen_port: u16,
    ///
    #[serde(default)]
    pub null_sender_ok: bool,
    /// Deliveries from a client IP in 24 h after which its tuples are no
    /// longer checked.
    #[serde(default = "FieldGreylisting::default_whitelist_threshold")]
    pub whitelist_threshold: u64,
    ///
    #[serde(default = "FieldGreylisting::default_acceptance_message")]
    pub acceptance_message: String,
    /// The defer directive answered on a first sighting.
    #[serde(default = "FieldGreylisting::default_rejection_message")]
    pub rejection_message: String,
}

/// `[SPFEnforcementPolicy]`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FieldSpf {
    ///
    #[serde(default = "FieldSpf::default_listen_address")]
    pub listen_address: String,
    ///
    #[serde(default = "FieldSpf::default_listen_port")]
    pub listen_port: u16,
    /// Total-duration bound on one evaluation; elapsing yields `temperror`.
    #[serde(default = "FieldSpf::default_timeout", with = "humantime_serde")]
    pub timeout: std::time::Duration,
}

/// One entry of the `[PostfixSPFActions]` table: either a symbolic
/// built-in or a literal directive (which may carry `{reason}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpfDirective {
    /// Accept and prepend a `Received-SPF:` header.
    Prepend,
    /// Accept outright (`OK`).
    Okay,
    /// Stand aside (`DUNNO`).
    Dunno,
    /// Reject with the stock text.
    Reject,
    /// Defer with the stock text.
    DeferIfPermit,
    /// Delegate the decision to the greylisting stage.
    Greylist,
    /// A literal Postfix directive; `{reason}` is substituted with the
    /// evaluator's explanation.
    Literal(String),
}

impl<'de> serde::Deserialize<'de> for SpfDirective {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "prepend" => Self::Prepend,
            "okay" | "ok" => Self::Okay,
            "dunno" => Self::Dunno,
            "reject" => Self::Reject,
            "defer_if_permit" => Self::DeferIfPermit,
            "greylist" => Self::Greylist,
            _ => Self::Literal(raw.trim().to_owned()),
        })
    }
}

/// `[PostfixSPFActions]`: what to answer for each SPF result.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FieldSpfActions {
    ///
    #[serde(default = "FieldSpfActions::default_pass")]
    pub pass: SpfDirective,
    ///
    #[serde(default = "FieldSpfActions::default_fail")]
    pub fail: SpfDirective,
    ///
    #[serde(default = "FieldSpfActions::default_softfail")]
    pub softfail: SpfDirective,
    ///
    #[serde(default = "FieldSpfActions::default_neutral")]
    pub neutral: SpfDirective,
    ///
    #[serde(default = "FieldSpfActions::default_none")]
    pub none: SpfDirective,
    ///
    #[serde(default = "FieldSpfActions::default_temperror")]
    pub temperror: SpfDirective,
    ///
    #[serde(default = "FieldSpfActions::default_permerror")]
    pub permerror: SpfDirective,
}

impl FieldSpfActions {
    /// Table lookup; total over the closed result set.
    #[must_use]
    pub const fn action_for(&self, result: SpfResult) -> &SpfDirective {
        match result {
            SpfResult::Pass => &self.pass,
            SpfResult::Fail => &self.fail,
            SpfResult::Softfail => &self.softfail,
            SpfResult::Neutral => &self.neutral,
            SpfResult::None => &self.none,
            SpfResult::Temperror => &self.temperror,
            SpfResult::Permerror => &self.permerror,
        }
    }
}

/// Comma- or whitespace-separated name list.
fn list_of_names<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    use serde::Deserialize;
    let raw = String::deserialize(deserializer)?;
    Ok(raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect())
}

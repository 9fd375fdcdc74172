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

use crate::field::{
    FieldAdapter, FieldCore, FieldGreylisting, FieldOutboundQuota, FieldRedis,
    FieldSenderDomainAuth, FieldSpf, FieldSpfActions, SpfDirective,
};
use crate::{Config, Margin};

impl Default for Config {
    fn default() -> Self {
        Self {
            core: FieldCore::default(),
            redis: FieldRedis::default(),
            adapter: FieldAdapter::default(),
            outbound_quota: FieldOutboundQuota::default(),
            sender_domain_auth: FieldSenderDomainAuth::default(),
            greylisting: FieldGreylisting::default(),
            spf: FieldSpf::default(),
            spf_actions: FieldSpfActions::default(),
            path: None,
        }
    }
}

impl Default for FieldCore {
    fn default() -> Self {
        Self {
            payload_encoding: Self::default_payload_encoding(),
            user_key: Self::default_user_key(),
            user_key_candidates: Self::default_user_key_candidates(),
            require_user_key: false,
            no_user_key_response: Self::default_no_user_key_response(),
            payload_size_limit: Self::default_payload_size_limit(),
            request_budget: Self::default_request_budget(),
            log_directory: Self::default_log_directory(),
            log_level: Self::default_log_level(),
            worker_threads: 0,
            client_count_max: Self::default_client_count_max(),
        }
    }
}

impl FieldCore {
    pub(crate) fn default_payload_encoding() -> String {
        "utf-8".to_owned()
    }

    pub(crate) fn default_user_key() -> String {
        "sasl_username".to_owned()
    }

    pub(crate) fn default_user_key_candidates() -> Vec<String> {
        ["ccert_subject", "sender", "client_address"]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    pub(crate) fn default_no_user_key_response() -> String {
        "REJECT Rejected - unauthenticated".to_owned()
    }

    pub(crate) const fn default_payload_size_limit() -> usize {
        64 * 1024
    }

    pub(crate) const fn default_request_budget() -> std::time::Duration {
        std::time::Duration::from_secs(10)
    }

    pub(crate) fn default_log_directory() -> std::path::PathBuf {
        "/var/log/chapps".into()
    }

    pub(crate) fn default_log_level() -> String {
        "warn".to_owned()
    }

    pub(crate) const fn default_client_count_max() -> i64 {
        1024
    }
}

impl Default for FieldRedis {
    fn default() -> Self {
        Self {
            server: Self::default_server(),
            port: Self::default_port(),
            sentinel_servers: Vec::new(),
            sentinel_dataset: Self::default_sentinel_dataset(),
            op_timeout: Self::default_op_timeout(),
        }
    }
}

impl FieldRedis {
    pub(crate) fn default_server() -> String {
        "127.0.0.1".to_owned()
    }

    pub(crate) const fn default_port() -> u16 {
        6379
    }

    pub(crate) fn default_sentinel_dataset() -> String {
        "chapps".to_owned()
    }

    pub(crate) const fn default_op_timeout() -> std::time::Duration {
        std::time::Duration::from_secs(2)
    }
}

impl Default for FieldAdapter {
    fn default() -> Self {
        Self {
            adapter: Self::default_adapter(),
            db_host: Self::default_db_host(),
            db_port: Self::default_db_port(),
            db_name: Self::default_db_name(),
            db_user: Self::default_db_user(),
            db_pass: String::new(),
        }
    }
}

impl FieldAdapter {
    pub(crate) fn default_adapter() -> String {
        "mariadb".to_owned()
    }

    pub(crate) fn default_db_host() -> String {
        "127.0.0.1".to_owned()
    }

    pub(crate) const fn default_db_port() -> u16 {
        3306
    }

    pub(crate) fn default_db_name() -> String {
        "chapps".to_owned()
    }

    pub(crate) fn default_db_user() -> String {
        "chapps".to_owned()
    }
}

impl Default for FieldOutboundQuota {
    fn default() -> Self {
        Self {
            listen_address: Self::default_listen_address(),
            listen_port: Self::default_listen_port(),
            interval: Self::default_interval(),
            margin: Margin::default(),
            counting_recipients: false,
            min_delta: 0,
            acceptance_message: Self::default_acceptance_message(),
            rejection_message: Self::default_rejection_message(),
        }
    }
}

impl FieldOutboundQuota {
    pub(crate) fn default_listen_address() -> String {
        "localhost".to_owned()
    }

    pub(crate) const fn default_listen_port() -> u16 {
        10225
    }

    pub(crate) const fn default_interval() -> u64 {
        86400
    }

    pub(crate) fn default_acceptance_message() -> String {
        "DUNNO".to_owned()
    }

    pub(crate) fn default_rejection_message() -> String {
        "REJECT Outbound quota fulfilled".to_owned()
    }
}

impl Default for FieldSenderDomainAuth {
    fn default() -> Self {
        Self {
            listen_address: Self::default_listen_address(),
            listen_port: Self::default_listen_port(),
            null_sender_ok: false,
            acceptance_message: Self::default_acceptance_message(),
            rejection_message: Self::default_rejection_message(),
        }
    }
}

impl FieldSenderDomainAuth {
    pub(crate) fn default_listen_address() -> String {
        "localhost".to_owned()
    }

    pub(crate) const fn default_listen_port() -> u16 {
        10227
    }

    pub(crate) fn default_acceptance_message() -> String {
        "DUNNO".to_owned()
    }

    pub(crate) fn default_rejection_message() -> String {
        "REJECT Sender address not authorized for this user".to_owned()
    }
}

impl Default for FieldGreylisting {
    fn default() -> Self {
        Self {
            listen_address: Self::default_listen_address(),
            listen_port: Self::default_listen_port(),
            null_sender_ok: false,
            whitelist_threshold: Self::default_whitelist_threshold(),
            acceptance_message: Self::default_acceptance_message(),
            rejection_message: Self::default_rejection_message(),
        }
    }
}

impl FieldGreylisting {
    pub(crate) fn default_listen_address() -> String {
        "localhost".to_owned()
    }

    pub(crate) const fn default_listen_port() -> u16 {
        10226
    }

    pub(crate) const fn default_whitelist_threshold() -> u64 {
        10
    }

    pub(crate) fn default_acceptance_message() -> String {
        "DUNNO".to_owned()
    }

    pub(crate) fn default_rejection_message() -> String {
        "DEFER_IF_PERMIT Service temporarily unavailable - greylisted".to_owned()
    }
}

impl Default for FieldSpf {
    fn default() -> Self {
        Self {
            listen_address: Self::default_listen_address(),
            listen_port: Self::default_listen_port(),
            timeout: Self::default_timeout(),
        }
    }
}

impl FieldSpf {
    pub(crate) fn default_listen_address() -> String {
        "localhost".to_owned()
    }

    pub(crate) const fn default_listen_port() -> u16 {
        10228
    }

    pub(crate) const fn default_timeout() -> std::time::Duration {
        std::time::Duration::from_secs(20)
    }
}

impl Default for FieldSpfActions {
    fn default() -> Self {
        Self {
            pass: Self::default_pass(),
            fail: Self::default_fail(),
            softfail: Self::default_softfail(),
            neutral: Self::default_neutral(),
            none: Self::default_none(),
            temperror: Self::default_temperror(),
            permerror: Self::default_permerror(),
        }
    }
}

impl FieldSpfActions {
    pub(crate) const fn default_pass() -> SpfDirective {
        SpfDirective::Prepend
    }

    pub(crate) fn default_fail() -> SpfDirective {
        SpfDirective::Literal("550 5.7.1 SPF check failed: {reason}".to_owned())
    }

    pub(crate) const fn default_softfail() -> SpfDirective {
        SpfDirective::Greylist
    }

    pub(crate) const fn default_neutral() -> SpfDirective {
        SpfDirective::Greylist
    }

    pub(crate) const fn default_none() -> SpfDirective {
        SpfDirective::Greylist
    }

    pub(crate) fn default_temperror() -> SpfDirective {
        SpfDirective::Literal(
            "451 4.4.3 SPF record(s) temporarily unavailable: {reason}".to_owned(),
        )
    }

    pub(crate) fn default_permerror() -> SpfDirective {
        SpfDirective::Literal("550 5.5.2 SPF record(s) are malformed: {reason}".to_owned())
    }
}

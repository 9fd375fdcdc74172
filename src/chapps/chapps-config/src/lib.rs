//! chapps-config
//!
//! Typed view of the CHAPPS INI configuration file, with the defaults an
//! unconfigured installation runs on and validation of everything that
//! must be refused at startup rather than at request time.

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

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

mod default;
mod margin;

/// Per-section configuration structs.
pub mod field;

pub use margin::Margin;

use anyhow::Context;
use chapps_common::Action;
use field::{
    FieldAdapter, FieldCore, FieldGreylisting, FieldOutboundQuota, FieldRedis,
    FieldSenderDomainAuth, FieldSpf, FieldSpfActions, SpfDirective,
};

/// Environment variable overriding the configuration file path.
pub const CONFIG_ENV: &str = "CHAPPS_CONFIG";

/// Environment variable overriding the `[PolicyConfigAdapter] adapter` key.
pub const DB_MODULE_ENV: &str = "CHAPPS_DB_MODULE";

/// Where the configuration lives when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/chapps/chappsd.ini";

/// The whole configuration file.
///
/// Section names are folded to lowercase by the INI front-end, hence the
/// renames; the file itself spells them `[CHAPPS]`, `[Redis]`,
/// `[OutboundQuotaPolicy]` and so on (see `install/chappsd.ini`).
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Config {
    /// `[CHAPPS]`
    #[serde(default, rename = "chapps")]
    pub core: FieldCore,
    /// `[Redis]`
    #[serde(default, rename = "redis")]
    pub redis: FieldRedis,
    /// `[PolicyConfigAdapter]`
    #[serde(default, rename = "policyconfigadapter")]
    pub adapter: FieldAdapter,
    /// `[OutboundQuotaPolicy]`
    #[serde(default, rename = "outboundquotapolicy")]
    pub outbound_quota: FieldOutboundQuota,
    /// `[SenderDomainAuthPolicy]`
    #[serde(default, rename = "senderdomainauthpolicy")]
    pub sender_domain_auth: FieldSenderDomainAuth,
    /// `[GreylistingPolicy]`
    #[serde(default, rename = "greylistingpolicy")]
    pub greylisting: FieldGreylisting,
    /// `[SPFEnforcementPolicy]`
    #[serde(default, rename = "spfenforcementpolicy")]
    pub spf: FieldSpf,
    /// `[PostfixSPFActions]`
    #[serde(default, rename = "postfixspfactions")]
    pub spf_actions: FieldSpfActions,
    /// Where this snapshot was read from; `None` for built-in defaults.
    #[serde(skip)]
    pub path: Option<std::path::PathBuf>,
}

impl Config {
    /// Load and validate the file at `path`.
    ///
    /// # Errors
    ///
    /// * unreadable or unparsable file
    /// * any value [`Self::ensure_valid`] refuses
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config: Self = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Ini))
            .build()
            .with_context(|| format!("cannot read configuration at '{}'", path.display()))?
            .try_deserialize()
            .with_context(|| format!("invalid configuration in '{}'", path.display()))?;
        config.path = Some(path.to_path_buf());
        config.ensure_valid()?;
        Ok(config)
    }

    /// Load from `$CHAPPS_CONFIG`, falling back to
    /// [`DEFAULT_CONFIG_PATH`].
    ///
    /// # Errors
    ///
    /// * see [`Self::from_path`]
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var_os(CONFIG_ENV).map_or_else(
            || std::path::PathBuf::from(DEFAULT_CONFIG_PATH),
            std::path::PathBuf::from,
        );
        Self::from_path(&path)
    }

    /// Parse configuration out of an INI string (tests, mostly).
    ///
    /// # Errors
    ///
    /// * see [`Self::from_path`]
    pub fn from_ini_str(ini: &str) -> anyhow::Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(ini, config::FileFormat::Ini))
            .build()
            .context("cannot parse inline configuration")?
            .try_deserialize()
            .context("invalid inline configuration")?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Refuse at load time everything that would otherwise surface as a
    /// per-request failure: unparsable directives, unknown encodings or
    /// adapter backends, degenerate caps.
    ///
    /// # Errors
    ///
    /// * the first offending key, with its section in the message
    pub fn ensure_valid(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.core.payload_size_limit > 0,
            "[CHAPPS] payload_size_limit must be positive",
        );
        anyhow::ensure!(
            encoding_rs::Encoding::for_label(self.core.payload_encoding.as_bytes()).is_some(),
            "[CHAPPS] payload_encoding {:?} is not a known encoding label",
            self.core.payload_encoding,
        );
        anyhow::ensure!(
            !self.core.user_key.trim().is_empty(),
            "[CHAPPS] user_key must name an attribute",
        );

        parse_directive("[CHAPPS] no_user_key_response", &self.core.no_user_key_response)?;
        parse_directive(
            "[OutboundQuotaPolicy] acceptance_message",
            &self.outbound_quota.acceptance_message,
        )?;
        parse_directive(
            "[OutboundQuotaPolicy] rejection_message",
            &self.outbound_quota.rejection_message,
        )?;
        anyhow::ensure!(
            self.outbound_quota.interval > 0,
            "[OutboundQuotaPolicy] interval must be positive",
        );
        parse_directive(
            "[SenderDomainAuthPolicy] acceptance_message",
            &self.sender_domain_auth.acceptance_message,
        )?;
        parse_directive(
            "[SenderDomainAuthPolicy] rejection_message",
            &self.sender_domain_auth.rejection_message,
        )?;
        parse_directive(
            "[GreylistingPolicy] acceptance_message",
            &self.greylisting.acceptance_message,
        )?;
        parse_directive(
            "[GreylistingPolicy] rejection_message",
            &self.greylisting.rejection_message,
        )?;

        for (key, directive) in [
            ("pass", &self.spf_actions.pass),
            ("fail", &self.spf_actions.fail),
            ("softfail", &self.spf_actions.softfail),
            ("neutral", &self.spf_actions.neutral),
            ("none", &self.spf_actions.none),
            ("temperror", &self.spf_actions.temperror),
            ("permerror", &self.spf_actions.permerror),
        ] {
            if let SpfDirective::Literal(text) = directive {
                parse_directive(
                    &format!("[PostfixSPFActions] {key}"),
                    &text.replace("{reason}", "reason"),
                )?;
            }
        }

        let backend = self.adapter.adapter.to_ascii_lowercase();
        anyhow::ensure!(
            matches!(backend.as_str(), "mariadb" | "mysql"),
            "[PolicyConfigAdapter] adapter {:?} is not supported (mariadb, mysql)",
            self.adapter.adapter,
        );

        for server in &self.redis.sentinel_servers {
            anyhow::ensure!(
                server.contains(':'),
                "[Redis] sentinel_servers entry {server:?} is not host:port",
            );
        }

        Ok(())
    }
}

fn parse_directive(key: &str, value: &str) -> anyhow::Result<Action> {
    value
        .parse::<Action>()
        .with_context(|| format!("{key}: {value:?} is not a Postfix directive"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn an_empty_file_yields_the_defaults() {
        let config = Config::from_ini_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.outbound_quota.listen_port, 10225);
        assert_eq!(config.greylisting.whitelist_threshold, 10);
        assert_eq!(config.redis.op_timeout, std::time::Duration::from_secs(2));
        assert_eq!(config.spf.timeout, std::time::Duration::from_secs(20));
    }

    #[test]
    fn sections_override_the_defaults() {
        let config = Config::from_ini_str(
            r"
[CHAPPS]
payload_encoding = latin1
user_key = ccert_subject
require_user_key = true
request_budget = 5s

[Redis]
sentinel_servers = 10.0.0.1:26379, 10.0.0.2:26379
sentinel_dataset = mail

[OutboundQuotaPolicy]
listen_port = 10125
margin = 0.1
counting_recipients = true

[PostfixSPFActions]
softfail = defer_if_permit
fail = 550 5.7.1 go away: {reason}
",
        )
        .unwrap();

        assert_eq!(config.core.payload_encoding, "latin1");
        assert!(config.core.require_user_key);
        assert_eq!(
            config.core.request_budget,
            std::time::Duration::from_secs(5),
        );
        assert_eq!(
            config.redis.sentinel_servers,
            vec!["10.0.0.1:26379".to_owned(), "10.0.0.2:26379".to_owned()],
        );
        assert_eq!(config.outbound_quota.listen_port, 10125);
        assert_eq!(config.outbound_quota.margin, Margin::Fraction(0.1));
        assert!(config.outbound_quota.counting_recipients);
        assert_eq!(config.spf_actions.softfail, SpfDirective::DeferIfPermit);
        assert_eq!(
            config.spf_actions.fail,
            SpfDirective::Literal("550 5.7.1 go away: {reason}".to_owned()),
        );
    }

    #[test]
    fn oversized_margins_are_refused() {
        let err = Config::from_ini_str("[OutboundQuotaPolicy]\nmargin = 150.0\n").unwrap_err();
        assert!(err.to_string().contains("invalid inline configuration"));
    }

    #[test]
    fn unparsable_directives_are_refused() {
        let err = Config::from_ini_str("[GreylistingPolicy]\nrejection_message = hold on\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("rejection_message"));
    }

    #[test]
    fn unknown_encodings_and_backends_are_refused() {
        assert!(Config::from_ini_str("[CHAPPS]\npayload_encoding = utf-9\n").is_err());
        assert!(Config::from_ini_str("[PolicyConfigAdapter]\nadapter = sqlite\n").is_err());
    }

    #[test]
    fn spf_action_table_is_total() {
        use strum::IntoEnumIterator;

        let config = Config::default();
        for result in chapps_common::SpfResult::iter() {
            // every result maps to something; the match in `action_for`
            // makes this a compile-time fact, the loop keeps it observable.
            let _directive = config.spf_actions.action_for(result);
        }
    }
}

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

/// Quota resolution for a user key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserQuota {
    /// No `users` row with that name; such a client cannot send at all.
    NoSuchUser,
    /// The user exists but has no quota association, which also means it
    /// cannot send.
    NoQuota,
    /// Messages allowed per rolling interval.
    Limit(i64),
}

/// Inbound-enforcement flags on a recipient domain.
///
/// A domain row predating the flag columns reads as all-false; a missing
/// row means the adapter returns no flags at all and enforcement stays
/// off for that domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainFlags {
    /// Greylist inbound mail for this domain.
    pub greylist: bool,
    /// Enforce SPF on inbound mail for this domain.
    pub check_spf: bool,
}

/// Read-only view of the relational policy-config store.
///
/// Rows are created and mutated only by the admin API and CLI; the policy
/// service never writes here. Lookups are exact string matches on `name`
/// columns.
#[async_trait::async_trait]
pub trait PolicyConfigAdapter: Send + Sync {
    /// Resolve a user key to its quota.
    async fn user_quota(&self, user: &str) -> Result<UserQuota, AdapterError>;

    /// Is `email` a whole-address authorisation for `user`?
    async fn user_authorized_email(&self, user: &str, email: &str)
        -> Result<bool, AdapterError>;

    /// Is `domain` an authorised sender domain for `user`?
    async fn user_authorized_domain(
        &self,
        user: &str,
        domain: &str,
    ) -> Result<bool, AdapterError>;

    /// Inbound flags for a recipient domain; `None` when unknown.
    async fn domain_flags(&self, domain: &str) -> Result<Option<DomainFlags>, AdapterError>;
}

/// Relational store failure.
#[allow(clippy::module_name_repetitions)]
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The store did not answer, twice in a row.
    #[error("policy-config store unavailable: {0}")]
    Unavailable(#[from] mysql_async::Error),

    /// `CHAPPS_DB_MODULE` (or the `adapter` key) names something this
    /// build cannot speak.
    #[error("unsupported adapter backend {0:?} (supported: mariadb, mysql)")]
    UnsupportedBackend(String),
}

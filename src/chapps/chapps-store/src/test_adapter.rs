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

use crate::{AdapterError, DomainFlags, PolicyConfigAdapter, UserQuota};

/// In-memory policy-config fixture for tests, with a query counter so
/// cache-coherence tests can assert whether the store was consulted.
#[derive(Debug, Default)]
pub struct TestAdapter {
    users: std::collections::HashSet<String>,
    quotas: std::collections::HashMap<String, i64>,
    emails: std::collections::HashSet<(String, String)>,
    domains: std::collections::HashSet<(String, String)>,
    flags: std::collections::HashMap<String, DomainFlags>,
    queries: std::sync::atomic::AtomicU64,
}

impl TestAdapter {
    ///
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `users` row.
    #[must_use]
    pub fn with_user(mut self, user: &str) -> Self {
        self.users.insert(user.to_owned());
        self
    }

    /// Add a user with an associated quota.
    #[must_use]
    pub fn with_quota(mut self, user: &str, limit: i64) -> Self {
        self.users.insert(user.to_owned());
        self.quotas.insert(user.to_owned(), limit);
        self
    }

    /// Authorise a whole email address for a user.
    #[must_use]
    pub fn with_email(mut self, user: &str, email: &str) -> Self {
        self.users.insert(user.to_owned());
        self.emails.insert((user.to_owned(), email.to_owned()));
        self
    }

    /// Authorise a sender domain for a user.
    #[must_use]
    pub fn with_domain(mut self, user: &str, domain: &str) -> Self {
        self.users.insert(user.to_owned());
        self.domains.insert((user.to_owned(), domain.to_owned()));
        self
    }

    /// Set the inbound flags of a recipient domain.
    #[must_use]
    pub fn with_domain_flags(mut self, domain: &str, greylist: bool, check_spf: bool) -> Self {
        self.flags.insert(
            domain.to_owned(),
            DomainFlags {
                greylist,
                check_spf,
            },
        );
        self
    }

    /// How many queries the policies have issued so far.
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.queries.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn tick(&self) {
        self.queries
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl PolicyConfigAdapter for TestAdapter {
    async fn user_quota(&self, user: &str) -> Result<UserQuota, AdapterError> {
        self.tick();
        if !self.users.contains(user) {
            return Ok(UserQuota::NoSuchUser);
        }
        Ok(self
            .quotas
            .get(user)
            .map_or(UserQuota::NoQuota, |limit| UserQuota::Limit(*limit)))
    }

    async fn user_authorized_email(
        &self,
        user: &str,
        email: &str,
    ) -> Result<bool, AdapterError> {
        self.tick();
        Ok(self.emails.contains(&(user.to_owned(), email.to_owned())))
    }

    async fn user_authorized_domain(
        &self,
        user: &str,
        domain: &str,
    ) -> Result<bool, AdapterError> {
        self.tick();
        Ok(self.domains.contains(&(user.to_owned(), domain.to_owned())))
    }

    async fn domain_flags(&self, domain: &str) -> Result<Option<DomainFlags>, AdapterError> {
        self.tick();
        Ok(self.flags.get(domain).copied())
    }
}

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
use chapps_config::field::FieldAdapter;
use mysql_async::params;
use mysql_async::prelude::Queryable;

const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(250);

/// A connection error is worth one retry; SQL-level errors are not.
fn is_transient(error: &mysql_async::Error) -> bool {
    matches!(error, mysql_async::Error::Io(_) | mysql_async::Error::Driver(_))
}

/// Retry the query expression once, with a short backoff, when the first
/// failure looks like a dropped connection.
macro_rules! retry_once {
    ($call:expr) => {{
        match $call {
            Ok(value) => Ok(value),
            Err(error) if is_transient(&error) => {
                tracing::warn!(%error, "policy-config query failed, retrying once");
                tokio::time::sleep(RETRY_BACKOFF).await;
                $call.map_err(AdapterError::from)
            }
            Err(error) => Err(error.into()),
        }
    }};
}

/// MariaDB/MySQL implementation of the policy-config store, over the
/// schema shared with the admin API (`users`, `quotas`, `domains`,
/// `emails` and their join tables).
pub struct MySqlAdapter {
    pool: mysql_async::Pool,
}

impl MySqlAdapter {
    /// Build the process-wide connection pool.
    ///
    /// # Errors
    ///
    /// * [`AdapterError::UnsupportedBackend`] when the configured (or
    ///   `CHAPPS_DB_MODULE`-selected) backend is not a MySQL dialect
    pub fn new(config: &FieldAdapter) -> Result<Self, AdapterError> {
        let backend = config.backend().to_ascii_lowercase();
        if !matches!(backend.as_str(), "mariadb" | "mysql") {
            return Err(AdapterError::UnsupportedBackend(backend));
        }

        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(config.db_host.clone())
            .tcp_port(config.db_port)
            .db_name(Some(config.db_name.clone()))
            .user(Some(config.db_user.clone()))
            .pass(Some(config.db_pass.clone()));
        tracing::info!(
            host = %config.db_host,
            port = config.db_port,
            db = %config.db_name,
            %backend,
            "policy-config adapter ready",
        );
        Ok(Self {
            pool: mysql_async::Pool::new(opts),
        })
    }

    /// Close the pool cleanly on shutdown.
    ///
    /// # Errors
    ///
    /// * [`AdapterError::Unavailable`] if the disconnect handshake fails
    pub async fn disconnect(self) -> Result<(), AdapterError> {
        self.pool.disconnect().await.map_err(AdapterError::from)
    }

    async fn query_quota(&self, user: &str) -> Result<UserQuota, mysql_async::Error> {
        let mut conn = self.pool.get_conn().await?;
        let user_id: Option<i64> = conn
            .exec_first(
                "SELECT id FROM users WHERE name = :name",
                params! { "name" => user },
            )
            .await?;
        let Some(user_id) = user_id else {
            return Ok(UserQuota::NoSuchUser);
        };

        // column names drifted across schema migrations; the join table is
        // the one spelling every deployment agrees on.
        let limit: Option<i64> = conn
            .exec_first(
                "SELECT q.quota FROM quotas q \
                 JOIN quota_user qu ON qu.quota_id = q.id \
                 WHERE qu.user_id = :user_id ORDER BY q.id LIMIT 1",
                params! { "user_id" => user_id },
            )
            .await?;
        Ok(limit.map_or(UserQuota::NoQuota, UserQuota::Limit))
    }

    async fn query_email(&self, user: &str, email: &str) -> Result<bool, mysql_async::Error> {
        let mut conn = self.pool.get_conn().await?;
        let count: Option<i64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM emails e \
                 JOIN email_user eu ON eu.email_id = e.id \
                 JOIN users u ON u.id = eu.user_id \
                 WHERE u.name = :user AND e.name = :email",
                params! { "user" => user, "email" => email },
            )
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn query_domain(&self, user: &str, domain: &str) -> Result<bool, mysql_async::Error> {
        let mut conn = self.pool.get_conn().await?;
        let count: Option<i64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM domains d \
                 JOIN domain_user du ON du.domain_id = d.id \
                 JOIN users u ON u.id = du.user_id \
                 WHERE u.name = :user AND d.name = :domain",
                params! { "user" => user, "domain" => domain },
            )
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn query_flags(
        &self,
        domain: &str,
    ) -> Result<Option<DomainFlags>, mysql_async::Error> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<(bool, bool)> = conn
            .exec_first(
                "SELECT COALESCE(greylist, 0), COALESCE(check_spf, 0) \
                 FROM domains WHERE name = :name",
                params! { "name" => domain },
            )
            .await?;
        Ok(row.map(|(greylist, check_spf)| DomainFlags {
            greylist,
            check_spf,
        }))
    }
}

#[async_trait::async_trait]
impl PolicyConfigAdapter for MySqlAdapter {
    async fn user_quota(&self, user: &str) -> Result<UserQuota, AdapterError> {
        retry_once!(self.query_quota(user).await)
    }

    async fn user_authorized_email(
        &self,
        user: &str,
        email: &str,
    ) -> Result<bool, AdapterError> {
        retry_once!(self.query_email(user, email).await)
    }

    async fn user_authorized_domain(
        &self,
        user: &str,
        domain: &str,
    ) -> Result<bool, AdapterError> {
        retry_once!(self.query_domain(user, domain).await)
    }

    async fn domain_flags(&self, domain: &str) -> Result<Option<DomainFlags>, AdapterError> {
        retry_once!(self.query_flags(domain).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backends_are_refused_up_front() {
        std::env::remove_var(chapps_config::DB_MODULE_ENV);
        let mut config = FieldAdapter::default();
        config.adapter = "postgres".to_owned();
        assert!(matches!(
            MySqlAdapter::new(&config),
            Err(AdapterError::UnsupportedBackend(backend)) if backend == "postgres",
        ));
    }
}

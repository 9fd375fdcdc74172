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

//! Key formatting for every Redis entry the service owns. The prefixes are
//! part of the external contract: the admin tooling invalidates caches by
//! deleting these exact keys.

/// Rolling log of a user's outbound attempts (sorted set).
#[must_use]
pub fn oqp_attempts(user: &str) -> String {
    format!("oqp:{user}:attempts")
}

/// Cached numeric quota limit for a user.
#[must_use]
pub fn oqp_limit(user: &str) -> String {
    format!("oqp:{user}:limit")
}

/// Cached authorisation verdict for a user and a whole email or a domain.
#[must_use]
pub fn sda(user: &str, email_or_domain: &str) -> String {
    format!("sda:{user}:{email_or_domain}")
}

/// Per-client successful-delivery tally (sorted set).
#[must_use]
pub fn grl_client(client_ip: &str) -> String {
    format!("grl:{client_ip}")
}

/// Marker for a known `(client, sender, recipient)` tuple.
#[must_use]
pub fn grl_tuple(client_ip: &str, sender: &str, recipient: &str) -> String {
    format!("grl:tuple:{client_ip}:{sender}:{recipient}")
}

/// Cached greylisting-enabled flag for a recipient domain.
#[must_use]
pub fn grl_option(domain: &str) -> String {
    format!("grl:opt:{domain}")
}

/// Cached SPF-enabled flag for a recipient domain.
#[must_use]
pub fn spf_option(domain: &str) -> String {
    format!("spf:opt:{domain}")
}

/// Cached aggregate action for a Postfix instance id.
#[must_use]
pub fn handler(instance: &str) -> String {
    format!("handler:{instance}")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    #[test]
    fn prefixes_are_stable() {
        assert_eq!(super::oqp_attempts("alice"), "oqp:alice:attempts");
        assert_eq!(super::oqp_limit("alice"), "oqp:alice:limit");
        assert_eq!(super::sda("bob", "ok.com"), "sda:bob:ok.com");
        assert_eq!(super::grl_client("1.2.3.4"), "grl:1.2.3.4");
        assert_eq!(
            super::grl_tuple("1.2.3.4", "s@x", "r@y"),
            "grl:tuple:1.2.3.4:s@x:r@y",
        );
        assert_eq!(super::grl_option("y"), "grl:opt:y");
        assert_eq!(super::spf_option("y"), "spf:opt:y");
        assert_eq!(super::handler("ABC"), "handler:ABC");
    }
}

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

/// The domain part of a mail address: everything after the *last* `@`,
/// lowercased. `None` for addresses without one.
///
/// Splitting on the last `@` matches Postfix's own reading of
/// `user@"quoted@local"@domain` oddities: the rightmost part is the routing
/// domain.
///
/// # Example
///
/// ```
/// assert_eq!(
///     chapps_common::domain::address_domain("Alice@Example.COM"),
///     Some("example.com".to_owned()),
/// );
/// assert_eq!(chapps_common::domain::address_domain("no-at-sign"), None);
/// ```
#[must_use]
pub fn address_domain(address: &str) -> Option<String> {
    match address.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => Some(domain.to_ascii_lowercase()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn last_at_sign_wins() {
        assert_eq!(
            address_domain("\"odd@local\"@ok.com"),
            Some("ok.com".to_owned()),
        );
    }

    #[test]
    fn empty_and_missing_domains() {
        assert_eq!(address_domain(""), None);
        assert_eq!(address_domain("user@"), None);
        assert_eq!(address_domain("user"), None);
    }
}

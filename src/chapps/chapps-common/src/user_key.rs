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

use crate::PolicyRequest;

/// How to find the identity a request should be accounted against.
///
/// The extracted value is an opaque lookup key into the policy-config
/// store; it is never interpreted beyond string equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserKeyPolicy {
    primary: String,
    fallbacks: Vec<String>,
    require_primary: bool,
}

impl Default for UserKeyPolicy {
    fn default() -> Self {
        Self {
            primary: "sasl_username".to_owned(),
            fallbacks: vec![
                "ccert_subject".to_owned(),
                "sender".to_owned(),
                "client_address".to_owned(),
            ],
            require_primary: false,
        }
    }
}

impl UserKeyPolicy {
    ///
    #[must_use]
    pub fn new(
        primary: impl Into<String>,
        fallbacks: Vec<String>,
        require_primary: bool,
    ) -> Self {
        Self {
            primary: primary.into(),
            fallbacks,
            require_primary,
        }
    }

    /// Pick the user key out of `request`.
    ///
    /// With `require_primary`, only the primary attribute is consulted and
    /// a missing or empty value is an authentication failure. Otherwise the
    /// first candidate carrying a non-empty value wins, in order.
    ///
    /// # Errors
    ///
    /// * [`UserKeyError`] when no candidate yields a value.
    pub fn extract<'req>(&self, request: &'req PolicyRequest) -> Result<&'req str, UserKeyError> {
        let candidates: Vec<&String> = if self.require_primary {
            vec![&self.primary]
        } else {
            std::iter::once(&self.primary)
                .chain(self.fallbacks.iter().filter(|name| **name != self.primary))
                .collect()
        };

        candidates
            .iter()
            .find_map(|name| request.get_non_empty(name))
            .ok_or_else(|| UserKeyError {
                candidates: candidates.into_iter().cloned().collect(),
            })
    }
}

/// None of the configured attributes identified the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no usable user key among {candidates:?}")]
pub struct UserKeyError {
    /// The attribute names that were consulted, in order.
    pub candidates: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(pairs: &[(&str, &str)]) -> PolicyRequest {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn first_non_empty_candidate_wins() {
        let policy = UserKeyPolicy::default();
        let req = request(&[
            ("sasl_username", ""),
            ("ccert_subject", ""),
            ("sender", "carol@example.com"),
            ("client_address", "192.0.2.7"),
        ]);
        assert_eq!(policy.extract(&req).unwrap(), "carol@example.com");
    }

    #[test]
    fn require_primary_ignores_fallbacks() {
        let policy = UserKeyPolicy::new(
            "sasl_username",
            vec!["sender".to_owned()],
            true,
        );
        let req = request(&[("sender", "carol@example.com")]);

        let err = policy.extract(&req).unwrap_err();
        assert_eq!(err.candidates, vec!["sasl_username".to_owned()]);
    }

    #[test]
    fn primary_listed_once() {
        let policy = UserKeyPolicy::new(
            "sender",
            vec!["sender".to_owned(), "client_address".to_owned()],
            false,
        );
        let err = policy.extract(&request(&[])).unwrap_err();
        assert_eq!(
            err.candidates,
            vec!["sender".to_owned(), "client_address".to_owned()],
        );
    }
}

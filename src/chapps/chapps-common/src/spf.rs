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

/// The closed set of SPF evaluation results (RFC 7208 §2.6).
///
/// Anything an evaluator reports outside this set collapses to
/// [`SpfResult::Temperror`] at the seam, so downstream mapping is total.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum SpfResult {
    /// The client is authorised to send for the domain.
    Pass,
    /// The domain explicitly disallows the client.
    Fail,
    /// The domain weakly disallows the client.
    Softfail,
    /// The domain makes no assertion.
    Neutral,
    /// No SPF record published.
    None,
    /// Transient evaluation failure (DNS timeouts included).
    Temperror,
    /// The published record is unusable.
    Permerror,
}

impl SpfResult {
    /// Parse an evaluator-reported result, collapsing anything unknown to
    /// [`SpfResult::Temperror`].
    #[must_use]
    pub fn from_evaluator(result: &str) -> Self {
        result.parse().unwrap_or(Self::Temperror)
    }
}

/// What an SPF evaluation produced: the result plus the explanation string
/// used for `{reason}` substitution in configured directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfOutcome {
    /// The evaluation result.
    pub result: SpfResult,
    /// Matched-mechanism or problem description from the evaluator.
    pub explanation: String,
}

impl SpfOutcome {
    /// A transient-error outcome with the given explanation.
    #[must_use]
    pub fn temperror(explanation: impl Into<String>) -> Self {
        Self {
            result: SpfResult::Temperror,
            explanation: explanation.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    #[test]
    fn results_round_trip_lowercase() {
        for result in SpfResult::iter() {
            assert_eq!(SpfResult::from_evaluator(&result.to_string()), result);
        }
    }

    #[test]
    fn unknown_results_collapse_to_temperror() {
        assert_eq!(SpfResult::from_evaluator("hardfail"), SpfResult::Temperror);
        assert_eq!(SpfResult::from_evaluator(""), SpfResult::Temperror);
        assert_eq!(SpfResult::from_evaluator("PASS"), SpfResult::Temperror);
    }
}

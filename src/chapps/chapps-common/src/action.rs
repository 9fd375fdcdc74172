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

/// A Postfix action directive, as understood by `smtpd_policy_service`.
///
/// The [`std::fmt::Display`] implementation produces the exact wire form
/// (without the `action=` prefix and terminator, which belong to the
/// protocol writer). The [`std::str::FromStr`] implementation parses the
/// literal directives found in configuration files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Pretend the delegate was never consulted; later restrictions decide.
    Dunno,
    /// Accept the transaction outright, skipping later restrictions.
    Ok,
    /// Reject, with an optional operator-supplied text.
    Reject(Option<String>),
    /// Reject unless a later `permit` restriction would accept.
    DeferIfPermit(String),
    /// Prepend a header line to the message.
    Prepend(String),
    /// A raw RFC 5321 reply, e.g. `550 5.7.1 Sender address rejected`.
    Code {
        /// Three-digit SMTP status code.
        code: u16,
        /// RFC 3463 enhanced status, when present (`5.7.1`).
        enhanced: Option<String>,
        /// Remaining human-readable text.
        text: String,
    },
}

impl Action {
    /// Whether this action denies the transaction (used for cascade
    /// short-circuit decisions).
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        match self {
            Self::Reject(_) | Self::DeferIfPermit(_) => true,
            Self::Code { code, .. } => *code >= 400,
            Self::Dunno | Self::Ok | Self::Prepend(_) => false,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dunno => f.write_str("DUNNO"),
            Self::Ok => f.write_str("OK"),
            Self::Reject(None) => f.write_str("REJECT"),
            Self::Reject(Some(text)) => write!(f, "REJECT {text}"),
            Self::DeferIfPermit(text) => write!(f, "DEFER_IF_PERMIT {text}"),
            Self::Prepend(header) => write!(f, "PREPEND {header}"),
            Self::Code {
                code,
                enhanced: Some(enhanced),
                text,
            } if !text.is_empty() => write!(f, "{code} {enhanced} {text}"),
            Self::Code {
                code,
                enhanced: Some(enhanced),
                ..
            } => write!(f, "{code} {enhanced}"),
            Self::Code {
                code,
                enhanced: None,
                text,
            } if !text.is_empty() => write!(f, "{code} {text}"),
            Self::Code { code, .. } => write!(f, "{code}"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseActionError::Empty);
        }
        let (head, rest) = s
            .split_once(char::is_whitespace)
            .map_or((s, ""), |(head, rest)| (head, rest.trim_start()));

        if head.len() == 3 && head.bytes().all(|b| b.is_ascii_digit()) {
            #[allow(clippy::expect_used)]
            let code = head.parse::<u16>().expect("three ascii digits");
            if !(200..=599).contains(&code) {
                return Err(ParseActionError::CodeOutOfRange(code));
            }
            let (enhanced, text) = match rest.split_once(char::is_whitespace) {
                Some((first, tail)) if is_enhanced_status(first) => {
                    (Some(first.to_owned()), tail.trim_start().to_owned())
                }
                _ if is_enhanced_status(rest) => (Some(rest.to_owned()), String::new()),
                _ => (None, rest.to_owned()),
            };
            return Ok(Self::Code {
                code,
                enhanced,
                text,
            });
        }

        match head {
            "DUNNO" if rest.is_empty() => Ok(Self::Dunno),
            "OK" if rest.is_empty() => Ok(Self::Ok),
            "DUNNO" | "OK" => Err(ParseActionError::TrailingInput(if head == "OK" {
                "OK"
            } else {
                "DUNNO"
            })),
            "REJECT" if rest.is_empty() => Ok(Self::Reject(None)),
            "REJECT" => Ok(Self::Reject(Some(rest.to_owned()))),
            "DEFER_IF_PERMIT" if rest.is_empty() => {
                Err(ParseActionError::MissingText("DEFER_IF_PERMIT"))
            }
            "DEFER_IF_PERMIT" => Ok(Self::DeferIfPermit(rest.to_owned())),
            "PREPEND" if rest.is_empty() => Err(ParseActionError::MissingText("PREPEND")),
            "PREPEND" => Ok(Self::Prepend(rest.to_owned())),
            _ => Err(ParseActionError::UnknownDirective(head.to_owned())),
        }
    }
}

/// `X.Y.Z`, every part numeric.
fn is_enhanced_status(s: &str) -> bool {
    let mut parts = 0_usize;
    for part in s.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        parts += 1;
    }
    parts == 3
}

/// Error while parsing a literal action directive.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseActionError {
    /// Empty input.
    #[error("empty action directive")]
    Empty,
    /// The leading keyword is not a directive Postfix recognises.
    #[error("unknown action directive: {0:?}")]
    UnknownDirective(String),
    /// A bare keyword was followed by text it does not take.
    #[error("directive {0} does not take trailing text")]
    TrailingInput(&'static str),
    /// A directive that requires text was given none.
    #[error("directive {0} requires a text argument")]
    MissingText(&'static str),
    /// Numeric replies must be in the 2xx-5xx range.
    #[error("smtp status code out of range: {0}")]
    CodeOutOfRange(u16),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keywords_round_trip() {
        for (input, rendered) in [
            ("DUNNO", "DUNNO"),
            ("OK", "OK"),
            ("REJECT", "REJECT"),
            ("REJECT Outbound mail refused", "REJECT Outbound mail refused"),
            (
                "DEFER_IF_PERMIT Service temporarily unavailable - greylisted",
                "DEFER_IF_PERMIT Service temporarily unavailable - greylisted",
            ),
            ("PREPEND X-Greeting: hello", "PREPEND X-Greeting: hello"),
        ] {
            let action = input.parse::<Action>().unwrap();
            assert_eq!(action.to_string(), rendered);
        }
    }

    #[test]
    fn numeric_replies() {
        assert_eq!(
            "550 5.7.1 SPF check failed".parse::<Action>().unwrap(),
            Action::Code {
                code: 550,
                enhanced: Some("5.7.1".to_owned()),
                text: "SPF check failed".to_owned(),
            },
        );
        assert_eq!(
            "451 Try again later".parse::<Action>().unwrap(),
            Action::Code {
                code: 451,
                enhanced: None,
                text: "Try again later".to_owned(),
            },
        );
        assert_eq!(
            "451 4.4.3 SPF record(s) temporarily unavailable"
                .parse::<Action>()
                .unwrap()
                .to_string(),
            "451 4.4.3 SPF record(s) temporarily unavailable",
        );
    }

    #[test]
    fn rejects_malformed_directives() {
        assert_eq!("".parse::<Action>(), Err(ParseActionError::Empty));
        assert_eq!(
            "DUNNO but why".parse::<Action>(),
            Err(ParseActionError::TrailingInput("DUNNO")),
        );
        assert_eq!(
            "PREPEND".parse::<Action>(),
            Err(ParseActionError::MissingText("PREPEND")),
        );
        assert_eq!(
            "199 too small".parse::<Action>(),
            Err(ParseActionError::CodeOutOfRange(199)),
        );
        assert_eq!(
            "accept".parse::<Action>(),
            Err(ParseActionError::UnknownDirective("accept".to_owned())),
        );
    }

    #[test]
    fn rejection_classification() {
        assert!("REJECT".parse::<Action>().unwrap().is_rejection());
        assert!("550 5.7.1 no".parse::<Action>().unwrap().is_rejection());
        assert!(!"DUNNO".parse::<Action>().unwrap().is_rejection());
        assert!(!"PREPEND X-Thing: 1".parse::<Action>().unwrap().is_rejection());
    }
}

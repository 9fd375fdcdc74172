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

/// The SMTP stage Postfix was in when it consulted the delegate
/// (`protocol_state` attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[allow(clippy::module_name_repetitions)]
pub enum ProtocolState {
    /// `RCPT` restriction stage (one recipient per request).
    #[strum(serialize = "RCPT")]
    Rcpt,
    /// `DATA` restriction stage.
    #[strum(serialize = "DATA")]
    Data,
    /// End-of-message stage (`recipient_count` is populated here).
    #[strum(serialize = "END-OF-MESSAGE")]
    EndOfMessage,
    /// `VRFY` probe.
    #[strum(serialize = "VRFY")]
    Vrfy,
    /// `ETRN` request.
    #[strum(serialize = "ETRN")]
    Etrn,
}

/// One decoded Postfix policy-delegation request.
///
/// Attribute names and values are kept exactly as Postfix sent them
/// (case and whitespace preserved); the typed accessors below only read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyRequest {
    attributes: std::collections::BTreeMap<String, String>,
}

impl FromIterator<(String, String)> for PolicyRequest {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

impl PolicyRequest {
    /// Raw attribute lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Attribute lookup treating an empty value as absent.
    #[must_use]
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|value| !value.is_empty())
    }

    /// The Postfix-assigned transaction id, reused across queries for the
    /// same message.
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.get_non_empty("instance")
    }

    /// Envelope sender; empty string for the null sender (`MAIL FROM:<>`).
    #[must_use]
    pub fn sender(&self) -> &str {
        self.get("sender").unwrap_or("")
    }

    /// Client IP address, as sent.
    #[must_use]
    pub fn client_address(&self) -> Option<&str> {
        self.get_non_empty("client_address")
    }

    /// HELO/EHLO name announced by the client.
    #[must_use]
    pub fn helo_name(&self) -> Option<&str> {
        self.get_non_empty("helo_name")
    }

    /// The single envelope recipient of an RCPT-stage request.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        self.get_non_empty("recipient")
    }

    /// Every recipient carried by this request. RCPT-stage requests carry
    /// exactly one; the iterator form keeps call sites stage-agnostic.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.recipient().into_iter()
    }

    /// Number of accepted RCPT TO commands: the `recipient_count`
    /// attribute at end-of-message, one otherwise.
    #[must_use]
    pub fn recipient_count(&self) -> usize {
        match self
            .get("recipient_count")
            .and_then(|value| value.parse::<usize>().ok())
        {
            Some(count) if count > 0 => count,
            _ => 1,
        }
    }

    ///
    #[must_use]
    pub fn protocol_state(&self) -> Option<ProtocolState> {
        self.get("protocol_state")
            .and_then(|state| state.parse().ok())
    }

    /// The full case-preserving attribute mapping.
    #[must_use]
    pub const fn attributes(&self) -> &std::collections::BTreeMap<String, String> {
        &self.attributes
    }
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
    fn typed_accessors() {
        let req = request(&[
            ("instance", "a413.61cdbb.fa5b3.0"),
            ("sender", "alice@example.com"),
            ("client_address", "10.10.10.10"),
            ("helo_name", "mx.example.com"),
            ("recipient", "bob@example.org"),
            ("protocol_state", "RCPT"),
        ]);

        assert_eq!(req.instance(), Some("a413.61cdbb.fa5b3.0"));
        assert_eq!(req.sender(), "alice@example.com");
        assert_eq!(req.client_address(), Some("10.10.10.10"));
        assert_eq!(req.protocol_state(), Some(ProtocolState::Rcpt));
        assert_eq!(req.recipients().collect::<Vec<_>>(), vec!["bob@example.org"]);
    }

    #[test]
    fn recipient_count_defaults_to_one() {
        assert_eq!(request(&[("recipient", "x@y")]).recipient_count(), 1);
        assert_eq!(request(&[]).recipient_count(), 1);
        assert_eq!(
            request(&[("recipient_count", "0")]).recipient_count(),
            1,
            "end-of-message with zero recipients still counts one attempt",
        );
        assert_eq!(request(&[("recipient_count", "3")]).recipient_count(), 3);
    }

    #[test]
    fn null_sender_is_empty_string() {
        let req = request(&[("sender", "")]);
        assert_eq!(req.sender(), "");
        assert_eq!(req.get_non_empty("sender"), None);
    }
}

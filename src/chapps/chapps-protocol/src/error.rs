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

/// Error while reading or decoding a policy-delegation request.
#[allow(clippy::module_name_repetitions)]
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer closed the connection before the empty-line terminator.
    ///
    /// Carries enough to diagnose connection churn under load: how much of
    /// the request arrived and which attributes were last seen.
    #[error("connection closed mid-request after {bytes_read} bytes (last attributes: {last_keys:?})")]
    IncompleteRequest {
        /// Bytes buffered when EOF was observed.
        bytes_read: usize,
        /// The trailing attribute names decoded so far.
        last_keys: Vec<String>,
    },

    /// More bytes buffered than the configured request cap.
    #[error("request exceeds the {limit} byte cap ({got} bytes buffered)")]
    RequestTooLarge {
        /// Configured cap.
        limit: usize,
        /// Bytes buffered so far.
        got: usize,
    },

    /// A line without `=`, or with an attribute name outside `[A-Za-z_]+`.
    #[error("malformed attribute line: {line:?}")]
    InvalidAttributeLine {
        /// The offending line, decoded, truncated for logging.
        line: String,
    },

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the connection can keep serving requests after this error.
    ///
    /// Once framing is lost (oversize or EOF mid-request) the byte stream
    /// cannot be resynchronised and the connection must wind down; a
    /// malformed line inside a well-terminated request is recoverable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidAttributeLine { .. })
    }
}

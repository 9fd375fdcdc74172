//! chapps-protocol
//!
//! The Postfix policy-delegation wire protocol: requests arrive as
//! `name=value` lines terminated by an empty line; the delegate answers
//! `action=<directive>` followed by an empty line, and the connection
//! stays open for further requests.

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

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]

mod error;
mod reader;
mod writer;

pub use error::ProtocolError;
pub use reader::{Reader, DEFAULT_SIZE_LIMIT};
pub use writer::Writer;

/// Resolve a configured `payload_encoding` label (WHATWG names: `utf-8`,
/// `latin1`, ...) to a decoder. `None` when the label is unknown, which is
/// a configuration error.
#[must_use]
pub fn payload_encoding(label: &str) -> Option<&'static encoding_rs::Encoding> {
    encoding_rs::Encoding::for_label(label.trim().as_bytes())
}

/// The default payload decoder.
#[must_use]
pub fn default_payload_encoding() -> &'static encoding_rs::Encoding {
    encoding_rs::UTF_8
}

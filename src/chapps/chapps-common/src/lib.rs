//! chapps-common
//!
//! Shared vocabulary of the CHAPPS policy delegate: the Postfix action
//! directive type, the decoded policy request, and user-key extraction.

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

mod action;
mod request;
mod spf;
mod user_key;

/// String-level helpers over mail addresses and domains.
pub mod domain;

pub use action::{Action, ParseActionError};
pub use request::{PolicyRequest, ProtocolState};
pub use spf::{SpfOutcome, SpfResult};
pub use user_key::{UserKeyError, UserKeyPolicy};

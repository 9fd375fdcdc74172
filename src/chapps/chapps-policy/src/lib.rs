//! chapps-policy
//!
//! The four policy algorithms (outbound quota, sender-domain
//! authorisation, greylisting, SPF enforcement) and the cascading
//! multi-policy handler that composes them into one Postfix action per
//! request.

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

mod greylisting;
mod handler;
mod outbound_quota;
mod sender_domain;
mod spf;
mod verdict;

pub use greylisting::Greylisting;
pub use handler::CascadingPolicyHandler;
pub use outbound_quota::OutboundQuota;
pub use sender_domain::SenderDomainAuth;
pub use spf::{SpfEnforcement, SpfEvaluator, ViaspfEvaluator};
pub use verdict::{Policy, Verdict};

#[cfg(any(test, feature = "testing"))]
pub use spf::StaticSpfEvaluator;

/// Sliding-window and authorisation-cache lifetime.
pub(crate) const DAY_TTL: std::time::Duration = std::time::Duration::from_secs(86400);

/// Per-domain opt-in flag cache lifetime.
pub(crate) const HOUR_TTL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Unix seconds, read once per request.
pub(crate) fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Degradation path shared by the policies: infrastructure failures are
/// logged loudly and answered with `DUNNO` so mail keeps flowing.
pub(crate) fn degrade(policy: &'static str, error: &anyhow::Error) -> Verdict {
    tracing::error!(policy, error = %format!("{error:#}"), "state store unavailable, standing aside");
    Verdict::Final(chapps_common::Action::Dunno)
}

/// Parse a configured directive, naming the key in the startup error.
pub(crate) fn directive(key: &'static str, value: &str) -> anyhow::Result<chapps_common::Action> {
    use anyhow::Context;
    value
        .parse()
        .with_context(|| format!("{key}: {value:?} is not a Postfix directive"))
}

//! chapps-store
//!
//! The two state stores behind the policies: the Redis cache (sliding
//! windows, cached flags, the atomic quota reservation) and the read-only
//! relational policy-config store. Both are trait seams so the policy and
//! server crates can run against deterministic in-memory doubles (enable
//! the `testing` feature).

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

mod adapter;
mod cache;
mod mysql;
mod redis_cache;

/// The Redis key schema: every key the service writes, in one place.
pub mod keys;

#[cfg(any(test, feature = "testing"))]
mod memory;
#[cfg(any(test, feature = "testing"))]
mod test_adapter;

pub use adapter::{AdapterError, DomainFlags, PolicyConfigAdapter, UserQuota};
pub use cache::{Cache, CacheError, QuotaDecision, QuotaReservation};
pub use mysql::MySqlAdapter;
pub use redis_cache::RedisCache;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryCache;
#[cfg(any(test, feature = "testing"))]
pub use test_adapter::TestAdapter;

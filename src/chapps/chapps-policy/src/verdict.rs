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

use chapps_common::{Action, PolicyRequest};

/// What one policy concluded about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Terminate the cascade with this action.
    Final(Action),
    /// Record this action and let a later policy override it.
    Next(Action),
    /// Delegate to the greylisting stage. When the stage then lets the
    /// message through, `accept` (if any) replaces its plain acceptance;
    /// SPF uses this to keep its `Received-SPF` header on the accept path.
    Greylist {
        /// Action to answer instead of a plain acceptance.
        accept: Option<Action>,
    },
}

/// One composable policy.
///
/// `approve` never fails: infrastructure errors are degraded inside the
/// policy to a safe action (and logged), so the cascade above stays a
/// straight fold over verdicts.
#[async_trait::async_trait]
pub trait Policy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Decide on one request.
    async fn approve(&self, request: &PolicyRequest) -> Verdict;
}

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

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

/// What the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// `SIGHUP`: re-read the configuration file.
    Reload,
    /// `SIGTERM`/`SIGINT`: stop accepting, drain, exit.
    Shutdown,
}

/// Watch for process signals on a dedicated thread and forward them into
/// the runtime.
///
/// # Errors
///
/// * the signal handler cannot be registered
pub fn spawn_signal_listener() -> anyhow::Result<tokio::sync::mpsc::Receiver<SignalEvent>> {
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let mut signals = signal_hook::iterator::Signals::new([SIGHUP, SIGINT, SIGTERM])?;

    std::thread::Builder::new()
        .name("chapps-signals".to_owned())
        .spawn(move || {
            for signal in signals.forever() {
                let event = match signal {
                    SIGHUP => SignalEvent::Reload,
                    SIGINT | SIGTERM => SignalEvent::Shutdown,
                    _ => continue,
                };
                if tx.blocking_send(event).is_err() {
                    return;
                }
            }
        })?;

    Ok(rx)
}

//! chappsd executable

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

mod args;

pub use args::{Args, Service};

use anyhow::Context;
use chapps_server::ServiceKind;

/// Initialize the tracing subsystem: an `EnvFilter` built from the
/// configured level, a per-service file in the configured log directory,
/// and optionally a compact stdout mirror.
///
/// # Errors
///
/// * the log directory cannot be created
/// * the configured level is not a valid filter directive
pub fn init_logs(args: &Args, config: &chapps_config::Config) -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_new(&config.core.log_level)
        .with_context(|| format!("invalid log_level {:?}", config.core.log_level))?;

    std::fs::create_dir_all(&config.core.log_directory).with_context(|| {
        format!(
            "cannot create log directory '{}'",
            config.core.log_directory.display(),
        )
    })?;
    let service = ServiceKind::from(args.service);
    let writer =
        tracing_appender::rolling::never(&config.core.log_directory, format!("{service}.log"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(false)
            .with_writer(writer),
    );

    if args.stdout {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stdout)
                    .with_ansi(true),
            )
            .try_init()?;
    } else {
        subscriber.try_init()?;
    }

    tracing::info!(
        %service,
        directory = %config.core.log_directory.display(),
        stdout = args.stdout,
        "chapps logs initialized",
    );
    Ok(())
}

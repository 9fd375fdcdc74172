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

use chapps_core::{init_logs, Args};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => chapps_config::Config::from_path(path),
        None => chapps_config::Config::from_env(),
    }?;

    init_logs(&args, &config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.core.worker_count())
        .enable_all()
        .build()?;

    runtime.block_on(chapps_server::run(args.service.into(), config))
}

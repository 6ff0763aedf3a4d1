// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::Context;
use clap::Parser;
use syncengine::{QueueStore, get_configuration};
use tracing::info;

use crate::{args::Args, commands::run_command, logging::init_logging};

mod args;
mod commands;
mod logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let args = Args::parse();

    let mut configuration =
        get_configuration(&args.config).context("Could not load configuration")?;
    if let Some(database) = args.database {
        configuration.database.path = database;
    }

    let path = &configuration.database.path;
    info!(path = %path.display(), "Opening mutation queue");
    let queue = QueueStore::open(path)
        .await
        .with_context(|| format!("Failed to open queue database {}", path.display()))?;

    let result = run_command(&queue, args.cmd.unwrap_or_default(), args.json).await;
    queue.close().await;
    result
}

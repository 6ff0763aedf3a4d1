// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(about = "Inspect and resolve the offline mutation queue")]
pub struct Args {
    /// Configuration file; `SYNCENGINE_` environment variables take precedence
    #[arg(long, default_value = "syncengine.yaml")]
    pub config: PathBuf,
    /// Queue database, overriding the configured one
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Print machine-readable JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
    #[command(subcommand)]
    pub cmd: Option<Command>,
}

#[derive(Default, clap::Subcommand)]
pub enum Command {
    /// Number of pending mutations and dead letters
    #[default]
    Status,
    /// List pending mutations in sync order
    Pending,
    /// List mutations awaiting manual resolution
    DeadLetters,
    /// Put a dead letter back into the queue
    Requeue {
        /// Dead letter id as shown by `dead-letters`
        id: i64,
    },
    /// Delete a dead letter for good
    Discard {
        /// Dead letter id as shown by `dead-letters`
        id: i64,
    },
}

// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::Context;
use tracing::{metadata::LevelFilter, subscriber::set_global_default};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// Logs to stderr, keeping stdout for command output.
pub fn init_logging() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let formatting_layer = fmt::layer().with_writer(std::io::stderr);
    let registry = Registry::default().with(env_filter).with(formatting_layer);
    LogTracer::init().context("logging already initialized")?;
    set_global_default(registry).context("logging already initialized")?;
    Ok(())
}

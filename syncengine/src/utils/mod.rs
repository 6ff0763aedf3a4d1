// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    ffi::OsString,
    future,
    path::{Path, PathBuf},
};

use tokio::time::{Instant, sleep_until};

pub(crate) mod connection_ext;
pub(crate) mod drain_lock;
pub(crate) mod owner_lock;
pub(crate) mod persistence;

/// `<db_path>.<extension>`, a file next to the database.
pub(crate) fn sibling_path(db_path: &Path, extension: &str) -> PathBuf {
    let mut path = OsString::from(db_path.as_os_str());
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

/// Sleeps until `deadline`, or forever if there is none.
pub(crate) async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use tracing::Level;
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt::fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .try_init();
}

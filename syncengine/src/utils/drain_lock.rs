// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::Arc,
};

use tokio::{sync::Mutex, task::spawn_blocking};

use super::sibling_path;

/// Serializes drain passes over one queue.
///
/// A queue backed by a database file is guarded by an advisory lock on a sibling `.lock` file, so
/// two processes opening the same queue never drain it concurrently. An in-memory queue is private
/// to its process and only needs a mutex.
#[derive(Debug)]
pub(crate) enum DrainLock {
    File(Arc<File>),
    Process(Mutex<()>),
}

impl DrainLock {
    pub(crate) fn for_database(db_path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(true)
            .open(sibling_path(db_path, "lock"))?;
        Ok(Self::File(Arc::new(file)))
    }

    pub(crate) fn in_process() -> Self {
        Self::Process(Mutex::new(()))
    }

    /// Note: `&mut self` makes sure that the file cannot be locked twice which is unspecified
    /// behavior and platform dependent.
    pub(crate) async fn lock(&mut self) -> io::Result<DrainLockGuard<'_>> {
        match self {
            Self::File(file) => {
                let blocking_file = file.clone();
                spawn_blocking(move || blocking_file.lock())
                    .await
                    .map_err(|_| io::Error::other("background task failed"))??;
                Ok(DrainLockGuard::File(file))
            }
            Self::Process(mutex) => Ok(DrainLockGuard::Process(mutex.lock().await)),
        }
    }
}

#[derive(Debug)]
#[must_use]
pub(crate) enum DrainLockGuard<'a> {
    File(&'a File),
    Process(#[allow(dead_code)] tokio::sync::MutexGuard<'a, ()>),
}

impl Drop for DrainLockGuard<'_> {
    fn drop(&mut self) {
        if let Self::File(file) = self {
            let _ = file.unlock();
        }
    }
}

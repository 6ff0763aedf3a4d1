// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    fs::{File, OpenOptions, TryLockError},
    path::Path,
};

use tracing::warn;

use crate::QueueError;

use super::sibling_path;

/// Claim of a queue database by a single open store.
///
/// A store mirrors the committed queue in memory, so nobody else may write to its database while
/// it is open. The claim is an advisory lock on a sibling `.owner` file. It is given up on
/// [`OwnerLock::release`] or when the lock is dropped.
#[derive(Debug)]
pub(crate) struct OwnerLock {
    file: File,
}

impl OwnerLock {
    /// Claims the database at `db_path` without waiting.
    pub(crate) fn acquire(db_path: &Path) -> Result<Self, QueueError> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(false)
            .open(sibling_path(db_path, "owner"))?;
        match file.try_lock() {
            Ok(()) => Ok(Self { file }),
            Err(TryLockError::WouldBlock) => Err(QueueError::QueueInUse(db_path.to_owned())),
            Err(TryLockError::Error(error)) => Err(error.into()),
        }
    }

    pub(crate) fn release(&self) {
        if let Err(error) = self.file.unlock() {
            warn!(%error, "Failed to release queue database");
        }
    }
}

// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{io, path::PathBuf};

use crate::mutation::{DeadLetterId, DedupKey};

/// Errors of the local queue.
///
/// None of these are caused by the remote authority; remote failures are classified by
/// [`ApplyError`](crate::ApplyError) and handled by the sync coordinator.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Local queue storage failed: {0}")]
    LocalPersistence(#[from] sqlx::Error),
    #[error("Failed to migrate the queue database: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Failed to lock the queue database: {0}")]
    Lock(#[from] io::Error),
    #[error("Queue database {} is already open", .0.display())]
    QueueInUse(PathBuf),
    #[error("Dead letter {0} not found")]
    DeadLetterNotFound(DeadLetterId),
    #[error("A live mutation for {0} already exists")]
    LiveMutationExists(DedupKey),
    #[error("The mutation for {0} is being applied")]
    MutationInFlight(DedupKey),
}

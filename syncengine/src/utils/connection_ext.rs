// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use sqlx::{SqlitePool, SqliteTransaction};

use crate::notifications::QueueNotifier;

pub(crate) trait StoreExt {
    fn pool(&self) -> &SqlitePool;

    fn notifier(&self) -> QueueNotifier;

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction of the queue database.
    ///
    /// Commits on `Ok`. On `Err` the transaction is dropped, which rolls it back.
    async fn with_transaction<T: Send, E: From<sqlx::Error>>(
        &self,
        f: impl AsyncFnOnce(&mut SqliteTransaction<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut txn = self.pool().begin_with("BEGIN IMMEDIATE").await?;
        let value = f(&mut txn).await?;
        txn.commit().await?;
        Ok(value)
    }
}

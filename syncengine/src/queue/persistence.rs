// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, query, query_as, query_scalar};

use crate::mutation::{
    ActionKind, Change, DeadLetter, DeadLetterId, DedupKey, EntityType, FailureKind,
    MutationRecord, Payload,
};

struct SqlMutationRow {
    seq: i64,
    entity_type: EntityType,
    entity_id: String,
    action: ActionKind,
    payload: Option<Vec<u8>>,
    enqueued_at: DateTime<Utc>,
    retry_count: i64,
    version: i64,
    dispatched: bool,
    next_attempt_at: Option<DateTime<Utc>>,
    failure_kind: Option<FailureKind>,
    failure_message: Option<String>,
    failed_at: Option<DateTime<Utc>>,
}

impl SqlMutationRow {
    fn change(&mut self) -> sqlx::Result<Change> {
        Change::from_parts(self.action, self.payload.take())
            .map_err(|error| sqlx::Error::Decode(error.into()))
    }

    fn retry_count(&self) -> sqlx::Result<u32> {
        u32::try_from(self.retry_count).map_err(|error| sqlx::Error::Decode(error.into()))
    }

    fn into_record(mut self) -> sqlx::Result<MutationRecord> {
        Ok(MutationRecord {
            position: self.seq,
            change: self.change()?,
            retry_count: self.retry_count()?,
            key: DedupKey::new(self.entity_type, self.entity_id),
            enqueued_at: self.enqueued_at,
            version: self.version,
            dispatched: self.dispatched,
            next_attempt_at: self.next_attempt_at,
        })
    }

    fn into_dead_letter(mut self) -> sqlx::Result<DeadLetter> {
        let (Some(kind), Some(failed_at)) = (self.failure_kind, self.failed_at) else {
            return Err(sqlx::Error::Decode(
                format!("Dead letter {} has no failure", self.seq).into(),
            ));
        };
        Ok(DeadLetter {
            id: DeadLetterId(self.seq),
            change: self.change()?,
            retry_count: self.retry_count()?,
            key: DedupKey::new(self.entity_type, self.entity_id),
            enqueued_at: self.enqueued_at,
            version: self.version,
            kind,
            message: self.failure_message.unwrap_or_default(),
            failed_at,
        })
    }
}

impl MutationRecord {
    pub(super) async fn load_pending(
        executor: impl SqliteExecutor<'_>,
    ) -> sqlx::Result<Vec<MutationRecord>> {
        query_as!(
            SqlMutationRow,
            r#"
                SELECT
                    seq,
                    entity_type AS "entity_type: _",
                    entity_id,
                    action AS "action: _",
                    payload,
                    enqueued_at AS "enqueued_at: _",
                    retry_count,
                    version,
                    dispatched AS "dispatched: _",
                    next_attempt_at AS "next_attempt_at: _",
                    failure_kind AS "failure_kind: _",
                    failure_message,
                    failed_at AS "failed_at: _"
                FROM mutation_queue
                WHERE state = 'pending'
                ORDER BY seq
            "#
        )
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(SqlMutationRow::into_record)
        .collect()
    }

    /// Appends a new live record and returns its position.
    pub(super) async fn insert(
        executor: impl SqliteExecutor<'_>,
        key: &DedupKey,
        change: &Change,
        enqueued_at: DateTime<Utc>,
        version: i64,
        dispatched: bool,
    ) -> sqlx::Result<i64> {
        let entity_type = key.entity_type;
        let action = change.kind();
        let payload = change.payload().map(Payload::as_bytes);
        query_scalar!(
            "INSERT INTO mutation_queue (
                entity_type,
                entity_id,
                action,
                payload,
                enqueued_at,
                retry_count,
                version,
                dispatched,
                state
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, 'pending')
            RETURNING seq",
            entity_type,
            key.id,
            action,
            payload,
            enqueued_at,
            version,
            dispatched,
        )
        .fetch_one(executor)
        .await
    }

    /// Replaces the change of the live record at `position`, resetting its retry state.
    pub(super) async fn replace_change(
        executor: impl SqliteExecutor<'_>,
        position: i64,
        change: &Change,
        version: i64,
    ) -> sqlx::Result<()> {
        let action = change.kind();
        let payload = change.payload().map(Payload::as_bytes);
        query!(
            "UPDATE mutation_queue
            SET action = ?1, payload = ?2, version = ?3, retry_count = 0, next_attempt_at = NULL
            WHERE seq = ?4",
            action,
            payload,
            version,
            position,
        )
        .execute(executor)
        .await?;
        Ok(())
    }

    pub(super) async fn downgrade_to_update(
        executor: impl SqliteExecutor<'_>,
        position: i64,
    ) -> sqlx::Result<()> {
        query!(
            "UPDATE mutation_queue SET action = 'update' WHERE seq = ?1 AND action = 'create'",
            position,
        )
        .execute(executor)
        .await?;
        Ok(())
    }

    pub(super) async fn mark_dispatched(
        executor: impl SqliteExecutor<'_>,
        position: i64,
    ) -> sqlx::Result<()> {
        query!(
            "UPDATE mutation_queue SET dispatched = 1 WHERE seq = ?1",
            position,
        )
        .execute(executor)
        .await?;
        Ok(())
    }

    pub(super) async fn reschedule(
        executor: impl SqliteExecutor<'_>,
        position: i64,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        let retry_count = i64::from(retry_count);
        query!(
            "UPDATE mutation_queue SET retry_count = ?1, next_attempt_at = ?2 WHERE seq = ?3",
            retry_count,
            next_attempt_at,
            position,
        )
        .execute(executor)
        .await?;
        Ok(())
    }

    pub(super) async fn delete(
        executor: impl SqliteExecutor<'_>,
        position: i64,
    ) -> sqlx::Result<()> {
        query!("DELETE FROM mutation_queue WHERE seq = ?1", position)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Moves the live record at `position` out of the live set.
    ///
    /// The row keeps its `seq`, which becomes the dead letter's id.
    pub(super) async fn move_to_dead_letter(
        executor: impl SqliteExecutor<'_>,
        position: i64,
        retry_count: u32,
        kind: FailureKind,
        message: &str,
        failed_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        let retry_count = i64::from(retry_count);
        query!(
            "UPDATE mutation_queue
            SET state = 'dead_letter',
                retry_count = ?1,
                next_attempt_at = NULL,
                failure_kind = ?2,
                failure_message = ?3,
                failed_at = ?4
            WHERE seq = ?5",
            retry_count,
            kind,
            message,
            failed_at,
            position,
        )
        .execute(executor)
        .await?;
        Ok(())
    }
}

impl DeadLetter {
    pub(super) async fn load_all(
        executor: impl SqliteExecutor<'_>,
    ) -> sqlx::Result<Vec<DeadLetter>> {
        query_as!(
            SqlMutationRow,
            r#"
                SELECT
                    seq,
                    entity_type AS "entity_type: _",
                    entity_id,
                    action AS "action: _",
                    payload,
                    enqueued_at AS "enqueued_at: _",
                    retry_count,
                    version,
                    dispatched AS "dispatched: _",
                    next_attempt_at AS "next_attempt_at: _",
                    failure_kind AS "failure_kind: _",
                    failure_message,
                    failed_at AS "failed_at: _"
                FROM mutation_queue
                WHERE state = 'dead_letter'
                ORDER BY seq
            "#
        )
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(SqlMutationRow::into_dead_letter)
        .collect()
    }

    pub(super) async fn delete(
        executor: impl SqliteExecutor<'_>,
        id: DeadLetterId,
    ) -> sqlx::Result<()> {
        query!(
            "DELETE FROM mutation_queue WHERE seq = ?1 AND state = 'dead_letter'",
            id.0,
        )
        .execute(executor)
        .await?;
        Ok(())
    }
}

/// The persisted high-water mark of mutation versions.
pub(super) struct VersionCounter;

impl VersionCounter {
    pub(super) async fn load(executor: impl SqliteExecutor<'_>) -> sqlx::Result<i64> {
        query_scalar!("SELECT last_version FROM mutation_version WHERE id = 0")
            .fetch_one(executor)
            .await
    }

    pub(super) async fn store(executor: impl SqliteExecutor<'_>, version: i64) -> sqlx::Result<()> {
        query!(
            "UPDATE mutation_version SET last_version = ?1 WHERE id = 0",
            version,
        )
        .execute(executor)
        .await?;
        Ok(())
    }
}

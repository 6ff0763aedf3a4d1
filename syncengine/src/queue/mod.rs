// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable FIFO store of pending mutations.
//!
//! Every write runs as one immediate SQLite transaction while holding the index lock. The
//! in-memory [`QueueIndex`] is updated only after the commit, then a new [`QueueSnapshot`] is
//! published and the [`QueueNotification`](crate::QueueNotification) for the write is sent.

use std::{
    ops::{Deref, DerefMut},
    path::Path,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, info, warn};

use crate::{
    QueueError,
    dedup::{self, Resolution},
    mutation::{
        ActionKind, Change, DeadLetter, DeadLetterId, DedupKey, EntityType, FailureKind,
        MutationRecord,
    },
    notifications::{QueueNotificationsSender, QueueNotifier, QueueOperation},
    observer::{QueueObserver, QueueSnapshot},
    utils::{
        connection_ext::StoreExt,
        owner_lock::OwnerLock,
        persistence::{open_db, open_db_in_memory},
    },
};

use self::{index::QueueIndex, persistence::VersionCounter};

mod index;
mod persistence;

/// What an enqueue did to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new live record was appended.
    Inserted,
    /// The mutation was merged into the live record of the same entity.
    Coalesced,
    /// The mutation and the live record cancelled each other out.
    Cancelled,
    /// A pending deletion of the entity supersedes the mutation.
    StaleIgnored,
}

impl EnqueueOutcome {
    /// Whether the queue holds new work for the remote authority.
    pub fn requires_sync(self) -> bool {
        matches!(self, Self::Inserted | Self::Coalesced)
    }
}

/// Result of settling a successfully applied mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// The applied version was the latest; the record is gone.
    Removed,
    /// A newer version was enqueued while applying; it stays queued.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct QueueStore {
    inner: Arc<QueueStoreInner>,
}

#[derive(Debug)]
struct QueueStoreInner {
    pool: SqlitePool,
    owner: Option<OwnerLock>,
    index: Mutex<QueueIndex>,
    snapshot_tx: watch::Sender<Arc<QueueSnapshot>>,
    notifications_tx: QueueNotificationsSender,
}

impl StoreExt for QueueStore {
    fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    fn notifier(&self) -> QueueNotifier {
        QueueNotifier::new(self.inner.notifications_tx.clone())
    }
}

impl QueueStore {
    /// Opens the queue stored at `path`, creating the database if needed.
    ///
    /// Fails with [`QueueError::QueueInUse`] while another store has the database open, in this
    /// or any other process.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let owner = OwnerLock::acquire(path)?;
        let pool = open_db(path).await?;
        Self::load(pool, Some(owner)).await
    }

    /// Opens a queue that lives only as long as the process.
    pub async fn open_in_memory() -> Result<Self, QueueError> {
        let pool = open_db_in_memory().await?;
        Self::load(pool, None).await
    }

    async fn load(pool: SqlitePool, owner: Option<OwnerLock>) -> Result<Self, QueueError> {
        let live = MutationRecord::load_pending(&pool).await?;
        let dead_letters = DeadLetter::load_all(&pool).await?;
        let last_version = VersionCounter::load(&pool).await?;
        info!(
            pending = live.len(),
            dead_letters = dead_letters.len(),
            last_version,
            "Loaded mutation queue"
        );

        let index = QueueIndex::new(live, dead_letters, last_version);
        let (snapshot_tx, _) = watch::channel(Arc::new(index.snapshot()));
        Ok(Self {
            inner: Arc::new(QueueStoreInner {
                pool,
                owner,
                index: Mutex::new(index),
                snapshot_tx,
                notifications_tx: QueueNotificationsSender::new(),
            }),
        })
    }

    /// Closes the database and gives it up to other stores. Further writes fail.
    pub async fn close(&self) {
        self.inner.pool.close().await;
        if let Some(owner) = &self.inner.owner {
            owner.release();
        }
    }

    pub fn observer(&self) -> QueueObserver {
        QueueObserver::new(
            self.inner.snapshot_tx.subscribe(),
            self.inner.notifications_tx.clone(),
        )
    }

    /// Records a mutation, collapsing it with the live mutation of the same entity.
    ///
    /// Returns after the change is durably committed.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        id: impl Into<String>,
        change: Change,
    ) -> Result<EnqueueOutcome, QueueError> {
        let key = DedupKey::new(entity_type, id);
        let mut index = self.write_index().await;
        let mut notifier = self.notifier();

        let outcome = match dedup::resolve(index.existing(&key), change) {
            Resolution::Insert(change) => {
                let version = index.next_version();
                let enqueued_at = Utc::now();
                let position = self
                    .with_transaction(async |txn| {
                        let position = MutationRecord::insert(
                            txn.as_mut(),
                            &key,
                            &change,
                            enqueued_at,
                            version,
                            false,
                        )
                        .await?;
                        VersionCounter::store(txn.as_mut(), version).await?;
                        Ok::<_, sqlx::Error>(position)
                    })
                    .await?;
                index.insert(MutationRecord {
                    position,
                    key: key.clone(),
                    change,
                    enqueued_at,
                    retry_count: 0,
                    version,
                    dispatched: false,
                    next_attempt_at: None,
                });
                notifier.add(key.clone(), QueueOperation::Enqueued);
                EnqueueOutcome::Inserted
            }
            Resolution::Replace(change) => {
                let Some(position) = index.get(&key).map(|record| record.position) else {
                    return Err(sqlx::Error::RowNotFound.into());
                };
                let version = index.next_version();
                self.with_transaction(async |txn| {
                    MutationRecord::replace_change(txn.as_mut(), position, &change, version)
                        .await?;
                    VersionCounter::store(txn.as_mut(), version).await?;
                    Ok::<_, sqlx::Error>(())
                })
                .await?;
                index.replace(&key, change, version);
                notifier.add(key.clone(), QueueOperation::Coalesced);
                EnqueueOutcome::Coalesced
            }
            Resolution::Cancel => {
                let Some(position) = index.get(&key).map(|record| record.position) else {
                    return Err(sqlx::Error::RowNotFound.into());
                };
                self.with_transaction(async |txn| {
                    MutationRecord::delete(txn.as_mut(), position).await
                })
                .await?;
                index.remove(&key);
                notifier.add(key.clone(), QueueOperation::Cancelled);
                EnqueueOutcome::Cancelled
            }
            Resolution::StaleIgnored => {
                info!(%key, "Ignoring mutation of an entity pending deletion");
                notifier.add(key.clone(), QueueOperation::StaleIgnored);
                EnqueueOutcome::StaleIgnored
            }
        };
        debug!(%key, ?outcome, "Enqueued mutation");

        drop(index);
        notifier.notify();
        Ok(outcome)
    }

    /// Removes the live mutation of an entity without applying it.
    ///
    /// Returns `false` if there is none. A mutation that is being applied cannot be cancelled.
    pub async fn cancel(&self, entity_type: EntityType, id: &str) -> Result<bool, QueueError> {
        let key = DedupKey::new(entity_type, id);
        let mut index = self.write_index().await;
        let Some(position) = index.get(&key).map(|record| record.position) else {
            return Ok(false);
        };
        if index.is_in_flight(&key) {
            return Err(QueueError::MutationInFlight(key));
        }

        self.with_transaction(async |txn| MutationRecord::delete(txn.as_mut(), position).await)
            .await?;
        index.remove(&key);
        debug!(%key, "Cancelled mutation");

        drop(index);
        let mut notifier = self.notifier();
        notifier.add(key, QueueOperation::Cancelled);
        notifier.notify();
        Ok(true)
    }

    pub async fn get(&self, key: &DedupKey) -> Option<MutationRecord> {
        self.inner.index.lock().await.get(key).cloned()
    }

    /// Live mutations in the order they will be applied.
    pub async fn list_pending(&self) -> Vec<MutationRecord> {
        self.inner.index.lock().await.pending().cloned().collect()
    }

    pub async fn dead_letter_items(&self) -> Vec<DeadLetter> {
        self.inner
            .index
            .lock()
            .await
            .dead_letters()
            .cloned()
            .collect()
    }

    /// Puts a dead letter back at the end of the queue with a fresh retry budget.
    pub async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> Result<MutationRecord, QueueError> {
        let mut index = self.write_index().await;
        let Some(dead_letter) = index.dead_letter(id).cloned() else {
            return Err(QueueError::DeadLetterNotFound(id));
        };
        if index.get(&dead_letter.key).is_some() {
            return Err(QueueError::LiveMutationExists(dead_letter.key));
        }

        let version = index.next_version();
        let enqueued_at = Utc::now();
        let DeadLetter { key, change, .. } = dead_letter;
        let position = self
            .with_transaction(async |txn| {
                DeadLetter::delete(txn.as_mut(), id).await?;
                // The remote saw this mutation before, so a later delete must reach it.
                let position = MutationRecord::insert(
                    txn.as_mut(),
                    &key,
                    &change,
                    enqueued_at,
                    version,
                    true,
                )
                .await?;
                VersionCounter::store(txn.as_mut(), version).await?;
                Ok::<_, sqlx::Error>(position)
            })
            .await?;

        let record = MutationRecord {
            position,
            key: key.clone(),
            change,
            enqueued_at,
            retry_count: 0,
            version,
            dispatched: true,
            next_attempt_at: None,
        };
        index.remove_dead_letter(id);
        index.insert(record.clone());
        info!(%key, %id, "Requeued dead letter");

        drop(index);
        let mut notifier = self.notifier();
        notifier.add(key, QueueOperation::Requeued);
        notifier.notify();
        Ok(record)
    }

    /// Deletes a dead letter for good.
    pub async fn discard_dead_letter(&self, id: DeadLetterId) -> Result<DeadLetter, QueueError> {
        let mut index = self.write_index().await;
        if index.dead_letter(id).is_none() {
            return Err(QueueError::DeadLetterNotFound(id));
        }

        self.with_transaction(async |txn| DeadLetter::delete(txn.as_mut(), id).await)
            .await?;
        let Some(dead_letter) = index.remove_dead_letter(id) else {
            return Err(QueueError::DeadLetterNotFound(id));
        };
        info!(key = %dead_letter.key, %id, "Discarded dead letter");

        drop(index);
        let mut notifier = self.notifier();
        notifier.add(dead_letter.key.clone(), QueueOperation::Discarded);
        notifier.notify();
        Ok(dead_letter)
    }

    /// Marks the oldest due record as in flight and returns it.
    pub(crate) async fn claim_next_due(&self, now: DateTime<Utc>) -> Option<MutationRecord> {
        let mut index = self.write_index().await;
        let record = index.next_due(now).cloned()?;
        index.set_in_flight(record.key.clone());
        Some(record)
    }

    /// Persists that a claimed record is handed to the remote authority.
    ///
    /// From then on a later DELETE of the entity has to be sent instead of cancelling it.
    pub(crate) async fn mark_dispatched(
        &self,
        record: &mut MutationRecord,
    ) -> Result<(), QueueError> {
        if record.dispatched {
            return Ok(());
        }
        let mut index = self.write_index().await;
        let position = record.position;
        self.with_transaction(async |txn| {
            MutationRecord::mark_dispatched(txn.as_mut(), position).await
        })
        .await?;
        index.mark_dispatched(&record.key);
        record.dispatched = true;
        Ok(())
    }

    /// Returns a claimed record to the queue untouched.
    pub(crate) async fn release(&self, record: &MutationRecord) {
        let mut index = self.write_index().await;
        if index.is_in_flight(&record.key) {
            index.clear_in_flight();
        }
    }

    /// Settles a record the remote authority applied.
    ///
    /// If the entity was mutated again while applying, the newer version stays queued. A newer
    /// CREATE then becomes an UPDATE, since the applied version already created the entity.
    pub(crate) async fn settle_applied(
        &self,
        record: &MutationRecord,
    ) -> Result<Settlement, QueueError> {
        let mut index = self.write_index().await;
        index.clear_in_flight();
        let Some(live) = index.get(&record.key) else {
            warn!(key = %record.key, "Applied mutation is no longer queued");
            return Ok(Settlement::Superseded);
        };
        let (position, live_version, live_action) = (live.position, live.version, live.action());
        let key = record.key.clone();

        let settlement = if live_version == record.version {
            self.with_transaction(async |txn| {
                MutationRecord::delete(txn.as_mut(), position).await
            })
            .await?;
            index.remove(&key);
            Settlement::Removed
        } else {
            if record.action() == ActionKind::Create && live_action == ActionKind::Create {
                self.with_transaction(async |txn| {
                    MutationRecord::downgrade_to_update(txn.as_mut(), position).await
                })
                .await?;
                index.downgrade_to_update(&key);
            }
            debug!(
                %key,
                applied = record.version,
                live = live_version,
                "Applied mutation was superseded"
            );
            Settlement::Superseded
        };

        drop(index);
        let mut notifier = self.notifier();
        notifier.add(key, QueueOperation::Applied);
        notifier.notify();
        Ok(settlement)
    }

    /// Records a transient failure and schedules the next attempt.
    ///
    /// Returns `false` if the record was superseded while applying; the newer version is due
    /// immediately with a fresh retry budget.
    pub(crate) async fn increment_retry(
        &self,
        record: &MutationRecord,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let mut index = self.write_index().await;
        index.clear_in_flight();
        let Some(position) = index.live_position(&record.key, record.version) else {
            return Ok(false);
        };

        self.with_transaction(async |txn| {
            MutationRecord::reschedule(txn.as_mut(), position, retry_count, next_attempt_at).await
        })
        .await?;
        index.reschedule(&record.key, retry_count, next_attempt_at);

        drop(index);
        let mut notifier = self.notifier();
        notifier.add(record.key.clone(), QueueOperation::Rescheduled);
        notifier.notify();
        Ok(true)
    }

    /// Moves a failed record to the dead letters.
    ///
    /// Returns `None` if the record was superseded while applying; the newer version gets its own
    /// attempts.
    pub(crate) async fn move_to_dead_letter(
        &self,
        record: &MutationRecord,
        retry_count: u32,
        kind: FailureKind,
        message: String,
    ) -> Result<Option<DeadLetterId>, QueueError> {
        let mut index = self.write_index().await;
        index.clear_in_flight();
        let Some(position) = index.live_position(&record.key, record.version) else {
            return Ok(None);
        };

        let failed_at = Utc::now();
        self.with_transaction(async |txn| {
            MutationRecord::move_to_dead_letter(
                txn.as_mut(),
                position,
                retry_count,
                kind,
                &message,
                failed_at,
            )
            .await
        })
        .await?;

        let Some(live) = index.remove(&record.key) else {
            return Ok(None);
        };
        let id = DeadLetterId(live.position);
        index.insert_dead_letter(DeadLetter {
            id,
            key: live.key,
            change: live.change,
            enqueued_at: live.enqueued_at,
            retry_count,
            version: live.version,
            kind,
            message,
            failed_at,
        });

        drop(index);
        let mut notifier = self.notifier();
        notifier.add(record.key.clone(), QueueOperation::DeadLettered);
        notifier.notify();
        Ok(Some(id))
    }

    /// The earliest time a queued record becomes due, if any.
    pub(crate) async fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.inner.index.lock().await.next_due_at()
    }

    async fn write_index(&self) -> IndexWriteGuard<'_> {
        IndexWriteGuard {
            index: self.inner.index.lock().await,
            snapshot_tx: &self.inner.snapshot_tx,
        }
    }
}

/// Exclusive access to the index for a write.
///
/// Updates the published snapshot when dropped, if the write changed anything observers see.
/// The snapshot is only copied while a reader still holds on to the previous one.
struct IndexWriteGuard<'a> {
    index: MutexGuard<'a, QueueIndex>,
    snapshot_tx: &'a watch::Sender<Arc<QueueSnapshot>>,
}

impl Deref for IndexWriteGuard<'_> {
    type Target = QueueIndex;

    fn deref(&self) -> &Self::Target {
        &self.index
    }
}

impl DerefMut for IndexWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.index
    }
}

impl Drop for IndexWriteGuard<'_> {
    fn drop(&mut self) {
        if !self.index.has_snapshot_changes() {
            return;
        }
        let index = &mut *self.index;
        self.snapshot_tx
            .send_modify(|snapshot| index.update_snapshot(Arc::make_mut(snapshot)));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::TimeDelta;
    use quickcheck_macros::quickcheck;
    use tempfile::tempdir;
    use tokio_stream::StreamExt;

    use crate::mutation::Payload;

    use super::*;

    fn create(payload: &str) -> Change {
        Change::Create(Payload::from(payload))
    }

    fn update(payload: &str) -> Change {
        Change::Update(Payload::from(payload))
    }

    fn ticket(id: &str) -> DedupKey {
        DedupKey::new(EntityType::Ticket, id)
    }

    #[tokio::test]
    async fn enqueue_appends_in_order() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;

        store.enqueue(EntityType::Ticket, "t1", create("a")).await?;
        store.enqueue(EntityType::Job, "j1", create("b")).await?;
        store.enqueue(EntityType::Ticket, "t2", update("c")).await?;

        let pending = store.list_pending().await;
        let keys: Vec<String> = pending.iter().map(|record| record.key().to_string()).collect();
        assert_eq!(keys, ["ticket/t1", "job/j1", "ticket/t2"]);

        let versions: Vec<i64> = pending.iter().map(MutationRecord::version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        Ok(())
    }

    #[tokio::test]
    async fn update_collapses_into_create() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;

        let outcome = store.enqueue(EntityType::Ticket, "t1", create("p1")).await?;
        assert_eq!(outcome, EnqueueOutcome::Inserted);
        let first = store.get(&ticket("t1")).await.unwrap();

        let outcome = store.enqueue(EntityType::Ticket, "t1", update("p2")).await?;
        assert_eq!(outcome, EnqueueOutcome::Coalesced);

        let pending = store.list_pending().await;
        assert_eq!(pending.len(), 1);
        let record = &pending[0];
        assert_eq!(record.change(), &create("p2"));
        assert_eq!(record.position(), first.position());
        assert_eq!(record.enqueued_at(), first.enqueued_at());
        assert!(record.version() > first.version());
        Ok(())
    }

    #[tokio::test]
    async fn delete_cancels_unsent_create() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;

        store.enqueue(EntityType::Ticket, "t1", create("p1")).await?;
        let outcome = store.enqueue(EntityType::Ticket, "t1", Change::Delete).await?;

        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert!(store.list_pending().await.is_empty());
        assert_eq!(store.observer().pending_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn pending_delete_ignores_later_mutations() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;

        store.enqueue(EntityType::Job, "j1", Change::Delete).await?;
        let outcome = store.enqueue(EntityType::Job, "j1", update("late")).await?;

        assert_eq!(outcome, EnqueueOutcome::StaleIgnored);
        let pending = store.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action(), ActionKind::Delete);
        Ok(())
    }

    #[tokio::test]
    async fn delete_after_claimed_create_is_kept() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;

        store.enqueue(EntityType::Ticket, "t1", create("p1")).await?;
        let mut claimed = store.claim_next_due(Utc::now()).await.unwrap();
        store.mark_dispatched(&mut claimed).await?;
        assert!(claimed.dispatched());

        let outcome = store.enqueue(EntityType::Ticket, "t1", Change::Delete).await?;
        assert_eq!(outcome, EnqueueOutcome::Coalesced);
        assert!(matches!(
            store.cancel(EntityType::Ticket, "t1").await,
            Err(QueueError::MutationInFlight(_))
        ));

        // The create was applied, the delete still has to be sent.
        assert_eq!(store.settle_applied(&claimed).await?, Settlement::Superseded);
        let pending = store.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action(), ActionKind::Delete);
        Ok(())
    }

    #[tokio::test]
    async fn released_create_is_still_cancelled_by_delete() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;

        store.enqueue(EntityType::Ticket, "t1", create("p1")).await?;
        let claimed = store.claim_next_due(Utc::now()).await.unwrap();
        store.release(&claimed).await;

        let record = store.get(&ticket("t1")).await.unwrap();
        assert!(!record.dispatched());
        assert_eq!(store.observer().snapshot().in_flight(), None);

        let outcome = store.enqueue(EntityType::Ticket, "t1", Change::Delete).await?;
        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert!(store.list_pending().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn superseded_create_becomes_update() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;

        store.enqueue(EntityType::Ticket, "t1", create("p1")).await?;
        let claimed = store.claim_next_due(Utc::now()).await.unwrap();
        store.enqueue(EntityType::Ticket, "t1", update("p2")).await?;

        assert_eq!(store.settle_applied(&claimed).await?, Settlement::Superseded);
        let record = store.get(&ticket("t1")).await.unwrap();
        assert_eq!(record.change(), &update("p2"));
        Ok(())
    }

    #[tokio::test]
    async fn claim_skips_records_in_backoff() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;
        let now = Utc::now();

        store.enqueue(EntityType::Ticket, "t1", create("a")).await?;
        store.enqueue(EntityType::Ticket, "t2", create("b")).await?;

        let first = store.claim_next_due(now).await.unwrap();
        let retry_at = now + TimeDelta::seconds(10);
        assert!(store.increment_retry(&first, 1, retry_at).await?);

        let second = store.claim_next_due(now).await.unwrap();
        assert_eq!(second.key(), &ticket("t2"));
        store.settle_applied(&second).await?;

        assert!(store.claim_next_due(now).await.is_none());
        assert_eq!(store.next_due_at().await, Some(retry_at));

        let retried = store.claim_next_due(retry_at).await.unwrap();
        assert_eq!(retried.key(), &ticket("t1"));
        assert_eq!(retried.retry_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn superseded_record_is_not_rescheduled() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;

        store.enqueue(EntityType::Ticket, "t1", create("a")).await?;
        let claimed = store.claim_next_due(Utc::now()).await.unwrap();
        store.enqueue(EntityType::Ticket, "t1", update("b")).await?;

        let later = Utc::now() + TimeDelta::minutes(5);
        assert!(!store.increment_retry(&claimed, 1, later).await?);
        assert!(
            store
                .move_to_dead_letter(&claimed, 0, FailureKind::Permanent, "rejected".into())
                .await?
                .is_none()
        );

        let record = store.get(&ticket("t1")).await.unwrap();
        assert_eq!(record.retry_count(), 0);
        assert!(record.is_due(Utc::now()));
        assert!(store.dead_letter_items().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn dead_letters_can_be_requeued_and_discarded() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;

        store.enqueue(EntityType::Message, "m1", create("hi")).await?;
        let claimed = store.claim_next_due(Utc::now()).await.unwrap();
        let id = store
            .move_to_dead_letter(&claimed, 9, FailureKind::RetriesExhausted, "timeout".into())
            .await?
            .unwrap();

        assert!(store.list_pending().await.is_empty());
        let dead_letters = store.dead_letter_items().await;
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].id(), id);
        assert_eq!(dead_letters[0].retry_count(), 9);
        assert_eq!(dead_letters[0].kind(), FailureKind::RetriesExhausted);
        assert_eq!(dead_letters[0].message(), "timeout");

        // A new mutation of the same entity blocks the requeue.
        store.enqueue(EntityType::Message, "m1", update("edit")).await?;
        assert!(matches!(
            store.requeue_dead_letter(id).await,
            Err(QueueError::LiveMutationExists(_))
        ));
        store.cancel(EntityType::Message, "m1").await?;

        let requeued = store.requeue_dead_letter(id).await?;
        assert_eq!(requeued.retry_count(), 0);
        assert_eq!(requeued.change(), &create("hi"));
        assert!(store.dead_letter_items().await.is_empty());

        let claimed = store.claim_next_due(Utc::now()).await.unwrap();
        let id = store
            .move_to_dead_letter(&claimed, 0, FailureKind::Permanent, "invalid".into())
            .await?
            .unwrap();
        let discarded = store.discard_dead_letter(id).await?;
        assert_eq!(discarded.kind(), FailureKind::Permanent);
        assert!(matches!(
            store.discard_dead_letter(id).await,
            Err(QueueError::DeadLetterNotFound(_))
        ));
        assert!(store.observer().snapshot().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn survives_reopen() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("queue.sqlite");

        let (version, dead_letter_id) = {
            let store = QueueStore::open(&path).await?;
            store.enqueue(EntityType::Ticket, "t1", create("p1")).await?;
            store.enqueue(EntityType::Document, "d1", create("doc")).await?;
            let claimed = store.claim_next_due(Utc::now()).await.unwrap();
            let id = store
                .move_to_dead_letter(&claimed, 0, FailureKind::Permanent, "no".into())
                .await?
                .unwrap();
            store.enqueue(EntityType::Document, "d1", update("doc2")).await?;
            let document = store.get(&DedupKey::new(EntityType::Document, "d1")).await;
            let version = document.unwrap().version();
            store.close().await;
            (version, id)
        };

        let store = QueueStore::open(&path).await?;
        assert!(matches!(
            QueueStore::open(&path).await,
            Err(QueueError::QueueInUse(_))
        ));
        let pending = store.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change(), &create("doc2"));
        assert_eq!(pending[0].version(), version);
        assert_eq!(store.dead_letter_items().await[0].id(), dead_letter_id);

        // Versions keep increasing across restarts.
        store.enqueue(EntityType::Job, "j1", create("job")).await?;
        let job = store.get(&DedupKey::new(EntityType::Job, "j1")).await.unwrap();
        assert!(job.version() > version);
        Ok(())
    }

    #[tokio::test]
    async fn notifies_after_commit() -> anyhow::Result<()> {
        let store = QueueStore::open_in_memory().await?;
        let observer = store.observer();
        let mut notifications = observer.subscribe();

        store.enqueue(EntityType::Reminder, "r1", create("soon")).await?;
        let notification = notifications.next().await.unwrap();
        let key = DedupKey::new(EntityType::Reminder, "r1");
        assert!(notification.contains(&key, QueueOperation::Enqueued));
        assert!(observer.has_pending(EntityType::Reminder, "r1"));

        store.enqueue(EntityType::Reminder, "r1", Change::Delete).await?;
        let notification = notifications.next().await.unwrap();
        assert!(notification.contains(&key, QueueOperation::Cancelled));
        assert_eq!(observer.pending_count(), 0);
        Ok(())
    }

    #[quickcheck]
    fn live_keys_stay_unique(ops: Vec<(u8, u8)>) -> bool {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = QueueStore::open_in_memory().await.unwrap();
            for (id, action) in ops {
                let id = (id % 3).to_string();
                let change = match action % 3 {
                    0 => create(&id),
                    1 => update(&id),
                    _ => Change::Delete,
                };
                store.enqueue(EntityType::Ticket, id, change).await.unwrap();
            }

            let pending = store.list_pending().await;
            let keys: HashSet<_> = pending.iter().map(MutationRecord::key).collect();

            // The committed state matches the in-memory index.
            let reloaded = QueueStore::load(store.inner.pool.clone(), None).await.unwrap();
            let summary = |records: &[MutationRecord]| -> Vec<(i64, DedupKey, Change, i64)> {
                records
                    .iter()
                    .map(|r| (r.position, r.key.clone(), r.change.clone(), r.version))
                    .collect()
            };
            keys.len() == pending.len()
                && summary(&reloaded.list_pending().await) == summary(&pending)
                && store.observer().pending_count() == pending.len()
        })
    }
}

// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Read-only view of the queue for UI consumers.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt, wrappers::WatchStream};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    mutation::{ActionKind, DeadLetter, DeadLetterId, DedupKey, EntityType, MutationRecord},
    notifications::{QueueNotification, QueueNotificationsSender},
};

/// Summary of a live mutation as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub action: ActionKind,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PendingEntry {
    pub(crate) fn of(record: &MutationRecord) -> Self {
        Self {
            action: record.action(),
            retry_count: record.retry_count,
            next_attempt_at: record.next_attempt_at,
        }
    }
}

/// State of the queue after a committed write.
///
/// Dead letters are shared with the queue, so cloning a snapshot does not copy payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub(crate) pending: HashMap<DedupKey, PendingEntry>,
    pub(crate) dead_letters: BTreeMap<DeadLetterId, Arc<DeadLetter>>,
    pub(crate) in_flight: Option<DedupKey>,
}

impl QueueSnapshot {
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.len()
    }

    pub fn has_pending(&self, entity_type: EntityType, id: &str) -> bool {
        self.pending_entry(&DedupKey::new(entity_type, id)).is_some()
    }

    pub fn pending_entry(&self, key: &DedupKey) -> Option<&PendingEntry> {
        self.pending.get(key)
    }

    /// Number of live mutations for one entity, 0 or 1.
    pub fn pending_count_for(&self, entity_type: EntityType, id: &str) -> usize {
        usize::from(self.has_pending(entity_type, id))
    }

    pub fn pending_count_of_type(&self, entity_type: EntityType) -> usize {
        self.pending
            .keys()
            .filter(|key| key.entity_type == entity_type)
            .count()
    }

    /// Dead letters in queue order.
    pub fn dead_letters(&self) -> impl Iterator<Item = &DeadLetter> {
        self.dead_letters.values().map(Arc::as_ref)
    }

    /// The key whose mutation the coordinator is currently applying.
    pub fn in_flight(&self) -> Option<&DedupKey> {
        self.in_flight.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.dead_letters.is_empty()
    }
}

/// Observes the queue without being able to modify it.
///
/// Queries are answered from the latest published [`QueueSnapshot`] and never touch the
/// database.
#[derive(Debug, Clone)]
pub struct QueueObserver {
    snapshot_rx: watch::Receiver<Arc<QueueSnapshot>>,
    notifications_tx: QueueNotificationsSender,
}

impl QueueObserver {
    pub(crate) fn new(
        snapshot_rx: watch::Receiver<Arc<QueueSnapshot>>,
        notifications_tx: QueueNotificationsSender,
    ) -> Self {
        Self {
            snapshot_rx,
            notifications_tx,
        }
    }

    pub fn snapshot(&self) -> Arc<QueueSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.snapshot_rx.borrow().pending_count()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.snapshot_rx.borrow().dead_letter_count()
    }

    pub fn has_pending(&self, entity_type: EntityType, id: &str) -> bool {
        self.snapshot_rx.borrow().has_pending(entity_type, id)
    }

    pub fn pending_count_for(&self, entity_type: EntityType, id: &str) -> usize {
        self.snapshot_rx.borrow().pending_count_for(entity_type, id)
    }

    pub fn pending_count_of_type(&self, entity_type: EntityType) -> usize {
        self.snapshot_rx.borrow().pending_count_of_type(entity_type)
    }

    pub fn dead_letter_items(&self) -> Vec<DeadLetter> {
        self.snapshot_rx.borrow().dead_letters().cloned().collect()
    }

    /// Stream of snapshots, starting with the current one.
    ///
    /// Snapshots published faster than the consumer reads them are skipped; the stream always
    /// yields the latest state.
    pub fn snapshots(&self) -> impl Stream<Item = Arc<QueueSnapshot>> + Send + Unpin + 'static {
        WatchStream::new(self.snapshot_rx.clone())
    }

    /// Stream of per-write change notifications.
    pub fn subscribe(&self) -> impl Stream<Item = Arc<QueueNotification>> + Send + Unpin + 'static {
        self.notifications_tx.subscribe()
    }

    /// Calls `callback` for every notification until the returned subscription is dropped.
    pub fn on_queue_changed<F>(&self, mut callback: F) -> QueueSubscription
    where
        F: FnMut(&QueueNotification) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let mut notifications = self.subscribe();
        tokio::spawn(cancel.clone().run_until_cancelled_owned(async move {
            while let Some(notification) = notifications.next().await {
                callback(&notification);
            }
        }));
        QueueSubscription {
            _stop: cancel.drop_guard(),
        }
    }

    /// Waits until the queue reaches a state satisfying `predicate`.
    ///
    /// Returns `None` if the queue was dropped before that happened.
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&QueueSnapshot) -> bool,
    ) -> Option<Arc<QueueSnapshot>> {
        let mut snapshot_rx = self.snapshot_rx.clone();
        let snapshot = snapshot_rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .ok()?;
        Some(snapshot.clone())
    }
}

/// Keeps an [`QueueObserver::on_queue_changed`] callback registered.
#[derive(Debug)]
#[must_use = "the callback is unregistered when the subscription is dropped"]
pub struct QueueSubscription {
    _stop: DropGuard,
}

impl QueueSubscription {
    pub fn unsubscribe(self) {}
}

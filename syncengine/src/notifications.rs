// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Change notifications emitted after each committed queue write.

use std::{collections::HashMap, sync::Arc};

use enumset::{EnumSet, EnumSetType};
use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tracing::warn;

use crate::mutation::DedupKey;

const NOTIFICATION_CAPACITY: usize = 256;

/// What happened to a key's mutation.
#[derive(Debug, EnumSetType)]
pub enum QueueOperation {
    Enqueued,
    Coalesced,
    Cancelled,
    Applied,
    Rescheduled,
    DeadLettered,
    Requeued,
    Discarded,
    StaleIgnored,
}

/// Operations committed in one queue write, grouped by key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueNotification {
    pub ops: HashMap<DedupKey, EnumSet<QueueOperation>>,
    /// The subscriber fell behind and missed notifications.
    ///
    /// Re-read the queue state instead of relying on `ops`.
    pub lagged: bool,
}

impl QueueNotification {
    fn lagged() -> Self {
        Self {
            ops: HashMap::new(),
            lagged: true,
        }
    }

    pub fn contains(&self, key: &DedupKey, op: QueueOperation) -> bool {
        self.ops.get(key).is_some_and(|ops| ops.contains(op))
    }

    pub fn keys(&self) -> impl Iterator<Item = &DedupKey> {
        self.ops.keys()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QueueNotificationsSender {
    tx: broadcast::Sender<Arc<QueueNotification>>,
}

impl QueueNotificationsSender {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { tx }
    }

    fn notify(&self, notification: QueueNotification) {
        // No receivers is fine.
        let _ = self.tx.send(Arc::new(notification));
    }

    /// Subscribes to notifications.
    ///
    /// A subscriber that falls behind gets a single [`QueueNotification`] with `lagged` set
    /// instead of the notifications it missed.
    pub(crate) fn subscribe(
        &self,
    ) -> impl Stream<Item = Arc<QueueNotification>> + Send + Unpin + 'static {
        BroadcastStream::new(self.tx.subscribe()).map(|notification| match notification {
            Ok(notification) => notification,
            Err(error) => {
                warn!(%error, "Queue notification subscriber lagged");
                Arc::new(QueueNotification::lagged())
            }
        })
    }
}

/// Collects the operations of a write and sends them as one notification.
#[derive(Debug)]
pub(crate) struct QueueNotifier {
    tx: QueueNotificationsSender,
    notification: QueueNotification,
}

impl QueueNotifier {
    pub(crate) fn new(tx: QueueNotificationsSender) -> Self {
        Self {
            tx,
            notification: QueueNotification::default(),
        }
    }

    pub(crate) fn add(&mut self, key: DedupKey, op: QueueOperation) -> &mut Self {
        self.notification.ops.entry(key).or_default().insert(op);
        self
    }

    pub(crate) fn notify(self) {
        if !self.notification.ops.is_empty() {
            self.tx.notify(self.notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::mutation::EntityType;

    use super::*;

    #[tokio::test]
    async fn groups_operations_by_key() {
        let tx = QueueNotificationsSender::new();
        let mut notifications = tx.subscribe();

        let key = DedupKey::new(EntityType::Ticket, "t1");
        let mut notifier = QueueNotifier::new(tx.clone());
        notifier
            .add(key.clone(), QueueOperation::Applied)
            .add(key.clone(), QueueOperation::Enqueued);
        notifier.notify();

        let notification = notifications.next().await.unwrap();
        assert!(!notification.lagged);
        assert_eq!(
            notification.ops[&key],
            QueueOperation::Applied | QueueOperation::Enqueued
        );
        assert!(notification.contains(&key, QueueOperation::Enqueued));
        assert!(!notification.contains(&key, QueueOperation::Cancelled));
    }

    #[tokio::test]
    async fn empty_notifier_sends_nothing() {
        let tx = QueueNotificationsSender::new();
        let mut rx = tx.tx.subscribe();
        QueueNotifier::new(tx.clone()).notify();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lagged() {
        let tx = QueueNotificationsSender::new();
        let mut notifications = tx.subscribe();

        for i in 0..NOTIFICATION_CAPACITY + 1 {
            let mut notifier = QueueNotifier::new(tx.clone());
            notifier.add(
                DedupKey::new(EntityType::Job, i.to_string()),
                QueueOperation::Enqueued,
            );
            notifier.notify();
        }

        let first = notifications.next().await.unwrap();
        assert!(first.lagged);
        assert!(first.ops.is_empty());
    }
}

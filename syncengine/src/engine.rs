// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The [`SyncEngine`] ties the queue, the connectivity monitor and the sync service together.

use std::sync::{Arc, Weak};

use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::{
    QueueError,
    connectivity::{ConnectivityMonitor, ConnectivityState, ConnectivityWatcher},
    mutation::{Change, DeadLetter, DeadLetterId, EntityType, MutationRecord},
    observer::QueueObserver,
    queue::{EnqueueOutcome, QueueStore},
    remote::RemoteAuthority,
    settings::Settings,
    sync_service::{RetryPolicy, SyncContext, SyncService, WaitForDoneFuture},
    utils::drain_lock::DrainLock,
};

/// Handle to a running sync engine.
///
/// Cheap to clone. The background tasks stop when the last clone is dropped or after
/// [`SyncEngine::shutdown`].
#[derive(Debug, Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

#[derive(Debug)]
struct SyncEngineInner {
    queue: QueueStore,
    service: SyncService,
    connectivity: ConnectivityMonitor,
    stop_forwarder: CancellationToken,
    _stop_forwarder: DropGuard,
}

impl SyncEngine {
    /// Opens the queue database from `settings` and starts syncing against `remote`.
    ///
    /// `signal` reports raw network reachability; it is debounced before it affects syncing.
    pub async fn open<R, S>(settings: &Settings, remote: R, signal: S) -> Result<Self, QueueError>
    where
        R: RemoteAuthority,
        S: Stream<Item = ConnectivityState> + Send + Unpin + 'static,
    {
        let queue = QueueStore::open(&settings.database.path).await?;
        let drain_lock = DrainLock::for_database(&settings.database.path)?;
        Ok(Self::with_queue(settings, queue, drain_lock, remote, signal))
    }

    /// Like [`SyncEngine::open`], but the queue is not persisted.
    pub async fn open_in_memory<R, S>(
        settings: &Settings,
        remote: R,
        signal: S,
    ) -> Result<Self, QueueError>
    where
        R: RemoteAuthority,
        S: Stream<Item = ConnectivityState> + Send + Unpin + 'static,
    {
        let queue = QueueStore::open_in_memory().await?;
        Ok(Self::with_queue(
            settings,
            queue,
            DrainLock::in_process(),
            remote,
            signal,
        ))
    }

    fn with_queue<R, S>(
        settings: &Settings,
        queue: QueueStore,
        drain_lock: DrainLock,
        remote: R,
        signal: S,
    ) -> Self
    where
        R: RemoteAuthority,
        S: Stream<Item = ConnectivityState> + Send + Unpin + 'static,
    {
        let initial = if settings.connectivity.assume_online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        let connectivity =
            ConnectivityMonitor::spawn(initial, signal, settings.connectivity.debounce);

        let context = SyncContext::new(
            queue.clone(),
            Arc::new(remote),
            connectivity.watcher(),
            RetryPolicy::from(&settings.sync),
        );
        let service = SyncService::new(context, drain_lock);
        // Picks up whatever survived the last run.
        service.start();

        let stop_forwarder = CancellationToken::new();
        let watcher = connectivity.watcher();
        let inner = Arc::new(SyncEngineInner {
            queue,
            service,
            connectivity,
            stop_forwarder: stop_forwarder.clone(),
            _stop_forwarder: stop_forwarder.clone().drop_guard(),
        });
        tokio::spawn(
            stop_forwarder
                .run_until_cancelled_owned(forward_online(watcher, Arc::downgrade(&inner))),
        );

        info!(%initial, "Sync engine started");
        Self { inner }
    }

    /// Adds a mutation to the queue and wakes the sync service if there is new work.
    ///
    /// Returns once the mutation is durably stored.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        id: impl Into<String>,
        change: Change,
    ) -> Result<EnqueueOutcome, QueueError> {
        let outcome = self.inner.queue.enqueue(entity_type, id, change).await?;
        if outcome.requires_sync() {
            self.inner.service.notify_work();
        }
        Ok(outcome)
    }

    /// Withdraws the unsent mutation of an entity.
    ///
    /// Returns whether there was one.
    pub async fn cancel(&self, entity_type: EntityType, id: &str) -> Result<bool, QueueError> {
        self.inner.queue.cancel(entity_type, id).await
    }

    pub async fn list_pending(&self) -> Vec<MutationRecord> {
        self.inner.queue.list_pending().await
    }

    pub async fn dead_letter_items(&self) -> Vec<DeadLetter> {
        self.inner.queue.dead_letter_items().await
    }

    /// Moves a dead letter back into the queue and wakes the sync service.
    pub async fn requeue_dead_letter(&self, id: DeadLetterId) -> Result<MutationRecord, QueueError> {
        let record = self.inner.queue.requeue_dead_letter(id).await?;
        self.inner.service.notify_work();
        Ok(record)
    }

    pub async fn discard_dead_letter(&self, id: DeadLetterId) -> Result<DeadLetter, QueueError> {
        self.inner.queue.discard_dead_letter(id).await
    }

    /// Requests a pass over the queue and waits until it is done.
    ///
    /// Resolves immediately if the engine is stopped.
    pub fn sync_now(&self) -> WaitForDoneFuture {
        self.inner.service.notify_work()
    }

    /// Resumes syncing after [`SyncEngine::stop`].
    pub fn start(&self) -> WaitForDoneFuture {
        self.inner.service.start()
    }

    /// Pauses syncing. Enqueuing keeps working.
    pub fn stop(&self) -> WaitForDoneFuture {
        self.inner.service.stop()
    }

    /// Runs a single pass, then leaves syncing stopped.
    pub async fn run_once(&self) {
        self.inner.service.run_once().await;
    }

    pub fn is_running(&self) -> bool {
        self.inner.service.is_running()
    }

    /// The debounced connectivity state.
    pub fn connectivity(&self) -> ConnectivityState {
        self.inner.connectivity.state()
    }

    pub fn connectivity_watcher(&self) -> ConnectivityWatcher {
        self.inner.connectivity.watcher()
    }

    pub fn observer(&self) -> QueueObserver {
        self.inner.queue.observer()
    }

    pub fn queue(&self) -> &QueueStore {
        &self.inner.queue
    }

    /// Stops syncing, waits for the running pass and closes the database.
    ///
    /// Affects all clones of this engine.
    pub async fn shutdown(&self) {
        self.inner.service.stop().await;
        self.inner.stop_forwarder.cancel();
        self.inner.queue.close().await;
        info!("Sync engine shut down");
    }
}

/// Wakes the sync service whenever the connection comes back.
async fn forward_online(mut watcher: ConnectivityWatcher, engine: Weak<SyncEngineInner>) {
    while watcher.next_online().await.is_some() {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        debug!("Back online; waking sync service");
        engine.service.notify_work();
    }
}

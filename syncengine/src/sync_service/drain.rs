// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{fmt, sync::Arc, time::Duration};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    QueueError,
    connectivity::ConnectivityWatcher,
    mutation::{FailureKind, MutationRecord},
    queue::{QueueStore, Settlement},
    remote::{ApplyRequest, RemoteAuthority},
};

use super::{ApplyError, RetryPolicy, SyncServiceWork};

/// Everything a drain pass needs.
pub(crate) struct SyncContext<R> {
    queue: QueueStore,
    remote: Arc<R>,
    connectivity: ConnectivityWatcher,
    policy: RetryPolicy,
}

impl<R> SyncContext<R> {
    pub(crate) fn new(
        queue: QueueStore,
        remote: Arc<R>,
        connectivity: ConnectivityWatcher,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            remote,
            connectivity,
            policy,
        }
    }
}

impl<R> Clone for SyncContext<R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            remote: self.remote.clone(),
            connectivity: self.connectivity.clone(),
            policy: self.policy,
        }
    }
}

impl<R> fmt::Debug for SyncContext<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("queue", &self.queue)
            .field("connectivity", &self.connectivity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteAuthority> SyncServiceWork for SyncContext<R> {
    async fn work(&self, run_token: CancellationToken) -> Option<Instant> {
        SyncContext::work(self, run_token).await
    }
}

impl<R: RemoteAuthority> SyncContext<R> {
    async fn work(&self, run_token: CancellationToken) -> Option<Instant> {
        match self.drain(&run_token).await {
            Ok(next_due_at) => next_due_at.map(instant_at),
            Err(error) => {
                error!(%error, "Failed to drain the mutation queue");
                Some(Instant::now() + self.policy.base_delay)
            }
        }
    }

    /// Applies due mutations in queue order until none is left, the service is stopped, or
    /// connectivity is lost.
    ///
    /// Returns when the next record becomes due.
    async fn drain(
        &self,
        run_token: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, QueueError> {
        loop {
            if run_token.is_cancelled() {
                debug!("Drain stopped");
                return Ok(None);
            }
            if !self.connectivity.is_online() {
                debug!("Offline; waiting for connectivity");
                return Ok(None);
            }

            let Some(mut record) = self.queue.claim_next_due(Utc::now()).await else {
                return Ok(self.queue.next_due_at().await);
            };
            if run_token.is_cancelled() {
                self.queue.release(&record).await;
                return Ok(None);
            }
            if let Err(error) = self.queue.mark_dispatched(&mut record).await {
                self.queue.release(&record).await;
                return Err(error);
            }

            let result = self.apply(&record).await;
            self.settle(&record, result).await?;
        }
    }

    async fn apply(&self, record: &MutationRecord) -> Result<(), ApplyError> {
        debug!(
            key = %record.key(),
            action = %record.action(),
            version = record.version(),
            retry_count = record.retry_count(),
            "Applying mutation"
        );
        let request = ApplyRequest::new(record);
        match timeout(self.policy.apply_timeout, self.remote.apply(request)).await {
            Ok(result) => result,
            Err(_) => Err(ApplyError::transient(anyhow!(
                "apply timed out after {:?}",
                self.policy.apply_timeout
            ))),
        }
    }

    async fn settle(
        &self,
        record: &MutationRecord,
        result: Result<(), ApplyError>,
    ) -> Result<(), QueueError> {
        let key = record.key();
        match result {
            Ok(()) => match self.queue.settle_applied(record).await? {
                Settlement::Removed => debug!(%key, "Mutation applied"),
                Settlement::Superseded => debug!(%key, "Mutation applied; newer version queued"),
            },
            Err(ApplyError::Transient(error)) => {
                let retry_count = record.retry_count() + 1;
                if self.policy.is_exhausted(retry_count) {
                    error!(%key, retry_count, %error, "Retries exhausted; dead-lettering mutation");
                    self.queue
                        .move_to_dead_letter(
                            record,
                            retry_count,
                            FailureKind::RetriesExhausted,
                            format!("{error:#}"),
                        )
                        .await?;
                } else {
                    let delay = self.policy.delay(retry_count, &mut rand::thread_rng());
                    warn!(%key, retry_count, ?delay, %error, "Transient failure; retrying later");
                    let next_attempt_at = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|delay| Utc::now().checked_add_signed(delay))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    self.queue
                        .increment_retry(record, retry_count, next_attempt_at)
                        .await?;
                }
            }
            Err(ApplyError::Permanent(error)) => {
                error!(%key, %error, "Permanent failure; dead-lettering mutation");
                self.queue
                    .move_to_dead_letter(
                        record,
                        record.retry_count(),
                        FailureKind::Permanent,
                        format!("{error:#}"),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

/// Wake-ups further out than this are re-evaluated early.
const MAX_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

fn instant_at(due_at: DateTime<Utc>) -> Instant {
    let delay = (due_at - Utc::now()).to_std().unwrap_or_default();
    Instant::now() + delay.min(MAX_SLEEP)
}

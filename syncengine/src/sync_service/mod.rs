// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use pin_project::pin_project;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error};

use crate::utils::{drain_lock::DrainLock, sleep_until_some};

pub use backoff::RetryPolicy;
pub(crate) use drain::SyncContext;
pub use error::ApplyError;

mod backoff;
mod drain;
mod error;

/// Drains the mutation queue in a background task.
///
/// A new service is stopped. Once started, a pass runs on start, on every work notification and
/// when a scheduled retry becomes due. Passes never overlap: notifications arriving during a pass
/// are folded into one follow-up pass.
#[derive(Debug)]
pub struct SyncService {
    run_token_tx: Arc<watch::Sender<RunToken>>,
}

pub trait SyncServiceWork: Clone + Send + Sync + 'static {
    /// Performs one pass over the queue.
    ///
    /// Returns when the next pass is due if nothing wakes the service before.
    fn work(&self, run_token: CancellationToken) -> impl Future<Output = Option<Instant>> + Send;
}

impl SyncService {
    pub(crate) fn new<C: SyncServiceWork>(context: C, drain_lock: DrainLock) -> Self {
        let (run_token_tx, run_token_rx) = watch::channel(RunToken::stopped());
        let run_token_tx = Arc::new(run_token_tx);
        let task = SyncServiceTask {
            context,
            run_token_tx: Arc::downgrade(&run_token_tx),
        };
        tokio::spawn(task.run(run_token_rx, drain_lock));
        Self { run_token_tx }
    }

    /// Starts draining.
    ///
    /// The returned future resolves after the first pass.
    pub fn start(&self) -> WaitForDoneFuture {
        let mut pass_done = None;
        self.run_token_tx.send_modify(|run_token| {
            if !run_token.restart() {
                run_token.request_pass();
            }
            pass_done = Some(run_token.pass_done.clone());
        });
        debug!("Starting sync service");
        WaitForDoneFuture::new(pass_done)
    }

    /// Stops draining.
    ///
    /// A mutation that is being applied is settled first; the returned future resolves once the
    /// running pass, if any, has ended.
    pub fn stop(&self) -> WaitForDoneFuture {
        let mut pass_done = None;
        self.run_token_tx.send_if_modified(|run_token| {
            run_token.stop.cancel();
            pass_done = Some(run_token.pass_done.clone());
            // The running pass sees the stop on its own; an idle task has nothing to do.
            false
        });
        debug!("Stopping sync service");
        WaitForDoneFuture::new(pass_done)
    }

    /// Asks for another pass over the queue.
    ///
    /// Does nothing if the service is stopped. A request during a pass results in exactly one
    /// more pass.
    pub fn notify_work(&self) -> WaitForDoneFuture {
        request_pass(&self.run_token_tx)
    }

    /// Runs a single pass, or waits for the running one, then stops the service.
    pub async fn run_once(&self) {
        self.start().await;
        self.stop().await;
    }

    pub fn is_running(&self) -> bool {
        !self.run_token_tx.borrow().is_stopped()
    }
}

fn request_pass(run_token_tx: &watch::Sender<RunToken>) -> WaitForDoneFuture {
    let mut pass_done = None;
    let requested = run_token_tx.send_if_modified(|run_token| {
        if run_token.is_stopped() {
            return false;
        }
        run_token.request_pass();
        pass_done = Some(run_token.pass_done.clone());
        true
    });
    debug!(requested, "Requested sync pass");
    WaitForDoneFuture::new(pass_done)
}

struct SyncServiceTask<C> {
    context: C,
    run_token_tx: Weak<watch::Sender<RunToken>>,
}

impl<C: SyncServiceWork> SyncServiceTask<C> {
    async fn run(self, mut run_token_rx: watch::Receiver<RunToken>, mut drain_lock: DrainLock) {
        let mut retry_at: Option<Instant> = None;
        loop {
            tokio::select! {
                changed = run_token_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep_until_some(retry_at) => {
                    retry_at = None;
                    let Some(run_token_tx) = self.run_token_tx.upgrade() else {
                        break;
                    };
                    request_pass(&run_token_tx);
                    continue;
                }
            }

            let run_token = run_token_rx.borrow_and_update().clone();
            if run_token.is_stopped() {
                debug!("Sync service stopped; pass skipped");
                run_token.finish_pass();
                retry_at = None;
                continue;
            }

            match drain_lock.lock().await {
                Ok(_guard) => {
                    debug!("Sync pass started");
                    retry_at = self.context.work(run_token.stop.clone()).await;
                    debug!(?retry_at, "Sync pass finished");
                }
                Err(error) => {
                    error!(%error, "Failed to acquire drain lock");
                }
            }

            run_token.finish_pass();
        }
    }
}

/// Permission to drain, published to the task through a [`watch`] cell.
///
/// Publishing a new value wakes the task. `stop` ends a pass between two mutations and is never
/// published on its own. Everyone waiting for the same pass shares `pass_done`, which the task
/// fires when the pass ends. A permission revoked before the task picked it up is already done.
#[derive(Debug, Default, Clone)]
struct RunToken {
    stop: CancellationToken,
    pass_done: CancellationToken,
}

impl RunToken {
    fn stopped() -> Self {
        let run_token = Self::default();
        run_token.stop.cancel();
        run_token.finish_pass();
        run_token
    }

    fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Replaces a stopped permission with a fresh one.
    ///
    /// Returns `false` if the service is running.
    fn restart(&mut self) -> bool {
        if !self.is_stopped() {
            return false;
        }
        *self = Self::default();
        true
    }

    /// Hands out a new `pass_done` unless the upcoming pass already has one.
    fn request_pass(&mut self) {
        if self.pass_done.is_cancelled() {
            self.pass_done = CancellationToken::new();
        }
    }

    fn finish_pass(&self) {
        self.pass_done.cancel();
    }
}

/// Resolves when the sync pass it was handed out for has ended.
///
/// Resolves at once if no pass was scheduled. Dropping it does not affect the pass.
#[pin_project]
pub struct WaitForDoneFuture {
    #[pin]
    pass_done: Option<WaitForCancellationFutureOwned>,
}

impl WaitForDoneFuture {
    fn new(pass_done: Option<CancellationToken>) -> Self {
        Self {
            pass_done: pass_done.map(CancellationToken::cancelled_owned),
        }
    }
}

impl Future for WaitForDoneFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().pass_done.as_pin_mut() {
            Some(pass_done) => pass_done.poll(cx),
            None => Poll::Ready(()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::{
        sync::Notify,
        time::{sleep, timeout},
    };

    use crate::utils::init_test_tracing;

    use super::*;

    /// Takes a while per pass and counts the passes that were not stopped.
    #[derive(Default, Clone)]
    struct CountingDrain {
        full_passes: Arc<AtomicUsize>,
    }

    impl CountingDrain {
        fn full_passes(&self) -> usize {
            self.full_passes.load(Ordering::SeqCst)
        }
    }

    impl SyncServiceWork for CountingDrain {
        async fn work(&self, run_token: CancellationToken) -> Option<Instant> {
            sleep(Duration::from_millis(50)).await;
            if run_token.is_cancelled() {
                debug!("Counting drain stopped");
            } else {
                self.full_passes.fetch_add(1, Ordering::SeqCst);
            }
            None
        }
    }

    fn service(context: impl SyncServiceWork) -> SyncService {
        SyncService::new(context, DrainLock::in_process())
    }

    #[tokio::test]
    async fn new_service_is_stopped_until_started() {
        init_test_tracing();

        let drain = CountingDrain::default();
        let service = service(drain.clone());
        assert!(!service.is_running());

        service.notify_work().await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(drain.full_passes(), 0);

        service.start().await;
        assert!(service.is_running());
        assert_eq!(drain.full_passes(), 1);

        service.notify_work().await;
        assert_eq!(drain.full_passes(), 2);
    }

    #[tokio::test]
    async fn stopping_during_a_pass_cuts_it_short() {
        init_test_tracing();

        let drain = CountingDrain::default();
        let service = service(drain.clone());

        let _first_pass = service.start();
        service.stop().await;

        assert!(!service.is_running());
        assert_eq!(drain.full_passes(), 0);
    }

    #[tokio::test]
    async fn requests_during_a_pass_fold_into_one() {
        let drain = CountingDrain::default();
        let service = service(drain.clone());

        let first_pass = service.start();
        sleep(Duration::from_millis(10)).await;
        for _ in 0..3 {
            service.notify_work();
        }
        // The requests share the running pass and schedule a single follow-up.
        first_pass.await;
        assert_eq!(drain.full_passes(), 1);
        sleep(Duration::from_millis(200)).await;

        assert_eq!(drain.full_passes(), 2);
    }

    #[tokio::test]
    async fn starting_a_running_service_waits_for_its_pass() {
        let drain = CountingDrain::default();
        let service = service(drain.clone());

        for round in 1..=2 {
            let starts: Vec<_> = (0..4).map(|_| service.start()).collect();
            for start in starts {
                start.await;
            }
            assert_eq!(drain.full_passes(), round);
        }
    }

    #[tokio::test]
    async fn run_once_leaves_service_stopped() {
        let drain = CountingDrain::default();
        let service = service(drain.clone());

        service.run_once().await;
        service.run_once().await;

        assert_eq!(drain.full_passes(), 2);
        assert!(!service.is_running());
    }

    /// Schedules a retry after each of its first two passes.
    #[derive(Default, Clone)]
    struct RetryingDrain {
        passes: Arc<AtomicUsize>,
    }

    impl SyncServiceWork for RetryingDrain {
        async fn work(&self, _run_token: CancellationToken) -> Option<Instant> {
            let passes = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
            (passes < 3).then(|| Instant::now() + Duration::from_secs(5))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_retry_triggers_pass() {
        let drain = RetryingDrain::default();
        let service = service(drain.clone());

        service.start().await;
        assert_eq!(1, drain.passes.load(Ordering::SeqCst));

        sleep(Duration::from_secs(4)).await;
        assert_eq!(1, drain.passes.load(Ordering::SeqCst));

        sleep(Duration::from_secs(20)).await;
        assert_eq!(3, drain.passes.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_scheduled_retry() {
        let drain = RetryingDrain::default();
        let service = service(drain.clone());

        service.start().await;
        service.stop().await;
        sleep(Duration::from_secs(60)).await;

        assert_eq!(1, drain.passes.load(Ordering::SeqCst));
    }

    /// Blocks inside its pass until released.
    #[derive(Clone)]
    struct GatedDrain {
        release: Arc<Notify>,
        entered: Arc<Notify>,
    }

    impl SyncServiceWork for GatedDrain {
        async fn work(&self, _run_token: CancellationToken) -> Option<Instant> {
            self.entered.notify_waiters();
            self.release.notified().await;
            None
        }
    }

    #[tokio::test]
    async fn stop_waits_for_the_running_pass() {
        let release = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let drain = GatedDrain {
            release: release.clone(),
            entered: entered.clone(),
        };
        let service = service(drain);

        let pass_entered = entered.notified();
        service.start();
        pass_entered.await;

        let mut first_stop = Box::pin(service.stop());
        let mut second_stop = Box::pin(service.stop());
        // Neither stop resolves while the pass is blocked.
        assert!(
            timeout(Duration::from_millis(10), &mut first_stop)
                .await
                .is_err()
        );
        assert!(
            timeout(Duration::from_millis(10), &mut second_stop)
                .await
                .is_err()
        );

        release.notify_waiters();
        tokio::join!(first_stop, second_stop);

        // The pass is over, so another stop is immediate.
        assert!(
            timeout(Duration::from_millis(10), service.stop())
                .await
                .is_ok()
        );
    }
}

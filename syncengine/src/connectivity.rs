// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Debounced view of network reachability.
//!
//! Going offline is published immediately. Coming back online is only published once the
//! platform signal stayed online for the whole debounce window, so a flapping network wakes the
//! sync coordinator at most once.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::utils::sleep_until_some;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// Owns the background task that debounces a reachability signal.
///
/// The task stops when the monitor is dropped or the signal ends. The last published state is
/// kept in both cases.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state_rx: watch::Receiver<ConnectivityState>,
    _stop: DropGuard,
}

impl ConnectivityMonitor {
    pub fn spawn<S>(initial: ConnectivityState, signal: S, debounce: Duration) -> Self
    where
        S: Stream<Item = ConnectivityState> + Send + Unpin + 'static,
    {
        let (state_tx, state_rx) = watch::channel(initial);
        let stop = CancellationToken::new();
        tokio::spawn(
            stop.clone()
                .run_until_cancelled_owned(debounce_signal(signal, state_tx, debounce)),
        );
        Self {
            state_rx,
            _stop: stop.drop_guard(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state_rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    pub fn watcher(&self) -> ConnectivityWatcher {
        ConnectivityWatcher {
            state_rx: self.state_rx.clone(),
        }
    }
}

/// Follows the debounced connectivity state.
#[derive(Debug, Clone)]
pub struct ConnectivityWatcher {
    state_rx: watch::Receiver<ConnectivityState>,
}

impl ConnectivityWatcher {
    pub fn state(&self) -> ConnectivityState {
        *self.state_rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Waits for the next transition to online.
    ///
    /// Returns `None` once the monitor has stopped.
    pub async fn next_online(&mut self) -> Option<()> {
        loop {
            self.state_rx.changed().await.ok()?;
            if *self.state_rx.borrow_and_update() == ConnectivityState::Online {
                return Some(());
            }
        }
    }
}

async fn debounce_signal(
    mut signal: impl Stream<Item = ConnectivityState> + Unpin,
    state_tx: watch::Sender<ConnectivityState>,
    debounce: Duration,
) {
    // Set while the signal is online but the published state is not yet.
    let mut online_at: Option<Instant> = None;
    loop {
        let reported = tokio::select! {
            reported = signal.next() => reported,
            _ = sleep_until_some(online_at) => {
                online_at = None;
                publish(&state_tx, ConnectivityState::Online);
                continue;
            }
        };
        match reported {
            Some(ConnectivityState::Offline) => {
                online_at = None;
                publish(&state_tx, ConnectivityState::Offline);
            }
            Some(ConnectivityState::Online) => {
                if online_at.is_none() && *state_tx.borrow() == ConnectivityState::Offline {
                    debug!(?debounce, "Reachability restored; debouncing");
                    online_at = Some(Instant::now() + debounce);
                }
            }
            None => {
                debug!("Reachability signal ended");
                // The last report still counts once it held for the debounce window.
                if let Some(online_at) = online_at {
                    tokio::time::sleep_until(online_at).await;
                    publish(&state_tx, ConnectivityState::Online);
                }
                return;
            }
        }
    }
}

fn publish(state_tx: &watch::Sender<ConnectivityState>, state: ConnectivityState) {
    let changed = state_tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
    if changed {
        info!(%state, "Connectivity changed");
    }
}

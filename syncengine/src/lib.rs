// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline mutation queue of the maintenance ticketing client.
//!
//! Changes to tickets, work orders and the like are enqueued locally, coalesced per entity and
//! persisted in SQLite. A background service applies them to the remote authority in order
//! whenever the device is online, retrying transient failures with jittered exponential backoff
//! and dead-lettering the rest for manual resolution.

#![warn(clippy::large_futures)]

mod connectivity;
mod dedup;
mod engine;
mod error;
mod mutation;
mod notifications;
mod observer;
mod queue;
mod remote;
pub mod settings;
mod sync_service;
mod utils;

pub use connectivity::{ConnectivityMonitor, ConnectivityState, ConnectivityWatcher};
pub use engine::SyncEngine;
pub use error::QueueError;
pub use mutation::{
    ActionKind, Change, DeadLetter, DeadLetterId, DedupKey, EntityType, FailureKind,
    MutationRecord, Payload,
};
pub use notifications::{QueueNotification, QueueOperation};
pub use observer::{PendingEntry, QueueObserver, QueueSnapshot, QueueSubscription};
pub use queue::{EnqueueOutcome, QueueStore};
pub use remote::{ApplyRequest, AttemptMetadata, RemoteAuthority};
pub use settings::{Settings, get_configuration};
pub use sync_service::{ApplyError, RetryPolicy, WaitForDoneFuture};

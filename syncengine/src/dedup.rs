// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collapses redundant mutations against the same entity.
//!
//! The rules are applied in the queue store before anything is written, so the queue never holds
//! more than one live mutation per [`DedupKey`](crate::DedupKey).

use crate::mutation::{ActionKind, Change, MutationRecord};

/// What the deduplicator knows about the live record sharing the incoming mutation's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Existing {
    pub(crate) kind: ActionKind,
    /// The coordinator is applying the record right now.
    pub(crate) in_flight: bool,
    /// The record was handed to the remote at least once.
    pub(crate) dispatched: bool,
}

impl Existing {
    pub(crate) fn new(record: &MutationRecord, in_flight: bool) -> Self {
        Self {
            kind: record.action(),
            in_flight,
            dispatched: record.dispatched(),
        }
    }

    /// The remote might already know the entity created by this record.
    fn may_exist_remotely(&self) -> bool {
        self.in_flight || self.dispatched
    }
}

/// Outcome of deduplicating an incoming mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// No live record exists; queue the mutation at the end.
    Insert(Change),
    /// Replace the live record's change in place, keeping its position and enqueue time and
    /// resetting its retry count.
    Replace(Change),
    /// Remove the live record; together the two mutations have no remote effect.
    Cancel,
    /// A pending deletion supersedes the incoming mutation.
    StaleIgnored,
}

pub(crate) fn resolve(existing: Option<Existing>, incoming: Change) -> Resolution {
    let Some(existing) = existing else {
        return Resolution::Insert(incoming);
    };

    match (existing.kind, incoming) {
        // The entity is about to disappear; late creations or updates must not resurrect it.
        (ActionKind::Delete, _) => Resolution::StaleIgnored,

        (ActionKind::Create, Change::Create(payload) | Change::Update(payload)) => {
            Resolution::Replace(Change::Create(payload))
        }
        (ActionKind::Create, Change::Delete) if existing.may_exist_remotely() => {
            Resolution::Replace(Change::Delete)
        }
        (ActionKind::Create, Change::Delete) => Resolution::Cancel,

        (ActionKind::Update, Change::Create(payload) | Change::Update(payload)) => {
            Resolution::Replace(Change::Update(payload))
        }
        (ActionKind::Update, Change::Delete) => Resolution::Replace(Change::Delete),
    }
}

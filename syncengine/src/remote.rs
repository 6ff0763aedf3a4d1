// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    ApplyError,
    mutation::{Change, DedupKey, MutationRecord},
};

/// The server that authoritatively applies mutations.
///
/// Delivery is at least once: after a crash or a lost response the same version may be applied
/// again, so implementations should deduplicate on [`AttemptMetadata::idempotency_key`].
pub trait RemoteAuthority: Send + Sync + 'static {
    fn apply(&self, request: ApplyRequest) -> impl Future<Output = Result<(), ApplyError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub key: DedupKey,
    pub change: Change,
    pub metadata: AttemptMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptMetadata {
    /// 1 for the first attempt.
    pub attempt: u32,
    pub version: i64,
    pub enqueued_at: DateTime<Utc>,
    /// Stable across retries of the same version.
    pub idempotency_key: String,
}

impl ApplyRequest {
    pub(crate) fn new(record: &MutationRecord) -> Self {
        let key = record.key();
        Self {
            key: key.clone(),
            change: record.change().clone(),
            metadata: AttemptMetadata {
                attempt: record.retry_count() + 1,
                version: record.version(),
                enqueued_at: record.enqueued_at(),
                idempotency_key: format!("{}:{}:{}", key.entity_type, key.id, record.version()),
            },
        }
    }
}

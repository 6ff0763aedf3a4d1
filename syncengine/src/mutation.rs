// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Mutation records and the values they are built from.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sqlx::{
    Database, Decode, Encode, Sqlite, Type, encode::IsNull, error::BoxDynError,
    sqlite::SqliteTypeInfo,
};

/// Kind of domain entity a mutation targets.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Ticket,
    Job,
    Message,
    Document,
    Reminder,
}

/// The action of a mutation without its payload.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

/// Opaque serialized snapshot of an entity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Serializes `value` as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_vec(value).map(Self)
    }

    /// Deserializes the payload as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Payload")
            .field(&format_args!("{} bytes", self.0.len()))
            .finish()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// A single intended change to one entity.
///
/// Creations and updates always carry the new snapshot of the entity, deletions never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Create(Payload),
    Update(Payload),
    Delete,
}

impl Change {
    pub fn kind(&self) -> ActionKind {
        match self {
            Change::Create(_) => ActionKind::Create,
            Change::Update(_) => ActionKind::Update,
            Change::Delete => ActionKind::Delete,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Change::Create(payload) | Change::Update(payload) => Some(payload),
            Change::Delete => None,
        }
    }

    pub(crate) fn from_parts(
        kind: ActionKind,
        payload: Option<Vec<u8>>,
    ) -> Result<Self, MissingPayloadError> {
        match (kind, payload) {
            (ActionKind::Create, Some(payload)) => Ok(Change::Create(payload.into())),
            (ActionKind::Update, Some(payload)) => Ok(Change::Update(payload.into())),
            (ActionKind::Delete, _) => Ok(Change::Delete),
            (kind, None) => Err(MissingPayloadError { kind }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Stored {kind} mutation has no payload")]
pub(crate) struct MissingPayloadError {
    kind: ActionKind,
}

/// Identifies the entity a mutation targets.
///
/// The queue holds at most one live mutation per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub entity_type: EntityType,
    pub id: String,
}

impl DedupKey {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// A live mutation waiting to be applied by the remote authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub(crate) position: i64,
    pub(crate) key: DedupKey,
    pub(crate) change: Change,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) retry_count: u32,
    pub(crate) version: i64,
    pub(crate) dispatched: bool,
    pub(crate) next_attempt_at: Option<DateTime<Utc>>,
}

impl MutationRecord {
    /// Position in the queue; smaller positions are drained first.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn key(&self) -> &DedupKey {
        &self.key
    }

    pub fn change(&self) -> &Change {
        &self.change
    }

    pub fn action(&self) -> ActionKind {
        self.change.kind()
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.change.payload()
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Whether the record was handed to the remote authority at least once.
    pub fn dispatched(&self) -> bool {
        self.dispatched
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    pub(crate) fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|due_at| due_at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeadLetterId(pub(crate) i64);

impl DeadLetterId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a mutation left the retry path.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The remote authority rejected the mutation.
    Permanent,
    /// Transient failures exceeded the retry ceiling.
    RetriesExhausted,
}

/// A mutation that needs manual resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub(crate) id: DeadLetterId,
    pub(crate) key: DedupKey,
    pub(crate) change: Change,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) retry_count: u32,
    pub(crate) version: i64,
    pub(crate) kind: FailureKind,
    pub(crate) message: String,
    pub(crate) failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn id(&self) -> DeadLetterId {
        self.id
    }

    pub fn key(&self) -> &DedupKey {
        &self.key
    }

    pub fn change(&self) -> &Change {
        &self.change
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn failed_at(&self) -> DateTime<Utc> {
        self.failed_at
    }
}

/// Stores the enum as its snake case name in a TEXT column.
macro_rules! sqlite_text_enum {
    ($name:ty) => {
        impl Type<Sqlite> for $name {
            fn type_info() -> SqliteTypeInfo {
                <String as Type<Sqlite>>::type_info()
            }
        }

        impl<'r> Decode<'r, Sqlite> for $name {
            fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
                let s: &str = Decode::<Sqlite>::decode(value)?;
                s.parse().map_err(|_| {
                    format!("Unknown {} variant: {}", stringify!($name), s).into()
                })
            }
        }

        impl<'q> Encode<'q, Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
            ) -> Result<IsNull, BoxDynError> {
                let s: &'static str = self.into();
                <&str as Encode<Sqlite>>::encode(s, buf)
            }
        }
    };
}

sqlite_text_enum!(EntityType);
sqlite_text_enum!(ActionKind);
sqlite_text_enum!(FailureKind);

// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};

use crate::{
    dedup::Existing,
    mutation::{Change, DeadLetter, DeadLetterId, DedupKey, MutationRecord},
    observer::{PendingEntry, QueueSnapshot},
};

/// In-memory mirror of the committed queue state.
///
/// Only updated after the corresponding transaction has committed. Every change is also recorded
/// in [`SnapshotChanges`] until it is applied to the published [`QueueSnapshot`].
#[derive(Debug, Default)]
pub(crate) struct QueueIndex {
    live: HashMap<DedupKey, MutationRecord>,
    order: BTreeMap<i64, DedupKey>,
    dead_letters: BTreeMap<DeadLetterId, Arc<DeadLetter>>,
    in_flight: Option<DedupKey>,
    last_version: i64,
    changes: SnapshotChanges,
}

/// Parts of the snapshot that are out of date.
#[derive(Debug, Default)]
struct SnapshotChanges {
    keys: HashSet<DedupKey>,
    dead_letters: HashSet<DeadLetterId>,
    in_flight: bool,
}

impl SnapshotChanges {
    fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.dead_letters.is_empty() && !self.in_flight
    }
}

impl QueueIndex {
    pub(crate) fn new(
        live: Vec<MutationRecord>,
        dead_letters: Vec<DeadLetter>,
        last_version: i64,
    ) -> Self {
        let mut index = Self {
            last_version,
            ..Default::default()
        };
        for record in live {
            index.insert(record);
        }
        for dead_letter in dead_letters {
            index.insert_dead_letter(dead_letter);
        }
        index.changes = SnapshotChanges::default();
        index
    }

    pub(crate) fn get(&self, key: &DedupKey) -> Option<&MutationRecord> {
        self.live.get(key)
    }

    /// Position of the live record for `key`, if it still has `version`.
    pub(crate) fn live_position(&self, key: &DedupKey, version: i64) -> Option<i64> {
        self.live
            .get(key)
            .filter(|record| record.version == version)
            .map(|record| record.position)
    }

    pub(crate) fn existing(&self, key: &DedupKey) -> Option<Existing> {
        let record = self.live.get(key)?;
        Some(Existing::new(record, self.is_in_flight(key)))
    }

    pub(crate) fn next_version(&self) -> i64 {
        self.last_version + 1
    }

    pub(crate) fn insert(&mut self, record: MutationRecord) {
        self.last_version = self.last_version.max(record.version);
        self.changes.keys.insert(record.key.clone());
        self.order.insert(record.position, record.key.clone());
        if let Some(replaced) = self.live.insert(record.key.clone(), record) {
            self.order.remove(&replaced.position);
        }
    }

    /// Replaces the change of a live record in place, resetting its retry state.
    pub(crate) fn replace(
        &mut self,
        key: &DedupKey,
        change: Change,
        version: i64,
    ) -> Option<&MutationRecord> {
        self.last_version = self.last_version.max(version);
        let record = self.live.get_mut(key)?;
        self.changes.keys.insert(key.clone());
        record.change = change;
        record.version = version;
        record.retry_count = 0;
        record.next_attempt_at = None;
        Some(record)
    }

    pub(crate) fn remove(&mut self, key: &DedupKey) -> Option<MutationRecord> {
        let record = self.live.remove(key)?;
        self.changes.keys.insert(key.clone());
        self.order.remove(&record.position);
        if self.in_flight.as_ref() == Some(key) {
            self.clear_in_flight();
        }
        Some(record)
    }

    pub(crate) fn reschedule(
        &mut self,
        key: &DedupKey,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) {
        if let Some(record) = self.live.get_mut(key) {
            self.changes.keys.insert(key.clone());
            record.retry_count = retry_count;
            record.next_attempt_at = Some(next_attempt_at);
        }
    }

    pub(crate) fn mark_dispatched(&mut self, key: &DedupKey) {
        if let Some(record) = self.live.get_mut(key) {
            record.dispatched = true;
        }
    }

    pub(crate) fn downgrade_to_update(&mut self, key: &DedupKey) {
        if let Some(record) = self.live.get_mut(key)
            && let Change::Create(payload) = &record.change
        {
            record.change = Change::Update(payload.clone());
            self.changes.keys.insert(key.clone());
        }
    }

    /// Live records in queue order.
    pub(crate) fn pending(&self) -> impl Iterator<Item = &MutationRecord> {
        self.order.values().filter_map(|key| self.live.get(key))
    }

    /// The oldest record that is due at `now` and not being applied.
    pub(crate) fn next_due(&self, now: DateTime<Utc>) -> Option<&MutationRecord> {
        self.pending()
            .find(|record| !self.is_in_flight(&record.key) && record.is_due(now))
    }

    /// The earliest time a record that is not being applied becomes due.
    pub(crate) fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.pending()
            .filter(|record| !self.is_in_flight(&record.key))
            .map(|record| record.next_attempt_at.unwrap_or(DateTime::<Utc>::MIN_UTC))
            .min()
    }

    pub(crate) fn is_in_flight(&self, key: &DedupKey) -> bool {
        self.in_flight.as_ref() == Some(key)
    }

    pub(crate) fn set_in_flight(&mut self, key: DedupKey) {
        self.in_flight = Some(key);
        self.changes.in_flight = true;
    }

    pub(crate) fn clear_in_flight(&mut self) {
        if self.in_flight.take().is_some() {
            self.changes.in_flight = true;
        }
    }

    pub(crate) fn dead_letter(&self, id: DeadLetterId) -> Option<&DeadLetter> {
        self.dead_letters.get(&id).map(Arc::as_ref)
    }

    pub(crate) fn dead_letters(&self) -> impl Iterator<Item = &DeadLetter> {
        self.dead_letters.values().map(Arc::as_ref)
    }

    pub(crate) fn insert_dead_letter(&mut self, dead_letter: DeadLetter) {
        self.last_version = self.last_version.max(dead_letter.version);
        self.changes.dead_letters.insert(dead_letter.id);
        self.dead_letters.insert(dead_letter.id, Arc::new(dead_letter));
    }

    pub(crate) fn remove_dead_letter(&mut self, id: DeadLetterId) -> Option<DeadLetter> {
        let dead_letter = self.dead_letters.remove(&id)?;
        self.changes.dead_letters.insert(id);
        Some(Arc::unwrap_or_clone(dead_letter))
    }

    /// Builds a snapshot of the whole index.
    pub(crate) fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self
                .live
                .iter()
                .map(|(key, record)| (key.clone(), PendingEntry::of(record)))
                .collect(),
            dead_letters: self.dead_letters.clone(),
            in_flight: self.in_flight.clone(),
        }
    }

    pub(crate) fn has_snapshot_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Brings `snapshot` up to date with the changes since the last call.
    ///
    /// Only the touched keys and dead letters are copied.
    pub(crate) fn update_snapshot(&mut self, snapshot: &mut QueueSnapshot) {
        for key in self.changes.keys.drain() {
            match self.live.get(&key) {
                Some(record) => {
                    snapshot.pending.insert(key, PendingEntry::of(record));
                }
                None => {
                    snapshot.pending.remove(&key);
                }
            }
        }
        for id in self.changes.dead_letters.drain() {
            match self.dead_letters.get(&id) {
                Some(dead_letter) => {
                    snapshot.dead_letters.insert(id, dead_letter.clone());
                }
                None => {
                    snapshot.dead_letters.remove(&id);
                }
            }
        }
        if std::mem::take(&mut self.changes.in_flight) {
            snapshot.in_flight = self.in_flight.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use crate::mutation::{EntityType, Payload};

    use super::*;

    fn record(position: i64, id: &str, next_attempt_at: Option<DateTime<Utc>>) -> MutationRecord {
        MutationRecord {
            position,
            key: DedupKey::new(EntityType::Ticket, id),
            change: Change::Update(Payload::from(id)),
            enqueued_at: Utc::now(),
            retry_count: 0,
            version: position,
            dispatched: false,
            next_attempt_at,
        }
    }

    #[test]
    fn next_due_skips_backed_off_and_in_flight_records() {
        let now = Utc::now();
        let later = now + TimeDelta::seconds(30);
        let mut index = QueueIndex::new(
            vec![
                record(1, "a", None),
                record(2, "b", Some(later)),
                record(3, "c", None),
            ],
            Vec::new(),
            3,
        );

        assert_eq!(index.next_due(now).unwrap().key.id, "a");
        index.set_in_flight(DedupKey::new(EntityType::Ticket, "a"));
        assert_eq!(index.next_due(now).unwrap().key.id, "c");
        assert_eq!(index.next_due(later).unwrap().key.id, "b");
    }

    #[test]
    fn next_due_at_is_earliest_retry() {
        let now = Utc::now();
        let soon = now + TimeDelta::seconds(5);
        let later = now + TimeDelta::seconds(30);
        let index = QueueIndex::new(
            vec![record(1, "a", Some(later)), record(2, "b", Some(soon))],
            Vec::new(),
            2,
        );
        assert_eq!(index.next_due_at(), Some(soon));
        assert_eq!(QueueIndex::default().next_due_at(), None);
    }

    #[test]
    fn replace_keeps_position_and_resets_retries() {
        let mut index = QueueIndex::new(
            vec![record(1, "a", Some(Utc::now())), record(2, "b", None)],
            Vec::new(),
            2,
        );
        let key = DedupKey::new(EntityType::Ticket, "a");
        index.reschedule(&key, 3, Utc::now());

        let replaced = index.replace(&key, Change::Delete, 7).unwrap();
        assert_eq!(replaced.position, 1);
        assert_eq!(replaced.retry_count, 0);
        assert_eq!(replaced.next_attempt_at, None);
        assert_eq!(index.next_version(), 8);

        let order: Vec<_> = index.pending().map(|record| record.key.id.as_str()).collect();
        assert_eq!(order, ["a", "b"]);
    }

    #[test]
    fn snapshot_reflects_index() {
        let mut index = QueueIndex::new(
            vec![record(1, "a", None), record(2, "b", None)],
            Vec::new(),
            2,
        );
        let key = DedupKey::new(EntityType::Ticket, "b");
        index.set_in_flight(key.clone());
        index.remove(&DedupKey::new(EntityType::Ticket, "a"));

        let snapshot = index.snapshot();
        assert_eq!(snapshot.pending_count(), 1);
        assert!(snapshot.has_pending(EntityType::Ticket, "b"));
        assert_eq!(snapshot.in_flight(), Some(&key));
    }

    #[test]
    fn snapshot_updates_touch_only_changed_entries() {
        let mut index = QueueIndex::new(
            vec![record(1, "a", None), record(2, "b", None)],
            Vec::new(),
            2,
        );
        assert!(!index.has_snapshot_changes());
        let mut snapshot = index.snapshot();

        let a = DedupKey::new(EntityType::Ticket, "a");
        let b = DedupKey::new(EntityType::Ticket, "b");
        let removed = index.remove(&a).unwrap();
        index.insert_dead_letter(DeadLetter {
            id: DeadLetterId(removed.position),
            key: removed.key,
            change: removed.change,
            enqueued_at: removed.enqueued_at,
            retry_count: 2,
            version: removed.version,
            kind: crate::mutation::FailureKind::Permanent,
            message: "rejected".to_owned(),
            failed_at: Utc::now(),
        });
        index.reschedule(&b, 1, Utc::now());
        index.set_in_flight(b.clone());
        assert!(index.has_snapshot_changes());

        index.update_snapshot(&mut snapshot);
        assert!(!index.has_snapshot_changes());
        assert_eq!(snapshot, index.snapshot());
        assert_eq!(snapshot.pending_entry(&b).unwrap().retry_count, 1);

        // Dead letters are shared with the index, not copied.
        let id = DeadLetterId(1);
        assert!(Arc::ptr_eq(
            &snapshot.dead_letters[&id],
            &index.dead_letters[&id]
        ));

        index.remove_dead_letter(id);
        index.clear_in_flight();
        index.update_snapshot(&mut snapshot);
        assert_eq!(snapshot, index.snapshot());
        assert_eq!(snapshot.dead_letter_count(), 0);
        assert_eq!(snapshot.in_flight(), None);
    }
}

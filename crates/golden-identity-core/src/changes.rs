use std::collections::{BTreeMap, BTreeSet};

use crate::history::NewVersion;
use crate::model::{ChangePayload, ChangeType, GlobalCustomerId, HistoryEntry};

/// A change event not yet assigned a store sequence or timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChangeEvent {
    pub history_id: i64,
    pub global_customer_id: GlobalCustomerId,
    pub change_type: ChangeType,
    pub old_snapshot: Option<ChangePayload>,
    pub new_snapshot: ChangePayload,
}

/// Event for a version the history tracker has just inserted as
/// `history_id`.
#[must_use]
pub fn change_for_version(history_id: i64, version: &NewVersion) -> PendingChangeEvent {
    let old_snapshot = version.previous.as_ref().map(|previous| ChangePayload {
        snapshot: previous.snapshot.clone(),
        survivorship_snapshot: previous.survivorship_snapshot.clone(),
    });

    PendingChangeEvent {
        history_id,
        global_customer_id: version.global_customer_id,
        change_type: if old_snapshot.is_some() {
            ChangeType::Update
        } else {
            ChangeType::Insert
        },
        old_snapshot,
        new_snapshot: ChangePayload {
            snapshot: version.snapshot.clone(),
            survivorship_snapshot: version.survivorship_snapshot.clone(),
        },
    }
}

/// Derives events for current rows that have none yet.
///
/// A current row's predecessor is the expired row of the same id whose
/// `valid_to` equals the current row's `valid_from`. With a predecessor the
/// event is an update carrying both snapshots, otherwise an insert.
#[must_use]
pub fn derive_change_events(
    history: &[HistoryEntry],
    already_emitted: &BTreeSet<i64>,
) -> Vec<PendingChangeEvent> {
    let mut expired: BTreeMap<GlobalCustomerId, Vec<&HistoryEntry>> = BTreeMap::new();
    for row in history.iter().filter(|row| !row.is_current) {
        expired.entry(row.global_customer_id).or_default().push(row);
    }

    let mut current: Vec<&HistoryEntry> = history
        .iter()
        .filter(|row| row.is_current && !already_emitted.contains(&row.history_id))
        .collect();
    current.sort_by_key(|row| row.history_id);

    current
        .into_iter()
        .map(|row| {
            let predecessor = expired
                .get(&row.global_customer_id)
                .into_iter()
                .flatten()
                .filter(|candidate| candidate.valid_to == Some(row.valid_from))
                .max_by_key(|candidate| candidate.history_id);

            let old_snapshot = predecessor.map(|previous| payload(previous));
            PendingChangeEvent {
                history_id: row.history_id,
                global_customer_id: row.global_customer_id,
                change_type: if old_snapshot.is_some() {
                    ChangeType::Update
                } else {
                    ChangeType::Insert
                },
                old_snapshot,
                new_snapshot: payload(row),
            }
        })
        .collect()
}

fn payload(row: &HistoryEntry) -> ChangePayload {
    ChangePayload {
        snapshot: row.snapshot.clone(),
        survivorship_snapshot: row.survivorship_snapshot.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::PreviousVersion;
    use crate::model::GoldenSnapshot;
    use serde_json::Value;
    use time::{Duration, OffsetDateTime};
    use ulid::Ulid;

    fn gid(raw: u128) -> GlobalCustomerId {
        GlobalCustomerId(Ulid::from(raw))
    }

    fn at(minute: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::minutes(minute)
    }

    fn snapshot(record_count: u32) -> GoldenSnapshot {
        GoldenSnapshot {
            record_count,
            ..GoldenSnapshot::default()
        }
    }

    fn row(history_id: i64, from: i64, to: Option<i64>, record_count: u32) -> HistoryEntry {
        HistoryEntry {
            history_id,
            global_customer_id: gid(1),
            snapshot: snapshot(record_count),
            survivorship_snapshot: Value::Null,
            valid_from: at(from),
            valid_to: to.map(at),
            is_current: to.is_none(),
        }
    }

    #[test]
    fn first_version_is_an_insert() {
        let events = derive_change_events(&[row(1, 0, None, 1)], &BTreeSet::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Insert);
        assert_eq!(events[0].old_snapshot, None);
    }

    #[test]
    fn superseding_version_is_an_update_with_old_snapshot() {
        let history = vec![row(1, 0, Some(5), 1), row(2, 5, None, 2)];
        let events = derive_change_events(&history, &BTreeSet::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Update);
        assert_eq!(events[0].history_id, 2);
        match &events[0].old_snapshot {
            Some(old) => assert_eq!(old.snapshot.record_count, 1),
            None => panic!("expected an old snapshot"),
        }
        assert_eq!(events[0].new_snapshot.snapshot.record_count, 2);
    }

    #[test]
    fn rows_with_events_are_skipped() {
        let history = vec![row(1, 0, Some(5), 1), row(2, 5, None, 2)];
        let emitted: BTreeSet<i64> = [2].into_iter().collect();
        assert!(derive_change_events(&history, &emitted).is_empty());
    }

    #[test]
    fn gap_before_current_row_means_insert() {
        let history = vec![row(1, 0, Some(4), 1), row(2, 5, None, 2)];
        let events = derive_change_events(&history, &BTreeSet::new());
        assert_eq!(events[0].change_type, ChangeType::Insert);
    }

    #[test]
    fn synchronous_event_matches_derived_event() {
        let version = NewVersion {
            global_customer_id: gid(1),
            snapshot: snapshot(2),
            survivorship_snapshot: Value::Null,
            previous: Some(PreviousVersion {
                history_id: 1,
                snapshot: snapshot(1),
                survivorship_snapshot: Value::Null,
            }),
        };
        let synchronous = change_for_version(2, &version);

        let history = vec![row(1, 0, Some(5), 1), row(2, 5, None, 2)];
        let derived = derive_change_events(&history, &BTreeSet::new());
        assert_eq!(vec![synchronous], derived);
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::model::{GlobalCustomerId, GoldenCustomerRecord, GoldenSnapshot, HistoryEntry};
use crate::IdentityError;

/// The current row a new version supersedes.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviousVersion {
    pub history_id: i64,
    pub snapshot: GoldenSnapshot,
    pub survivorship_snapshot: Value,
}

/// A history row to insert as current, valid from the pass timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion {
    pub global_customer_id: GlobalCustomerId,
    pub snapshot: GoldenSnapshot,
    pub survivorship_snapshot: Value,
    pub previous: Option<PreviousVersion>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPlan {
    /// Current rows to close at the pass timestamp.
    pub expirations: Vec<i64>,
    pub versions: Vec<NewVersion>,
    pub unchanged: usize,
}

/// Compares every golden record with its id's current history row.
///
/// Only the canonical attributes and `record_count` are compared. Ids with
/// a current row but no golden record are left alone.
///
/// # Errors
/// Returns [`IdentityError::Consistency`] when an id has more than one
/// current row, or when `now` does not advance past a current row that
/// would be expired.
pub fn plan_history(
    current: &[HistoryEntry],
    golden: &[GoldenCustomerRecord],
    now: OffsetDateTime,
) -> Result<HistoryPlan, IdentityError> {
    let mut by_id: BTreeMap<GlobalCustomerId, &HistoryEntry> = BTreeMap::new();
    for row in current.iter().filter(|row| row.is_current) {
        if by_id.insert(row.global_customer_id, row).is_some() {
            return Err(IdentityError::Consistency(format!(
                "global customer id {} has more than one current history row",
                row.global_customer_id
            )));
        }
    }

    let mut plan = HistoryPlan::default();
    for record in golden {
        let previous = match by_id.get(&record.global_customer_id) {
            None => None,
            Some(row) if row.snapshot == record.snapshot => {
                plan.unchanged += 1;
                continue;
            }
            Some(row) => {
                if now <= row.valid_from {
                    return Err(IdentityError::Consistency(format!(
                        "history clock did not advance for {}: current row {} is valid from {}",
                        record.global_customer_id, row.history_id, row.valid_from
                    )));
                }
                plan.expirations.push(row.history_id);
                Some(PreviousVersion {
                    history_id: row.history_id,
                    snapshot: row.snapshot.clone(),
                    survivorship_snapshot: row.survivorship_snapshot.clone(),
                })
            }
        };

        plan.versions.push(NewVersion {
            global_customer_id: record.global_customer_id,
            snapshot: record.snapshot.clone(),
            survivorship_snapshot: record.survivorship_snapshot.clone(),
            previous,
        });
    }

    Ok(plan)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryViolation {
    pub global_customer_id: GlobalCustomerId,
    pub code: String,
    pub message: String,
}

/// Checks the versioning invariants over the full history of every id:
/// at most one current row, current rows open, expired rows closed and
/// non-empty, and no overlapping intervals.
#[must_use]
pub fn check_history_invariants(rows: &[HistoryEntry]) -> Vec<HistoryViolation> {
    let mut by_id: BTreeMap<GlobalCustomerId, Vec<&HistoryEntry>> = BTreeMap::new();
    for row in rows {
        by_id.entry(row.global_customer_id).or_default().push(row);
    }

    let mut violations = Vec::new();
    for (global_customer_id, mut versions) in by_id {
        let mut push = |code: &str, message: String| {
            violations.push(HistoryViolation {
                global_customer_id,
                code: code.to_string(),
                message,
            });
        };

        let current = versions.iter().filter(|row| row.is_current).count();
        if current > 1 {
            push(
                "multiple_current",
                format!("{current} history rows are marked current"),
            );
        }

        versions.sort_by(|lhs, rhs| {
            (lhs.valid_from, lhs.history_id).cmp(&(rhs.valid_from, rhs.history_id))
        });
        for row in &versions {
            match (row.is_current, row.valid_to) {
                (true, Some(_)) => push(
                    "closed_current_row",
                    format!("current row {} has valid_to set", row.history_id),
                ),
                (false, None) => push(
                    "open_expired_row",
                    format!("expired row {} has no valid_to", row.history_id),
                ),
                (_, Some(valid_to)) if valid_to <= row.valid_from => push(
                    "empty_interval",
                    format!("row {} has valid_to <= valid_from", row.history_id),
                ),
                _ => {}
            }
        }

        for pair in versions.windows(2) {
            let overlaps = match pair[0].valid_to {
                Some(end) => end > pair[1].valid_from,
                None => true,
            };
            if overlaps {
                push(
                    "overlapping_intervals",
                    format!(
                        "row {} overlaps row {}",
                        pair[0].history_id, pair[1].history_id
                    ),
                );
            }
        }
    }

    violations
}

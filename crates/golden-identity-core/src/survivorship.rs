use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::config::{SurvivorshipConfig, SurvivorshipStrategy};
use crate::model::{
    ClusterMember, CustomerAttribute, GlobalCustomerId, GoldenCustomerRecord, GoldenSnapshot,
    IdentityInputRecord,
};
use crate::IdentityError;

/// Builds one golden record per global id present in `members`.
///
/// Contributing rows are scanned in `(event_ts, source_system,
/// source_record_id)` order, which fixes every tie-break.
///
/// # Errors
/// Returns [`IdentityError::Configuration`] when `config` does not validate.
pub fn build_golden_records(
    members: &[ClusterMember],
    config: &SurvivorshipConfig,
    updated_at: OffsetDateTime,
) -> Result<Vec<GoldenCustomerRecord>, IdentityError> {
    config.validate()?;
    let survivorship_snapshot = config.snapshot();

    let mut clusters: BTreeMap<GlobalCustomerId, Vec<&IdentityInputRecord>> = BTreeMap::new();
    for member in members {
        clusters
            .entry(member.global_customer_id)
            .or_default()
            .push(&member.input);
    }

    let mut records = Vec::with_capacity(clusters.len());
    for (global_customer_id, mut rows) in clusters {
        rows.sort_by(|lhs, rhs| scan_key(lhs).cmp(&scan_key(rhs)));

        let mut snapshot = GoldenSnapshot {
            record_count: u32::try_from(rows.len()).map_err(|_| {
                IdentityError::Validation(format!(
                    "cluster {global_customer_id} has too many contributing records"
                ))
            })?,
            ..GoldenSnapshot::default()
        };

        for attribute in CustomerAttribute::ALL {
            let value = match config.strategy_for(attribute)? {
                SurvivorshipStrategy::Priority => {
                    pick_by_priority(&rows, attribute, config.priority_for(attribute))
                }
                SurvivorshipStrategy::MostFrequent => pick_most_frequent(&rows, attribute),
            }
            .map(str::to_string);

            match attribute {
                CustomerAttribute::Email => snapshot.canonical_email = value,
                CustomerAttribute::Phone => snapshot.canonical_phone = value,
                CustomerAttribute::Name => snapshot.canonical_name = value,
            }
        }

        records.push(GoldenCustomerRecord {
            global_customer_id,
            snapshot,
            survivorship_snapshot: survivorship_snapshot.clone(),
            updated_at,
        });
    }

    Ok(records)
}

fn scan_key(row: &IdentityInputRecord) -> (OffsetDateTime, &str, &str) {
    (row.event_ts, &row.source_system, &row.source_record_id)
}

/// Value from the latest row of the highest-priority source that has any
/// value at all. Sources outside `priority` never win.
fn pick_by_priority<'a>(
    rows: &[&'a IdentityInputRecord],
    attribute: CustomerAttribute,
    priority: &[String],
) -> Option<&'a str> {
    for source in priority {
        let mut best: Option<(OffsetDateTime, &'a str)> = None;
        for row in rows.iter().filter(|row| &row.source_system == source) {
            let Some(value) = row.vote(attribute) else {
                continue;
            };
            match best {
                Some((seen_at, _)) if row.event_ts <= seen_at => {}
                _ => best = Some((row.event_ts, value)),
            }
        }
        if let Some((_, value)) = best {
            return Some(value);
        }
    }
    None
}

/// Mode of the non-blank values; the first value to reach the winning count
/// keeps it.
fn pick_most_frequent<'a>(
    rows: &[&'a IdentityInputRecord],
    attribute: CustomerAttribute,
) -> Option<&'a str> {
    let mut counts: BTreeMap<&'a str, usize> = BTreeMap::new();
    let mut best: Option<(&'a str, usize)> = None;
    for row in rows {
        let Some(value) = row.vote(attribute) else {
            continue;
        };
        let count = counts.entry(value).or_insert(0);
        *count += 1;
        let leads = match best {
            Some((_, top)) => *count > top,
            None => true,
        };
        if leads {
            best = Some((value, *count));
        }
    }
    best.map(|(value, _)| value)
}

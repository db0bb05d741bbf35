use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;

use crate::model::{AttributeConflict, ClusterMember, CustomerAttribute, GlobalCustomerId};

/// Reports every `(global id, attribute)` whose contributing inputs carry
/// more than one distinct non-blank value.
#[must_use]
pub fn detect_conflicts(
    members: &[ClusterMember],
    detected_at: OffsetDateTime,
) -> Vec<AttributeConflict> {
    let mut distinct: BTreeMap<(GlobalCustomerId, CustomerAttribute), BTreeSet<&str>> =
        BTreeMap::new();
    for member in members {
        for attribute in CustomerAttribute::ALL {
            if let Some(value) = member.input.vote(attribute) {
                distinct
                    .entry((member.global_customer_id, attribute))
                    .or_default()
                    .insert(value);
            }
        }
    }

    distinct
        .into_iter()
        .filter(|(_, values)| values.len() > 1)
        .map(|((global_customer_id, attribute), values)| AttributeConflict {
            global_customer_id,
            attribute,
            distinct_value_count: u32::try_from(values.len()).unwrap_or(u32::MAX),
            detected_at,
        })
        .collect()
}

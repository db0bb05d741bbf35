//! Pure domain layer for golden customer identity resolution.
//!
//! Every stage of the engine is expressed here as a deterministic function
//! over in-memory rows: [`score_pairs`] for match scoring,
//! [`plan_resolution`] for identity-graph merges, [`build_golden_records`]
//! for survivorship, [`plan_history`] for SCD2 versioning,
//! [`derive_change_events`] for change capture and [`detect_conflicts`] for
//! attribute disagreement. Persistence and transactions live in the store
//! crate.

use time::{OffsetDateTime, UtcOffset};

pub mod changes;
pub mod config;
pub mod conflicts;
pub mod history;
pub mod model;
pub mod resolve;
pub mod scoring;
pub mod similarity;
pub mod survivorship;

pub use changes::{change_for_version, derive_change_events, PendingChangeEvent};
pub use config::{
    EngineConfig, MatchRules, NameMetric, ResolutionConfig, ReviewPolicy, SurvivorRule,
    SurvivorshipConfig, SurvivorshipStrategy,
};
pub use conflicts::detect_conflicts;
pub use history::{
    check_history_invariants, plan_history, HistoryPlan, HistoryViolation, NewVersion,
    PreviousVersion,
};
pub use model::{
    AttributeConflict, CandidatePair, ChangeEvent, ChangePayload, ChangeType, ClusterMember,
    CustomerAttribute, GlobalCustomerId, GoldenCustomerRecord, GoldenSnapshot, HistoryEntry,
    IdentityInputRecord, IdentityMapEntry, MatchCandidate, MatchDecision, MergeProposal, PairSide,
    RecordRef, RetiredGlobalId,
};
pub use resolve::{plan_resolution, IdentityGraph, Reassignment, ResolutionPlan, UnionOutcome};
pub use scoring::{score_pair, score_pairs};
pub use similarity::name_similarity;
pub use survivorship::build_golden_records;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("consistency error: {0}")]
    Consistency(String),
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`IdentityError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IdentityError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| IdentityError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(IdentityError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`IdentityError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IdentityError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            IdentityError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip_keeps_subsecond_precision() {
        let parsed = match parse_rfc3339_utc("2026-03-01T08:15:30.123456789Z") {
            Ok(value) => value,
            Err(err) => panic!("expected valid timestamp: {err}"),
        };
        let formatted = match format_rfc3339(parsed) {
            Ok(value) => value,
            Err(err) => panic!("expected formatting to succeed: {err}"),
        };
        assert_eq!(formatted, "2026-03-01T08:15:30.123456789Z");
    }

    #[test]
    fn non_utc_offsets_are_rejected() {
        let err = parse_rfc3339_utc("2026-03-01T08:15:30+02:00");
        assert!(matches!(err, Err(IdentityError::Validation(_))));
    }
}

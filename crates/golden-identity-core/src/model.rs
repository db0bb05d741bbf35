use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::IdentityError;

/// Durable identifier of one resolved real-world customer.
///
/// ULIDs sort by mint time, so the ordering of ids doubles as their age.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct GlobalCustomerId(pub Ulid);

impl GlobalCustomerId {
    #[must_use]
    pub fn mint() -> Self {
        Self(Ulid::new())
    }

    /// Parses the canonical ULID text form.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        Ulid::from_string(raw).map(Self).map_err(|err| {
            IdentityError::Validation(format!("invalid global customer id {raw}: {err}"))
        })
    }
}

impl Display for GlobalCustomerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a source record: `(source_system, source_record_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordRef {
    pub source_system: String,
    pub source_record_id: String,
}

impl RecordRef {
    #[must_use]
    pub fn new(source_system: impl Into<String>, source_record_id: impl Into<String>) -> Self {
        Self {
            source_system: source_system.into(),
            source_record_id: source_record_id.into(),
        }
    }

    /// Parses `<source_system>:<source_record_id>`. The record id may itself
    /// contain colons; the system may not.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when either half is empty.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let Some((system, record_id)) = raw.split_once(':') else {
            return Err(IdentityError::Validation(
                "record reference must be in <source_system>:<source_record_id> format".to_string(),
            ));
        };

        if system.trim().is_empty() || record_id.trim().is_empty() {
            return Err(IdentityError::Validation(
                "record reference must be in <source_system>:<source_record_id> format".to_string(),
            ));
        }

        Ok(Self::new(system, record_id))
    }
}

impl Display for RecordRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_system, self.source_record_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CustomerAttribute {
    Email,
    Phone,
    Name,
}

impl CustomerAttribute {
    pub const ALL: [Self; 3] = [Self::Email, Self::Phone, Self::Name];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Name => "name",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email" => Some(Self::Email),
            "phone" => Some(Self::Phone),
            "name" => Some(Self::Name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchDecision {
    AutoMerge,
    FlagReview,
    Reject,
}

impl MatchDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoMerge => "AUTO_MERGE",
            Self::FlagReview => "FLAG_REVIEW",
            Self::Reject => "REJECT",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AUTO_MERGE" => Some(Self::AutoMerge),
            "FLAG_REVIEW" => Some(Self::FlagReview),
            "REJECT" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Insert,
    Update,
}

impl ChangeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            _ => None,
        }
    }
}

/// A normalized row produced by the upstream staging stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityInputRecord {
    pub source_system: String,
    pub source_record_id: String,
    #[serde(default)]
    pub normalized_email: Option<String>,
    #[serde(default)]
    pub normalized_phone: Option<String>,
    #[serde(default)]
    pub normalized_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub event_ts: OffsetDateTime,
}

impl IdentityInputRecord {
    #[must_use]
    pub fn reference(&self) -> RecordRef {
        RecordRef::new(&self.source_system, &self.source_record_id)
    }

    /// Returns the usable value for `attribute`; blank values cast no vote.
    #[must_use]
    pub fn vote(&self, attribute: CustomerAttribute) -> Option<&str> {
        let raw = match attribute {
            CustomerAttribute::Email => self.normalized_email.as_deref(),
            CustomerAttribute::Phone => self.normalized_phone.as_deref(),
            CustomerAttribute::Name => self.normalized_name.as_deref(),
        };
        clean_vote(raw)
    }

    /// Validates the record key.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when the source system or
    /// record id is blank.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.source_system.trim().is_empty() {
            return Err(IdentityError::Validation(
                "source_system MUST be provided for every input record".to_string(),
            ));
        }
        if self.source_record_id.trim().is_empty() {
            return Err(IdentityError::Validation(
                "source_record_id MUST be provided for every input record".to_string(),
            ));
        }
        Ok(())
    }
}

/// One side of a blocked candidate pair, carrying that record's attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairSide {
    #[serde(flatten)]
    pub reference: RecordRef,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl PairSide {
    #[must_use]
    pub fn vote(&self, attribute: CustomerAttribute) -> Option<&str> {
        let raw = match attribute {
            CustomerAttribute::Email => self.email.as_deref(),
            CustomerAttribute::Phone => self.phone.as_deref(),
            CustomerAttribute::Name => self.name.as_deref(),
        };
        clean_vote(raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidatePair {
    pub left: PairSide,
    pub right: PairSide,
}

impl CandidatePair {
    /// Validates that both sides carry a record key.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] for blank keys.
    pub fn validate(&self) -> Result<(), IdentityError> {
        for side in [&self.left, &self.right] {
            if side.reference.source_system.trim().is_empty()
                || side.reference.source_record_id.trim().is_empty()
            {
                return Err(IdentityError::Validation(
                    "candidate pair sides MUST carry source_system and source_record_id"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    /// True when both sides reference the same record.
    #[must_use]
    pub fn is_self_pair(&self) -> bool {
        self.left.reference == self.right.reference
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchCandidate {
    pub left_ref: RecordRef,
    pub right_ref: RecordRef,
    pub email_score: u32,
    pub phone_score: u32,
    pub name_score: u32,
    pub total_score: u32,
    pub decision: MatchDecision,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityMapEntry {
    pub global_customer_id: GlobalCustomerId,
    #[serde(flatten)]
    pub record: RecordRef,
    pub confidence_score: u32,
    pub decision: MatchDecision,
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: OffsetDateTime,
}

/// Audit row left behind when a cluster merge retires a global id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetiredGlobalId {
    pub retired_id: GlobalCustomerId,
    pub surviving_id: GlobalCustomerId,
    pub reassigned_records: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub merged_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeProposal {
    pub left_ref: RecordRef,
    pub right_ref: RecordRef,
    pub total_score: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub proposed_at: OffsetDateTime,
}

/// An input row joined to the global id its record maps to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterMember {
    pub global_customer_id: GlobalCustomerId,
    pub input: IdentityInputRecord,
}

/// The compared part of a golden record: canonical attributes and support.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GoldenSnapshot {
    pub canonical_email: Option<String>,
    pub canonical_phone: Option<String>,
    pub canonical_name: Option<String>,
    pub record_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoldenCustomerRecord {
    pub global_customer_id: GlobalCustomerId,
    #[serde(flatten)]
    pub snapshot: GoldenSnapshot,
    pub survivorship_snapshot: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub history_id: i64,
    pub global_customer_id: GlobalCustomerId,
    #[serde(flatten)]
    pub snapshot: GoldenSnapshot,
    pub survivorship_snapshot: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
    pub is_current: bool,
}

/// Snapshot carried by change events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangePayload {
    #[serde(flatten)]
    pub snapshot: GoldenSnapshot,
    pub survivorship_snapshot: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub event_seq: i64,
    pub history_id: i64,
    pub global_customer_id: GlobalCustomerId,
    pub change_type: ChangeType,
    pub old_snapshot: Option<ChangePayload>,
    pub new_snapshot: ChangePayload,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeConflict {
    pub global_customer_id: GlobalCustomerId,
    #[serde(rename = "attribute_name")]
    pub attribute: CustomerAttribute,
    pub distinct_value_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
}

fn clean_vote(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_input(email: Option<&str>) -> IdentityInputRecord {
        IdentityInputRecord {
            source_system: "sales".to_string(),
            source_record_id: "S-1".to_string(),
            normalized_email: email.map(str::to_string),
            normalized_phone: None,
            normalized_name: Some("john doe".to_string()),
            event_ts: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn blank_values_cast_no_vote() {
        assert_eq!(fixture_input(Some("   ")).vote(CustomerAttribute::Email), None);
        assert_eq!(fixture_input(None).vote(CustomerAttribute::Email), None);
        assert_eq!(
            fixture_input(Some(" j@x.com ")).vote(CustomerAttribute::Email),
            Some("j@x.com")
        );
    }

    #[test]
    fn record_ref_parse_keeps_colons_in_record_id() {
        let parsed = match RecordRef::parse("support:T:42") {
            Ok(value) => value,
            Err(err) => panic!("expected valid reference: {err}"),
        };
        assert_eq!(parsed, RecordRef::new("support", "T:42"));
        assert!(RecordRef::parse("support").is_err());
        assert!(RecordRef::parse(":42").is_err());
    }

    #[test]
    fn self_pairs_validate_but_are_detected() {
        let side = PairSide {
            reference: RecordRef::new("sales", "S-1"),
            email: None,
            phone: None,
            name: None,
        };
        let pair = CandidatePair {
            left: side.clone(),
            right: side,
        };
        assert_eq!(pair.validate(), Ok(()));
        assert!(pair.is_self_pair());
    }

    #[test]
    fn decision_codes_round_trip_through_serde() {
        let value = match serde_json::to_value(MatchDecision::FlagReview) {
            Ok(value) => value,
            Err(err) => panic!("serialize failed: {err}"),
        };
        assert_eq!(value, serde_json::json!("FLAG_REVIEW"));
        assert_eq!(MatchDecision::parse("FLAG_REVIEW"), Some(MatchDecision::FlagReview));
        assert_eq!(ChangeType::parse("UPDATE"), Some(ChangeType::Update));
    }
}

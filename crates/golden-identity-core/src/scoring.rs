use time::OffsetDateTime;
use tracing::warn;

use crate::config::MatchRules;
use crate::model::{CandidatePair, CustomerAttribute, MatchCandidate, MatchDecision};
use crate::similarity::name_similarity;
use crate::IdentityError;

/// Scores one blocked pair under `rules`.
///
/// Email and phone award their weight on exact equality of non-blank
/// values. The name awards its weight when the similarity reaches the
/// configured threshold. A pair auto-merges only when the email component
/// scored its full, non-zero weight.
#[must_use]
pub fn score_pair(
    pair: &CandidatePair,
    rules: &MatchRules,
    evaluated_at: OffsetDateTime,
) -> MatchCandidate {
    let exact = |attribute: CustomerAttribute, weight: u32| -> u32 {
        match (pair.left.vote(attribute), pair.right.vote(attribute)) {
            (Some(left), Some(right)) if left == right => weight,
            _ => 0,
        }
    };

    let email_score = exact(CustomerAttribute::Email, rules.email_weight);
    let phone_score = exact(CustomerAttribute::Phone, rules.phone_weight);

    let similarity = name_similarity(
        pair.left.vote(CustomerAttribute::Name),
        pair.right.vote(CustomerAttribute::Name),
        rules.name_metric,
    );
    let name_score = if similarity >= rules.name_similarity_threshold && similarity > 0.0 {
        rules.name_weight
    } else {
        0
    };

    let total_score = email_score
        .saturating_add(phone_score)
        .saturating_add(name_score);

    let decision = if rules.email_weight > 0 && email_score == rules.email_weight {
        MatchDecision::AutoMerge
    } else if total_score >= rules.review_threshold {
        MatchDecision::FlagReview
    } else {
        MatchDecision::Reject
    };

    MatchCandidate {
        left_ref: pair.left.reference.clone(),
        right_ref: pair.right.reference.clone(),
        email_score,
        phone_score,
        name_score,
        total_score,
        decision,
        evaluated_at,
    }
}

/// Validates the rules and every pair, then scores the batch.
///
/// Pairs that reference the same record on both sides carry no match
/// evidence and are skipped.
///
/// # Errors
/// Returns [`IdentityError::Configuration`] for invalid rules and
/// [`IdentityError::Validation`] for a pair with a blank key. Nothing is
/// scored when any input is rejected.
pub fn score_pairs(
    pairs: &[CandidatePair],
    rules: &MatchRules,
    evaluated_at: OffsetDateTime,
) -> Result<Vec<MatchCandidate>, IdentityError> {
    rules.validate()?;
    for pair in pairs {
        pair.validate()?;
    }

    Ok(pairs
        .iter()
        .filter(|pair| {
            if pair.is_self_pair() {
                warn!(record = %pair.left.reference, "skipping self-referencing candidate pair");
                return false;
            }
            true
        })
        .map(|pair| score_pair(pair, rules, evaluated_at))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PairSide, RecordRef};

    fn side(
        system: &str,
        id: &str,
        email: Option<&str>,
        phone: Option<&str>,
        name: Option<&str>,
    ) -> PairSide {
        PairSide {
            reference: RecordRef::new(system, id),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            name: name.map(str::to_string),
        }
    }

    fn score(left: PairSide, right: PairSide) -> MatchCandidate {
        score_pair(
            &CandidatePair { left, right },
            &MatchRules::v1(),
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    #[test]
    fn equal_email_with_similar_name_auto_merges() {
        let candidate = score(
            side("sales", "S-1", Some("j@x.com"), None, Some("john doe")),
            side("marketing", "M-1", Some("j@x.com"), None, Some("jon doe")),
        );
        assert_eq!(candidate.email_score, 70);
        assert_eq!(candidate.phone_score, 0);
        assert_eq!(candidate.name_score, 30);
        assert_eq!(candidate.total_score, 100);
        assert_eq!(candidate.decision, MatchDecision::AutoMerge);
    }

    #[test]
    fn phone_alone_flags_review() {
        let candidate = score(
            side("sales", "S-1", None, Some("555"), Some("ann lee")),
            side("support", "T-1", Some("a@x.com"), Some("555"), Some("bob ray")),
        );
        assert_eq!(candidate.total_score, 70);
        assert_eq!(candidate.decision, MatchDecision::FlagReview);
    }

    #[test]
    fn name_alone_rejects() {
        let candidate = score(
            side("sales", "S-1", None, None, Some("ann lee")),
            side("support", "T-1", None, None, Some("ann lee")),
        );
        assert_eq!(candidate.total_score, 30);
        assert_eq!(candidate.decision, MatchDecision::Reject);
    }

    #[test]
    fn blank_values_never_match() {
        let candidate = score(
            side("sales", "S-1", Some(" "), Some(""), None),
            side("support", "T-1", Some(" "), Some(""), None),
        );
        assert_eq!(candidate.total_score, 0);
        assert_eq!(candidate.decision, MatchDecision::Reject);
    }

    #[test]
    fn zero_email_weight_never_auto_merges() {
        let mut rules = MatchRules::v1();
        rules.email_weight = 0;
        let candidate = score_pair(
            &CandidatePair {
                left: side("sales", "S-1", Some("j@x.com"), Some("1"), None),
                right: side("support", "T-1", Some("j@x.com"), Some("1"), None),
            },
            &rules,
            OffsetDateTime::UNIX_EPOCH,
        );
        assert_eq!(candidate.decision, MatchDecision::FlagReview);
    }

    #[test]
    fn batch_skips_self_pairs() {
        let pairs = vec![
            CandidatePair {
                left: side("sales", "S-1", Some("j@x.com"), None, None),
                right: side("sales", "S-1", Some("j@x.com"), None, None),
            },
            CandidatePair {
                left: side("sales", "S-1", Some("j@x.com"), None, None),
                right: side("support", "T-1", Some("j@x.com"), None, None),
            },
        ];
        let scored = score_pairs(&pairs, &MatchRules::v1(), OffsetDateTime::UNIX_EPOCH);
        let candidates = match scored {
            Ok(value) => value,
            Err(err) => panic!("expected scoring to succeed: {err}"),
        };
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].right_ref, RecordRef::new("support", "T-1"));
    }

    #[test]
    fn batch_rejects_invalid_rules_before_scoring() {
        let mut rules = MatchRules::v1();
        rules.name_similarity_threshold = -0.1;
        let pairs = vec![CandidatePair {
            left: side("sales", "S-1", None, None, None),
            right: side("support", "T-1", None, None, None),
        }];
        assert!(matches!(
            score_pairs(&pairs, &rules, OffsetDateTime::UNIX_EPOCH),
            Err(IdentityError::Configuration(_))
        ));
    }
}

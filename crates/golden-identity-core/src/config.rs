use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::CustomerAttribute;
use crate::IdentityError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NameMetric {
    /// Ratcliff/Obershelp matching-blocks ratio.
    #[default]
    Gestalt,
    /// Normalized Levenshtein similarity.
    Levenshtein,
}

/// Deterministic scoring rules applied to every blocked pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRules {
    pub email_weight: u32,
    pub phone_weight: u32,
    pub name_weight: u32,
    pub name_similarity_threshold: f64,
    pub review_threshold: u32,
    #[serde(default)]
    pub name_metric: NameMetric,
}

impl MatchRules {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            email_weight: 70,
            phone_weight: 70,
            name_weight: 30,
            name_similarity_threshold: 0.85,
            review_threshold: 65,
            name_metric: NameMetric::Gestalt,
        }
    }

    /// Validates weight and threshold bounds.
    ///
    /// # Errors
    /// Returns [`IdentityError::Configuration`] when the similarity
    /// threshold leaves [0.0, 1.0], every weight is zero, or the review
    /// threshold is zero.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if !(0.0..=1.0).contains(&self.name_similarity_threshold) {
            return Err(IdentityError::Configuration(
                "name_similarity_threshold MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        if self.email_weight == 0 && self.phone_weight == 0 && self.name_weight == 0 {
            return Err(IdentityError::Configuration(
                "at least one match weight MUST be > 0".to_string(),
            ));
        }

        if self.review_threshold == 0 {
            return Err(IdentityError::Configuration(
                "review_threshold MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn max_score(&self) -> u32 {
        self.email_weight
            .saturating_add(self.phone_weight)
            .saturating_add(self.name_weight)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SurvivorshipStrategy {
    Priority,
    MostFrequent,
}

impl SurvivorshipStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::MostFrequent => "most_frequent",
        }
    }
}

/// Per-attribute survivorship policy. Passed explicitly to the golden
/// record builder; never held as ambient state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SurvivorshipConfig {
    pub known_sources: Vec<String>,
    #[serde(default)]
    pub priority_map: BTreeMap<CustomerAttribute, Vec<String>>,
    pub strategy_map: BTreeMap<CustomerAttribute, SurvivorshipStrategy>,
}

impl SurvivorshipConfig {
    #[must_use]
    pub fn v1() -> Self {
        let sources = |items: &[&str]| -> Vec<String> {
            items.iter().map(|item| (*item).to_string()).collect()
        };

        let mut priority_map = BTreeMap::new();
        priority_map.insert(
            CustomerAttribute::Email,
            sources(&["sales", "support", "marketing"]),
        );
        priority_map.insert(CustomerAttribute::Phone, sources(&["marketing", "sales"]));

        let mut strategy_map = BTreeMap::new();
        strategy_map.insert(CustomerAttribute::Email, SurvivorshipStrategy::Priority);
        strategy_map.insert(CustomerAttribute::Phone, SurvivorshipStrategy::Priority);
        strategy_map.insert(CustomerAttribute::Name, SurvivorshipStrategy::MostFrequent);

        Self {
            known_sources: sources(&["sales", "support", "marketing"]),
            priority_map,
            strategy_map,
        }
    }

    /// Validates that every attribute has a strategy and that priority
    /// lists only name known source systems.
    ///
    /// # Errors
    /// Returns [`IdentityError::Configuration`] for a missing strategy, an
    /// empty or duplicated priority list, or an unknown source reference.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.known_sources.is_empty() {
            return Err(IdentityError::Configuration(
                "known_sources MUST list at least one source system".to_string(),
            ));
        }

        let known: BTreeSet<&str> = self.known_sources.iter().map(String::as_str).collect();
        if known.len() != self.known_sources.len()
            || known.iter().any(|source| source.trim().is_empty())
        {
            return Err(IdentityError::Configuration(
                "known_sources MUST be unique and non-empty".to_string(),
            ));
        }

        for attribute in CustomerAttribute::ALL {
            let Some(strategy) = self.strategy_map.get(&attribute) else {
                return Err(IdentityError::Configuration(format!(
                    "missing survivorship strategy for attribute {}",
                    attribute.as_str()
                )));
            };

            if *strategy != SurvivorshipStrategy::Priority {
                continue;
            }

            let priority = self.priority_for(attribute);
            if priority.is_empty() {
                return Err(IdentityError::Configuration(format!(
                    "priority strategy for attribute {} requires a non-empty priority list",
                    attribute.as_str()
                )));
            }

            let mut seen = BTreeSet::new();
            for source in priority {
                if !known.contains(source.as_str()) {
                    return Err(IdentityError::Configuration(format!(
                        "priority list for attribute {} references unknown source system {source}",
                        attribute.as_str()
                    )));
                }
                if !seen.insert(source.as_str()) {
                    return Err(IdentityError::Configuration(format!(
                        "priority list for attribute {} repeats source system {source}",
                        attribute.as_str()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Strategy configured for `attribute`.
    ///
    /// # Errors
    /// Returns [`IdentityError::Configuration`] when no strategy is set.
    pub fn strategy_for(
        &self,
        attribute: CustomerAttribute,
    ) -> Result<SurvivorshipStrategy, IdentityError> {
        self.strategy_map.get(&attribute).copied().ok_or_else(|| {
            IdentityError::Configuration(format!(
                "missing survivorship strategy for attribute {}",
                attribute.as_str()
            ))
        })
    }

    #[must_use]
    pub fn priority_for(&self, attribute: CustomerAttribute) -> &[String] {
        self.priority_map
            .get(&attribute)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Audit snapshot stored alongside every golden record.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let mut priority = serde_json::Map::new();
        for (attribute, sources) in &self.priority_map {
            priority.insert(
                attribute.as_str().to_string(),
                Value::from(sources.clone()),
            );
        }

        let mut strategy = serde_json::Map::new();
        for (attribute, value) in &self.strategy_map {
            strategy.insert(
                attribute.as_str().to_string(),
                Value::from(value.as_str()),
            );
        }

        serde_json::json!({
            "priority_map": Value::Object(priority),
            "strategy_map": Value::Object(strategy),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPolicy {
    /// FLAG_REVIEW pairs merge exactly like AUTO_MERGE pairs.
    #[default]
    MergeImmediately,
    /// FLAG_REVIEW pairs become merge proposals and leave the mapping alone.
    ProposeOnly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SurvivorRule {
    /// The id held by the pair's left record survives.
    #[default]
    LeftOperand,
    /// The lowest (oldest) id survives regardless of pair order.
    OldestId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ResolutionConfig {
    #[serde(default)]
    pub review_policy: ReviewPolicy,
    #[serde(default)]
    pub survivor_rule: SurvivorRule,
}

/// Complete engine configuration, as read from a JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub match_rules: MatchRules,
    pub survivorship: SurvivorshipConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
}

impl EngineConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            match_rules: MatchRules::v1(),
            survivorship: SurvivorshipConfig::v1(),
            resolution: ResolutionConfig::default(),
        }
    }

    /// Validates every section.
    ///
    /// # Errors
    /// Returns the first [`IdentityError::Configuration`] found.
    pub fn validate(&self) -> Result<(), IdentityError> {
        self.match_rules.validate()?;
        self.survivorship.validate()
    }

    /// Decodes and validates an engine configuration from JSON.
    ///
    /// # Errors
    /// Returns [`IdentityError::Configuration`] when JSON decoding fails
    /// or decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, IdentityError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            IdentityError::Configuration(format!("invalid engine configuration JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

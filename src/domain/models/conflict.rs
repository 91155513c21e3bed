//! Conflict and resolution models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One source's claim about a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictItem {
    pub source: String,
    pub value: Value,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl ConflictItem {
    pub fn new(source: impl Into<String>, value: Value, confidence: f64) -> Self {
        Self {
            source: source.into(),
            value,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
            reasoning: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn numeric(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Serialized form used for structural equality.
    pub fn value_key(&self) -> String {
        self.value.to_string()
    }
}

/// A detected disagreement between two or more sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub category: String,
    pub items: Vec<ConflictItem>,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(category: impl Into<String>, items: Vec<ConflictItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.into(),
            items,
            detected_at: Utc::now(),
        }
    }

    /// All item values as numbers, or `None` if any is not numeric.
    pub fn numeric_values(&self) -> Option<Vec<f64>> {
        self.items.iter().map(ConflictItem::numeric).collect()
    }

    pub fn sources(&self) -> Vec<String> {
        self.items.iter().map(|i| i.source.clone()).collect()
    }
}

/// Coefficient of variation (population standard deviation over mean).
///
/// A zero mean with any spread is treated as unbounded variation.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if mean.abs() < f64::EPSILON {
        if std_dev < f64::EPSILON {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        std_dev / mean.abs()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    HighestConfidence,
    WeightedAverage,
    MajorityVote,
    MostRecent,
    PrioritySource,
    Consensus,
    AiMediated,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighestConfidence => "highest_confidence",
            Self::WeightedAverage => "weighted_average",
            Self::MajorityVote => "majority_vote",
            Self::MostRecent => "most_recent",
            Self::PrioritySource => "priority_source",
            Self::Consensus => "consensus",
            Self::AiMediated => "ai_mediated",
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub id: Uuid,
    pub conflict_id: Uuid,
    pub category: String,
    pub strategy_requested: ResolutionStrategy,
    /// Strategy that actually produced the value. Differs from the request
    /// when a fallback fired; `None` when a rule decided instead.
    pub strategy_used: Option<ResolutionStrategy>,
    /// Name of the rule that pre-empted the strategy, if any.
    pub rule_applied: Option<String>,
    pub value: Value,
    pub confidence: f64,
    pub contributing_sources: Vec<String>,
    pub considered_sources: Vec<String>,
    pub reasoning: String,
    pub resolved_at: DateTime<Utc>,
}

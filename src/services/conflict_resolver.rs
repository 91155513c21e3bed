//! Conflict detection and resolution.
//!
//! Items disagree when at least two clear the confidence floor and their
//! values differ: numbers by a coefficient of variation above 10%, anything
//! else by serialized inequality. Resolution tries the registered rules in
//! priority order and falls back to the requested strategy.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::conflict::coefficient_of_variation;
use crate::domain::models::{Conflict, ConflictConfig, ConflictItem, Resolution, ResolutionStrategy};
use crate::domain::ports::ConflictMediator;

/// Numeric spread above which values are considered to disagree.
pub const NUMERIC_CONFLICT_CV: f64 = 0.10;

/// Relative tolerance for grouping numbers in `consensus`.
pub const CONSENSUS_TOLERANCE: f64 = 0.05;

/// What a rule or strategy picked.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub value: Value,
    pub confidence: f64,
    pub contributing_sources: Vec<String>,
    pub reasoning: String,
}

impl Selection {
    fn from_item(item: &ConflictItem, reasoning: String) -> Self {
        Self {
            value: item.value.clone(),
            confidence: item.confidence,
            contributing_sources: vec![item.source.clone()],
            reasoning,
        }
    }
}

/// A statically prioritized shortcut that pre-empts the requested strategy.
pub trait ResolutionRule: Send + Sync {
    fn name(&self) -> &str;

    /// Higher runs first.
    fn priority(&self) -> i32;

    /// Categories the rule applies to. Empty means every category.
    fn categories(&self) -> &[String] {
        &[]
    }

    fn select(&self, conflict: &Conflict) -> Option<Selection>;

    fn applies_to(&self, category: &str) -> bool {
        let categories = self.categories();
        categories.is_empty() || categories.iter().any(|c| c == category)
    }
}

/// Exactly one item above the threshold wins outright.
pub struct HighConfidenceSingleSource {
    threshold: f64,
}

impl HighConfidenceSingleSource {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl ResolutionRule for HighConfidenceSingleSource {
    fn name(&self) -> &str {
        "high_confidence_single_source"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn select(&self, conflict: &Conflict) -> Option<Selection> {
        let mut above = conflict
            .items
            .iter()
            .filter(|item| item.confidence > self.threshold);
        let winner = above.next()?;
        if above.next().is_some() {
            return None;
        }
        Some(Selection::from_item(
            winner,
            format!(
                "only {} exceeds confidence {:.2} ({:.2})",
                winner.source, self.threshold, winner.confidence
            ),
        ))
    }
}

/// A configured trusted source wins; among several, the most confident.
pub struct TrustedSource {
    sources: Vec<String>,
}

impl TrustedSource {
    pub fn new(sources: Vec<String>) -> Self {
        Self { sources }
    }
}

impl ResolutionRule for TrustedSource {
    fn name(&self) -> &str {
        "trusted_source"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn select(&self, conflict: &Conflict) -> Option<Selection> {
        let winner = conflict
            .items
            .iter()
            .filter(|item| self.sources.contains(&item.source))
            .reduce(|best, item| if item.confidence > best.confidence { item } else { best })?;
        Some(Selection::from_item(
            winner,
            format!("{} is a trusted source", winner.source),
        ))
    }
}

pub struct ConflictResolver {
    config: ConflictConfig,
    rules: RwLock<Vec<Arc<dyn ResolutionRule>>>,
    mediator: Option<Arc<dyn ConflictMediator>>,
    history: RwLock<Vec<Resolution>>,
}

impl ConflictResolver {
    /// A resolver with the built-in rules.
    pub fn new(config: ConflictConfig) -> Self {
        let rules: Vec<Arc<dyn ResolutionRule>> = vec![
            Arc::new(HighConfidenceSingleSource::new(config.high_confidence_threshold)),
            Arc::new(TrustedSource::new(config.trusted_sources.clone())),
        ];
        Self {
            config,
            rules: RwLock::new(rules),
            mediator: None,
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn with_mediator(mut self, mediator: Arc<dyn ConflictMediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    /// Add a rule while building the resolver.
    pub fn with_rule(mut self, rule: Arc<dyn ResolutionRule>) -> Self {
        let rules = self.rules.get_mut();
        rules.push(rule);
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority()));
        self
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    /// Add a rule. Equal priorities keep registration order.
    pub async fn register_rule(&self, rule: Arc<dyn ResolutionRule>) {
        let mut rules = self.rules.write().await;
        debug!(rule = rule.name(), priority = rule.priority(), "registering resolution rule");
        rules.push(rule);
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority()));
    }

    pub async fn rule_names(&self) -> Vec<String> {
        self.rules
            .read()
            .await
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }

    /// Declare a conflict if the confident items actually disagree.
    pub fn detect(&self, category: &str, items: Vec<ConflictItem>) -> Option<Conflict> {
        let eligible: Vec<ConflictItem> = items
            .into_iter()
            .filter(|item| item.confidence >= self.config.min_confidence)
            .collect();
        if eligible.len() < 2 {
            return None;
        }

        let conflict = Conflict::new(category, eligible);
        let disagree = match conflict.numeric_values() {
            Some(values) => coefficient_of_variation(&values) > NUMERIC_CONFLICT_CV,
            None => {
                let first = conflict.items[0].value_key();
                conflict.items.iter().any(|item| item.value_key() != first)
            }
        };
        disagree.then_some(conflict)
    }

    /// Detect and resolve in one call. `None` when there is no conflict.
    pub async fn reconcile(
        &self,
        category: &str,
        items: Vec<ConflictItem>,
        strategy: Option<ResolutionStrategy>,
    ) -> DomainResult<Option<Resolution>> {
        match self.detect(category, items) {
            Some(conflict) => self.resolve(&conflict, strategy).await.map(Some),
            None => Ok(None),
        }
    }

    /// Resolve a conflict. Without an explicit strategy the configured
    /// default applies. A matching rule always wins over the strategy.
    pub async fn resolve(
        &self,
        conflict: &Conflict,
        strategy: Option<ResolutionStrategy>,
    ) -> DomainResult<Resolution> {
        if conflict.items.is_empty() {
            return Err(DomainError::ValidationFailed(format!(
                "conflict {} has no items",
                conflict.id
            )));
        }
        let requested = strategy.unwrap_or(self.config.default_strategy);

        let rule_match = {
            let rules = self.rules.read().await;
            rules
                .iter()
                .filter(|rule| rule.applies_to(&conflict.category))
                .find_map(|rule| rule.select(conflict).map(|s| (rule.name().to_string(), s)))
        };

        let (strategy_used, rule_applied, selection) = match rule_match {
            Some((rule, selection)) => (None, Some(rule), selection),
            None => {
                let (used, selection) = self.apply_strategy(conflict, requested).await;
                (Some(used), None, selection)
            }
        };

        let resolution = Resolution {
            id: Uuid::new_v4(),
            conflict_id: conflict.id,
            category: conflict.category.clone(),
            strategy_requested: requested,
            strategy_used,
            rule_applied,
            value: selection.value,
            confidence: selection.confidence.clamp(0.0, 1.0),
            contributing_sources: selection.contributing_sources,
            considered_sources: conflict.sources(),
            reasoning: selection.reasoning,
            resolved_at: Utc::now(),
        };

        info!(
            conflict_id = %conflict.id,
            category = %conflict.category,
            requested = %requested,
            used = resolution.strategy_used.map_or("rule", |s| s.as_str()),
            rule = resolution.rule_applied.as_deref().unwrap_or("none"),
            confidence = resolution.confidence,
            "conflict resolved"
        );

        self.history.write().await.push(resolution.clone());
        Ok(resolution)
    }

    /// Every resolution made by this resolver, oldest first.
    pub async fn history(&self) -> Vec<Resolution> {
        self.history.read().await.clone()
    }

    pub async fn history_for(&self, category: &str) -> Vec<Resolution> {
        self.history
            .read()
            .await
            .iter()
            .filter(|r| r.category == category)
            .cloned()
            .collect()
    }

    async fn apply_strategy(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
    ) -> (ResolutionStrategy, Selection) {
        match strategy {
            ResolutionStrategy::HighestConfidence => (strategy, highest_confidence(conflict)),
            ResolutionStrategy::WeightedAverage => weighted_average(conflict),
            ResolutionStrategy::MajorityVote => (strategy, majority_vote(conflict)),
            ResolutionStrategy::MostRecent => (strategy, most_recent(conflict)),
            ResolutionStrategy::PrioritySource => self.priority_source(conflict),
            ResolutionStrategy::Consensus => (strategy, consensus(conflict)),
            ResolutionStrategy::AiMediated => self.mediated(conflict).await,
        }
    }

    fn priority_source(&self, conflict: &Conflict) -> (ResolutionStrategy, Selection) {
        let priorities = &self.config.source_priorities;
        let ranked = conflict
            .items
            .iter()
            .filter_map(|item| priorities.get(&item.source).map(|p| (*p, item)))
            .reduce(|best, next| {
                if next.0 > best.0 || (next.0 == best.0 && next.1.confidence > best.1.confidence) {
                    next
                } else {
                    best
                }
            });

        match ranked {
            Some((priority, item)) => (
                ResolutionStrategy::PrioritySource,
                Selection::from_item(
                    item,
                    format!("{} has the highest source priority ({priority})", item.source),
                ),
            ),
            None => {
                debug!(conflict_id = %conflict.id, "no prioritized source, using highest confidence");
                (ResolutionStrategy::HighestConfidence, highest_confidence(conflict))
            }
        }
    }

    async fn mediated(&self, conflict: &Conflict) -> (ResolutionStrategy, Selection) {
        let Some(mediator) = &self.mediator else {
            debug!(conflict_id = %conflict.id, "no mediator configured, using weighted average");
            return weighted_average(conflict);
        };
        match mediator.mediate(conflict).await {
            Ok(mediated) => (
                ResolutionStrategy::AiMediated,
                Selection {
                    value: mediated.value,
                    confidence: mediated.confidence,
                    contributing_sources: mediated.contributing_sources,
                    reasoning: mediated.reasoning,
                },
            ),
            Err(e) => {
                warn!(conflict_id = %conflict.id, error = %e, "mediation failed, using weighted average");
                weighted_average(conflict)
            }
        }
    }
}

// ============================================================================
// Strategies
// ============================================================================

fn highest_confidence(conflict: &Conflict) -> Selection {
    let winner = conflict
        .items
        .iter()
        .reduce(|best, item| if item.confidence > best.confidence { item } else { best });
    match winner {
        Some(item) => Selection::from_item(
            item,
            format!("{} has the highest confidence ({:.2})", item.source, item.confidence),
        ),
        None => empty_selection(),
    }
}

/// Confidence-weighted mean. Non-numeric values fall back to highest
/// confidence.
fn weighted_average(conflict: &Conflict) -> (ResolutionStrategy, Selection) {
    let Some(values) = conflict.numeric_values() else {
        return (ResolutionStrategy::HighestConfidence, highest_confidence(conflict));
    };
    let n = values.len() as f64;
    let total_weight: f64 = conflict.items.iter().map(|i| i.confidence).sum();
    let mean = if total_weight > 0.0 {
        values
            .iter()
            .zip(&conflict.items)
            .map(|(v, item)| v * item.confidence)
            .sum::<f64>()
            / total_weight
    } else {
        values.iter().sum::<f64>() / n
    };

    (
        ResolutionStrategy::WeightedAverage,
        Selection {
            value: Value::from(mean),
            confidence: total_weight / n,
            contributing_sources: conflict.sources(),
            reasoning: format!("confidence-weighted mean of {} values", values.len()),
        },
    )
}

/// Plurality by serialized value. Ties go to the larger summed confidence,
/// then to the value seen first.
fn majority_vote(conflict: &Conflict) -> Selection {
    let mut order: Vec<String> = Vec::new();
    let mut tallies: HashMap<String, Vec<&ConflictItem>> = HashMap::new();
    for item in &conflict.items {
        let key = item.value_key();
        if !tallies.contains_key(&key) {
            order.push(key.clone());
        }
        tallies.entry(key).or_default().push(item);
    }

    let summed = |voters: &[&ConflictItem]| voters.iter().map(|i| i.confidence).sum::<f64>();
    let mut winner: Option<&Vec<&ConflictItem>> = None;
    for key in &order {
        let voters = &tallies[key];
        let better = match winner {
            None => true,
            Some(best) => {
                voters.len() > best.len()
                    || (voters.len() == best.len() && summed(voters) > summed(best))
            }
        };
        if better {
            winner = Some(voters);
        }
    }

    let Some(voters) = winner else { return empty_selection() };
    let share = voters.len() as f64 / conflict.items.len() as f64;
    let top = voters.iter().map(|i| i.confidence).fold(0.0, f64::max);
    Selection {
        value: voters[0].value.clone(),
        confidence: share * top,
        contributing_sources: voters.iter().map(|i| i.source.clone()).collect(),
        reasoning: format!(
            "{} of {} sources agree on {}",
            voters.len(),
            conflict.items.len(),
            voters[0].value
        ),
    }
}

fn most_recent(conflict: &Conflict) -> Selection {
    let winner = conflict.items.iter().reduce(|best, item| {
        if item.timestamp > best.timestamp
            || (item.timestamp == best.timestamp && item.confidence > best.confidence)
        {
            item
        } else {
            best
        }
    });
    match winner {
        Some(item) => Selection::from_item(
            item,
            format!("{} reported most recently ({})", item.source, item.timestamp.to_rfc3339()),
        ),
        None => empty_selection(),
    }
}

fn near_equal(a: &ConflictItem, b: &ConflictItem) -> bool {
    match (a.numeric(), b.numeric()) {
        (Some(x), Some(y)) => {
            let scale = x.abs().max(y.abs());
            scale == 0.0 || (x - y).abs() <= CONSENSUS_TOLERANCE * scale
        }
        _ => a.value_key() == b.value_key(),
    }
}

/// Greedy clustering against each cluster's first member; the most
/// confident member of the largest cluster wins, scaled by cluster share.
fn consensus(conflict: &Conflict) -> Selection {
    let mut clusters: Vec<Vec<&ConflictItem>> = Vec::new();
    for item in &conflict.items {
        match clusters.iter_mut().find(|c| near_equal(c[0], item)) {
            Some(cluster) => cluster.push(item),
            None => clusters.push(vec![item]),
        }
    }

    let summed = |c: &[&ConflictItem]| c.iter().map(|i| i.confidence).sum::<f64>();
    let largest = clusters.iter().reduce(|best, c| {
        if c.len() > best.len() || (c.len() == best.len() && summed(c) > summed(best)) {
            c
        } else {
            best
        }
    });

    let Some(cluster) = largest else { return empty_selection() };
    let Some(representative) = cluster
        .iter()
        .copied()
        .reduce(|best, item| if item.confidence > best.confidence { item } else { best })
    else {
        return empty_selection();
    };
    let share = cluster.len() as f64 / conflict.items.len() as f64;
    Selection {
        value: representative.value.clone(),
        confidence: representative.confidence * share,
        contributing_sources: cluster.iter().map(|i| i.source.clone()).collect(),
        reasoning: format!(
            "{} of {} sources form the largest agreeing cluster",
            cluster.len(),
            conflict.items.len()
        ),
    }
}

fn empty_selection() -> Selection {
    Selection {
        value: Value::Null,
        confidence: 0.0,
        contributing_sources: Vec::new(),
        reasoning: "no items to choose from".to_string(),
    }
}

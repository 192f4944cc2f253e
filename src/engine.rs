//! Suggestion retrieval: a three-tier cascade and a multi-factor re-ranker.
//!
//! Tiers run in a fixed order and later tiers only run while the result is
//! still short of `max_suggestions`:
//!
//! 1. exact prefix over successful history,
//! 2. semantic neighbours from the similarity index,
//! 3. commands that habitually follow the previous one.
//!
//! A tier never fails the whole request. Its [`TierOutcome`] says whether it
//! produced hits, did not apply, had no provider to ask, or errored.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::embedding::EmbeddingProvider;
use crate::index::SimilarityIndex;
use crate::store::{CommandStore, CommandUsage};
use crate::util::{epoch_now, is_parent_or_child, SECONDS_PER_DAY};

pub const DEFAULT_CONTEXT_WINDOW: usize = 10;

const PREFIX_SATURATION: f64 = 10.0;
const FOLLOW_SATURATION: f64 = 5.0;
/// Ceiling for contextual confidence.
const FOLLOW_CAP: f64 = 0.8;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSource {
    ExactPrefix,
    Semantic,
    ContextualPattern,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub command: String,
    pub confidence: f64,
    pub source: SuggestionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RankedSuggestion {
    #[serde(flatten)]
    pub suggestion: Suggestion,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    ExactPrefix,
    Semantic,
    ContextualPattern,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::ExactPrefix => "exact_prefix",
            Tier::Semantic => "semantic",
            Tier::ContextualPattern => "contextual_pattern",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TierOutcome {
    Hits(Vec<Suggestion>),
    /// The tier does not apply to this request.
    Skipped(&'static str),
    /// A collaborator the tier needs is missing or not ready.
    Unavailable(String),
    Failed(String),
}

impl TierOutcome {
    fn hits(self) -> Vec<Suggestion> {
        match self {
            TierOutcome::Hits(hits) => hits,
            _ => Vec::new(),
        }
    }
}

/// What the cascade returned and why.
#[derive(Debug, Clone, Default)]
pub struct CascadeReport {
    pub suggestions: Vec<Suggestion>,
    pub tiers: Vec<(Tier, TierOutcome)>,
}

impl CascadeReport {
    pub fn outcome(&self, tier: Tier) -> Option<&TierOutcome> {
        self.tiers.iter().find(|(t, _)| *t == tier).map(|(_, o)| o)
    }
}

pub struct SuggestionEngine {
    store: Arc<CommandStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    index: Option<Arc<dyn SimilarityIndex>>,
    max_suggestions: usize,
    min_confidence: f64,
}

impl SuggestionEngine {
    pub fn new(store: Arc<CommandStore>, max_suggestions: usize, min_confidence: f64) -> Self {
        SuggestionEngine {
            store,
            embedder: None,
            index: None,
            max_suggestions: max_suggestions.max(1),
            min_confidence,
        }
    }

    pub fn with_semantic(
        mut self,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn SimilarityIndex>,
    ) -> Self {
        self.embedder = Some(embedder);
        self.index = Some(index);
        self
    }

    pub fn max_suggestions(&self) -> usize {
        self.max_suggestions
    }

    pub fn get_suggestions(
        &self,
        partial: &str,
        cwd: Option<&str>,
        history: &[String],
        context_window: usize,
    ) -> Vec<Suggestion> {
        self.cascade(partial, cwd, history, context_window).suggestions
    }

    pub fn cascade(
        &self,
        partial: &str,
        cwd: Option<&str>,
        history: &[String],
        context_window: usize,
    ) -> CascadeReport {
        let history = &history[history.len().saturating_sub(context_window)..];
        let mut report = CascadeReport::default();
        let mut seen = HashSet::new();
        let mut collected = Vec::new();

        for tier in [Tier::ExactPrefix, Tier::Semantic, Tier::ContextualPattern] {
            if collected.len() >= self.max_suggestions {
                break;
            }
            let outcome = match tier {
                Tier::ExactPrefix => self.exact_prefix(partial, cwd),
                Tier::Semantic => self.semantic(partial, cwd, history),
                Tier::ContextualPattern => self.contextual(partial, history),
            };
            match &outcome {
                TierOutcome::Hits(hits) => debug!(%tier, hits = hits.len(), "Tier produced hits"),
                TierOutcome::Skipped(why) => debug!(%tier, reason = why, "Tier skipped"),
                TierOutcome::Unavailable(why) => debug!(%tier, reason = %why, "Tier unavailable"),
                TierOutcome::Failed(err) => debug!(%tier, error = %err, "Tier failed"),
            }
            for s in outcome.clone().hits() {
                if s.confidence >= self.min_confidence && seen.insert(s.command.clone()) {
                    collected.push(s);
                }
            }
            report.tiers.push((tier, outcome));
        }

        // stable, so ties keep tier order
        collected.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        collected.truncate(self.max_suggestions);
        report.suggestions = collected;
        report
    }

    fn exact_prefix(&self, partial: &str, cwd: Option<&str>) -> TierOutcome {
        if partial.trim().is_empty() {
            return TierOutcome::Skipped("empty partial");
        }
        match self.store.prefix_matches(partial, cwd, self.max_suggestions) {
            Ok(rows) => TierOutcome::Hits(
                rows.into_iter()
                    .map(|row| Suggestion {
                        confidence: (row.frequency as f64 / PREFIX_SATURATION).min(1.0),
                        command: row.command,
                        source: SuggestionSource::ExactPrefix,
                        frequency: Some(row.frequency),
                    })
                    .collect(),
            ),
            Err(err) => TierOutcome::Failed(format!("{:#}", err)),
        }
    }

    fn semantic(&self, partial: &str, cwd: Option<&str>, history: &[String]) -> TierOutcome {
        if partial.trim().is_empty() {
            return TierOutcome::Skipped("empty partial");
        }
        let (embedder, index) = match (&self.embedder, &self.index) {
            (Some(embedder), Some(index)) => (embedder, index),
            _ => return TierOutcome::Unavailable("no embedding provider".to_string()),
        };
        if !index.is_built() {
            return TierOutcome::Unavailable("similarity index not built".to_string());
        }

        let query = match embedder.encode_context(cwd, history, partial) {
            Ok(query) => query,
            Err(err) => return TierOutcome::Failed(err.to_string()),
        };
        match index.search(&query, 2 * self.max_suggestions) {
            Ok(hits) => TierOutcome::Hits(
                hits.into_iter()
                    .map(|hit| Suggestion {
                        command: hit.command,
                        confidence: f64::from(hit.similarity).clamp(0.0, 1.0),
                        source: SuggestionSource::Semantic,
                        frequency: Some(i64::from(hit.metadata.frequency)),
                    })
                    .collect(),
            ),
            Err(err) => TierOutcome::Failed(err.to_string()),
        }
    }

    fn contextual(&self, partial: &str, history: &[String]) -> TierOutcome {
        let anchor = match history.last() {
            Some(anchor) if !anchor.trim().is_empty() => anchor,
            _ => return TierOutcome::Skipped("no history"),
        };
        let prefix = Some(partial).filter(|p| !p.trim().is_empty());
        match self
            .store
            .following_commands(anchor, prefix, self.max_suggestions)
        {
            Ok(rows) => TierOutcome::Hits(
                rows.into_iter()
                    .map(|row| Suggestion {
                        confidence: (row.frequency as f64 / FOLLOW_SATURATION).min(FOLLOW_CAP),
                        command: row.command,
                        source: SuggestionSource::ContextualPattern,
                        frequency: Some(row.frequency),
                    })
                    .collect(),
            ),
            Err(err) => TierOutcome::Failed(format!("{:#}", err)),
        }
    }

    /// Re-order by confidence weighted with recency, directory affinity,
    /// success rate and overall frequency.
    pub fn rank_suggestions(
        &self,
        suggestions: Vec<Suggestion>,
        current_cwd: Option<&str>,
    ) -> Vec<RankedSuggestion> {
        let now = epoch_now();
        let mut ranked: Vec<RankedSuggestion> = suggestions
            .into_iter()
            .map(|suggestion| {
                let usage = self
                    .store
                    .command_usage(&suggestion.command)
                    .unwrap_or_else(|err| {
                        debug!(command = %suggestion.command, error = %err, "No usage stats for ranking");
                        CommandUsage::default()
                    });
                let score = combined_score(suggestion.confidence, &usage, current_cwd, now);
                RankedSuggestion { suggestion, score }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }
}

pub fn combined_score(base: f64, usage: &CommandUsage, cwd: Option<&str>, now: f64) -> f64 {
    base * recency_factor(usage.last_used, now)
        * directory_boost(cwd, &usage.directories)
        * success_factor(usage.success_rate())
        * frequency_factor(usage.total_frequency)
}

pub fn recency_factor(last_used: Option<f64>, now: f64) -> f64 {
    match last_used {
        Some(ts) => {
            let days = ((now - ts) / SECONDS_PER_DAY).max(0.0);
            (-0.1 * days).exp()
        }
        None => 0.5,
    }
}

pub fn directory_boost(cwd: Option<&str>, directories: &[String]) -> f64 {
    let cwd = match cwd {
        Some(cwd) => cwd,
        None => return 1.0,
    };
    if directories.iter().any(|d| d == cwd) {
        2.0
    } else if directories.iter().any(|d| is_parent_or_child(cwd, d)) {
        1.5
    } else {
        1.0
    }
}

pub fn success_factor(success_rate: Option<f64>) -> f64 {
    success_rate.map(|rate| rate * rate).unwrap_or(1.0)
}

pub fn frequency_factor(total_frequency: i64) -> f64 {
    ((total_frequency.max(0) + 1) as f64).ln()
}

pub fn explain_suggestion(suggestion: &Suggestion) -> String {
    let reason = match suggestion.source {
        SuggestionSource::ExactPrefix => "Exact match from your history",
        SuggestionSource::Semantic => "Similar command based on meaning",
        SuggestionSource::ContextualPattern => "Often used after previous command",
        SuggestionSource::Unknown => "Suggested from your command history",
    };
    format!(
        "{} ({:.0}% confidence)",
        reason,
        suggestion.confidence * 100.0
    )
}

//! Persisted record kinds.

use crate::category::Category;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Current living summary for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistilledState {
    pub category: Category,
    pub content: String,
    #[serde(default)]
    pub last_observation_id: Option<String>,
    #[serde(default)]
    pub observation_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl DistilledState {
    pub fn default_for(category: Category, now: DateTime<Utc>) -> Self {
        Self {
            category,
            content: category.default_content(),
            last_observation_id: None,
            observation_count: 0,
            updated_at: now,
        }
    }

    pub fn is_default(&self) -> bool {
        self.observation_count == 0 && self.category.is_default_content(&self.content)
    }
}

/// Proof that an observation has been folded in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestionRecord {
    pub observation_id: String,
    #[serde(default)]
    pub categories: BTreeSet<Category>,
    pub digested_at: DateTime<Utc>,
}

impl DigestionRecord {
    pub fn breadth(&self) -> usize {
        self.categories.len()
    }
}

/// How little a past observation currently matters (0 = fresh, 1 = faded)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalenessAnnotation {
    pub observation_id: String,
    pub score: f64,
    pub last_consolidated_at: DateTime<Utc>,
}

/// A recurring theme surfaced by consolidation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub pattern: String,
    pub frequency: u32,
    #[serde(default)]
    pub category: Option<Category>,
    pub significance: String,
}

/// One consolidation pass. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationRun {
    pub id: Uuid,
    pub ran_at: DateTime<Utc>,
    pub patterns_detected: usize,
    pub strengthened: usize,
    pub faded: usize,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub patterns: Vec<DetectedPattern>,
    pub duration_ms: u64,
    /// (year, month) captured by this run's snapshot trigger
    #[serde(default)]
    pub snapshot: Option<(i32, u32)>,
    /// Sub-steps that failed, with their error messages
    #[serde(default)]
    pub step_errors: Vec<(String, String)>,
}

/// A sample observation kept with a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyObservation {
    pub observation_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub categories: BTreeSet<Category>,
}

/// Archived copy of one category's summary for one calendar month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub category: Category,
    pub year: i32,
    pub month: u32,
    pub content: String,
    pub observation_count: u64,
    #[serde(default)]
    pub key_observations: Vec<KeyObservation>,
    pub captured_at: DateTime<Utc>,
}

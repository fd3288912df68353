//! Observation source: the raw, append-only log distillation reads from.
//!
//! Capture itself belongs to the caller. This module only defines how the
//! engine reads observations back, plus two stores: a JSONL file (one
//! observation per line, `observations.jsonl`) and an in-memory list.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

/// One free-text observation. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(id: impl Into<String>, text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            created_at,
        }
    }
}

#[async_trait]
pub trait ObservationSource: Send + Sync {
    /// Every observation, ascending by `created_at` (ties by id).
    async fn all(&self) -> Result<Vec<Observation>>;

    /// Observations with `start <= created_at < end`, ascending.
    async fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Observation>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|o| o.created_at >= start && o.created_at < end)
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Observation>> {
        Ok(self.all().await?.into_iter().find(|o| o.id == id))
    }
}

fn sort_ascending(observations: &mut [Observation]) {
    observations.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Observations held in memory
#[derive(Debug, Default)]
pub struct InMemoryObservations {
    items: RwLock<Vec<Observation>>,
}

impl InMemoryObservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<Observation>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    pub async fn push(&self, observation: Observation) {
        self.items.write().await.push(observation);
    }
}

#[async_trait]
impl ObservationSource for InMemoryObservations {
    async fn all(&self) -> Result<Vec<Observation>> {
        let mut items = self.items.read().await.clone();
        sort_ascending(&mut items);
        Ok(items)
    }
}

/// Append-only JSONL observation log
#[derive(Debug, Clone)]
pub struct JsonlObservationLog {
    path: PathBuf,
}

impl JsonlObservationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one observation. Returns once the line is flushed to disk.
    pub async fn append(&self, observation: &Observation) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(observation)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ObservationSource for JsonlObservationLog {
    async fn all(&self) -> Result<Vec<Observation>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).await?;

        let mut observations = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Observation>(line) {
                Ok(observation) => observations.push(observation),
                Err(e) => warn!(
                    "Skipping malformed observation at {:?}:{}: {}",
                    self.path,
                    index + 1,
                    e
                ),
            }
        }
        sort_ascending(&mut observations);
        Ok(observations)
    }
}

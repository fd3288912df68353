//! Consolidation ("sleep") pass.
//!
//! Periodic, offline housekeeping over recent and old observations:
//!   a. detect recurring patterns in the trailing window
//!   b. strengthen recent observations that touched several categories
//!   c. re-score staleness of old observations
//!   d. write a digest of the current summaries
//!   e. capture the last closed month's snapshot if it is missing
//!
//! Each step fails on its own: an error is logged and recorded in the run's
//! `step_errors`, and the remaining steps still execute. A run record is
//! appended whatever happened.

mod patterns;

pub use patterns::parse_patterns;

use crate::archive::{CaptureOutcome, SnapshotArchive};
use crate::category::Category;
use crate::clock::Clock;
use crate::config::ConsolidationConfig;
use crate::observations::{Observation, ObservationSource};
use crate::oracle::TextOracle;
use crate::store::{ConsolidationRun, DetectedPattern, StalenessAnnotation, Store};
use crate::{DistillError, Result};
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Digest text recorded when the window is too thin to consolidate
pub fn insufficient_digest(found: usize, window_days: i64, needed: usize) -> String {
    format!(
        "Insufficient data: {found} observation(s) in the last {window_days} days; \
         at least {needed} are needed to consolidate."
    )
}

pub struct Consolidator {
    store: Arc<Store>,
    source: Arc<dyn ObservationSource>,
    oracle: Arc<dyn TextOracle>,
    clock: Arc<dyn Clock>,
    archive: Arc<SnapshotArchive>,
    config: ConsolidationConfig,
    running: Mutex<()>,
}

/// Collects per-step failures without aborting the run
#[derive(Default)]
struct StepErrors(Vec<(String, String)>);

impl StepErrors {
    fn record(&mut self, step: &str, error: &DistillError) {
        warn!(step, "Consolidation step failed: {}", error);
        self.0.push((step.to_string(), error.to_string()));
    }
}

impl Consolidator {
    pub fn new(
        store: Arc<Store>,
        source: Arc<dyn ObservationSource>,
        oracle: Arc<dyn TextOracle>,
        clock: Arc<dyn Clock>,
        archive: Arc<SnapshotArchive>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            store,
            source,
            oracle,
            clock,
            archive,
            config,
            running: Mutex::new(()),
        }
    }

    /// Run one consolidation pass.
    ///
    /// Fails fast with [`DistillError::ConsolidationInProgress`] if another
    /// pass is active. Otherwise only a failure to append the run record is
    /// returned as `Err`.
    pub async fn run_consolidation(&self) -> Result<ConsolidationRun> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(DistillError::ConsolidationInProgress);
        };

        let started = Instant::now();
        let now = self.clock.now();
        let mut errors = StepErrors::default();
        info!("Consolidation started");

        // Pick up commits made by other processes since the last pass
        if let Err(e) = self.store.refresh().await {
            errors.record("load", &e);
        }
        let observations = match self.source.all().await {
            Ok(all) => all,
            Err(e) => {
                errors.record("load", &e);
                Vec::new()
            }
        };
        let window_start = now - Duration::days(self.config.window_days);
        let window: Vec<&Observation> = observations
            .iter()
            .filter(|o| o.created_at > window_start && o.created_at <= now)
            .collect();
        let enough = window.len() >= self.config.min_observations;

        // a. patterns
        let patterns = if enough {
            match self.detect_patterns(&window).await {
                Ok(found) => found,
                Err(e) => {
                    errors.record("patterns", &e);
                    Vec::new()
                }
            }
        } else {
            debug!(
                "Only {} observations in window, skipping pattern detection",
                window.len()
            );
            Vec::new()
        };

        // b. strengthening
        let strengthened = match self.strengthen(&window, now).await {
            Ok(n) => n,
            Err(e) => {
                errors.record("strengthen", &e);
                0
            }
        };

        // c. stale-marking
        let faded = match self.mark_stale(&observations, now).await {
            Ok(n) => n,
            Err(e) => {
                errors.record("stale", &e);
                0
            }
        };

        // d. digest
        let digest = if enough {
            match self.write_digest(&patterns, window.len()).await {
                Ok(text) => Some(text),
                Err(e) => {
                    errors.record("digest", &e);
                    None
                }
            }
        } else {
            Some(insufficient_digest(
                window.len(),
                self.config.window_days,
                self.config.min_observations,
            ))
        };

        // e. snapshot trigger
        let snapshot = match self.snapshot_closed_month().await {
            Ok(captured) => captured,
            Err(e) => {
                errors.record("snapshot", &e);
                None
            }
        };

        let run = ConsolidationRun {
            id: Uuid::new_v4(),
            ran_at: now,
            patterns_detected: patterns.len(),
            strengthened,
            faded,
            digest,
            patterns,
            duration_ms: started.elapsed().as_millis() as u64,
            snapshot,
            step_errors: errors.0,
        };
        self.store.append_run(run.clone()).await?;

        info!(
            "Consolidation finished in {}ms: {} patterns, {} strengthened, {} faded, {} step errors",
            run.duration_ms,
            run.patterns_detected,
            run.strengthened,
            run.faded,
            run.step_errors.len()
        );
        Ok(run)
    }

    /// Run consolidation every `every` until `shutdown` resolves.
    /// The first pass runs immediately.
    pub async fn run_schedule(
        &self,
        every: std::time::Duration,
        shutdown: impl Future<Output = ()>,
    ) -> usize {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut completed = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Consolidation schedule stopped after {} runs", completed);
                    return completed;
                }
                _ = interval.tick() => {
                    match self.run_consolidation().await {
                        Ok(_) => completed += 1,
                        Err(e) => warn!("Scheduled consolidation failed: {}", e),
                    }
                }
            }
        }
    }

    pub async fn runs(&self) -> Vec<ConsolidationRun> {
        if let Err(e) = self.store.refresh().await {
            warn!("Listing cached runs, refresh failed: {}", e);
        }
        self.store.runs().await
    }

    // ── Steps ──────────────────────────────────────────────────────

    async fn detect_patterns(&self, window: &[&Observation]) -> Result<Vec<DetectedPattern>> {
        let lines = window
            .iter()
            .map(|o| format!("[{}] {}", o.created_at.format("%Y-%m-%d"), o.text))
            .collect::<Vec<_>>()
            .join("\n");
        let categories = Category::ALL
            .iter()
            .map(Category::as_str)
            .collect::<Vec<_>>()
            .join(", ");

        let prompt = format!(
            r#"Below are observations from the last {days} days, oldest first.

{lines}

List recurring patterns or themes (things that happen at least twice).
One per line, in exactly this format:
pattern | frequency | category | significance
where category is one of: {categories}
If there are no recurring patterns, output nothing."#,
            days = self.config.window_days,
        );

        let response = self.oracle.generate(&prompt).await?;
        let patterns = parse_patterns(&response);
        debug!("Detected {} patterns", patterns.len());
        Ok(patterns)
    }

    async fn strengthen(&self, window: &[&Observation], now: DateTime<Utc>) -> Result<usize> {
        let mut annotations = Vec::new();
        for observation in window {
            let Some(record) = self.store.ledger_get(&observation.id).await else {
                continue;
            };
            if record.breadth() < 2 && !record.categories.contains(&self.config.high_salience) {
                continue;
            }
            let current = self
                .store
                .staleness(&observation.id)
                .await
                .map_or(0.0, |a| a.score);
            annotations.push(StalenessAnnotation {
                observation_id: observation.id.clone(),
                score: (current - self.config.strengthen_step).max(0.0),
                last_consolidated_at: now,
            });
        }
        let count = annotations.len();
        self.store.write_staleness(annotations).await?;
        Ok(count)
    }

    async fn mark_stale(&self, observations: &[Observation], now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(self.config.stale_after_days);
        let mut annotations = Vec::new();
        for observation in observations.iter().filter(|o| o.created_at < cutoff) {
            let breadth = self
                .store
                .ledger_get(&observation.id)
                .await
                .map_or(0, |r| r.breadth());
            annotations.push(StalenessAnnotation {
                observation_id: observation.id.clone(),
                score: staleness_score(
                    observation.created_at,
                    now,
                    breadth,
                    self.config.fade_horizon_days,
                ),
                last_consolidated_at: now,
            });
        }
        let count = annotations.len();
        self.store.write_staleness(annotations).await?;
        Ok(count)
    }

    async fn write_digest(&self, patterns: &[DetectedPattern], window_count: usize) -> Result<String> {
        let summaries = self
            .store
            .read_all()
            .await
            .into_values()
            .map(|s| format!("=== {} ===\n{}", s.category, s.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let pattern_lines = if patterns.is_empty() {
            "(none detected)".to_string()
        } else {
            patterns
                .iter()
                .map(|p| format!("- {} (x{}): {}", p.pattern, p.frequency, p.significance))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            r#"Write a short digest (three to six sentences) of where things stand.

{summaries}

=== Recurring patterns ===
{pattern_lines}

{window_count} observations were recorded in the last {days} days.
Output ONLY the digest."#,
            days = self.config.window_days,
        );
        let digest = self.oracle.generate(&prompt).await?;
        let digest = digest.trim();
        if digest.is_empty() {
            return Err(DistillError::Oracle("empty digest reply".to_string()));
        }
        Ok(digest.to_string())
    }

    async fn snapshot_closed_month(&self) -> Result<Option<(i32, u32)>> {
        let (year, month) = self.clock.previous_month();
        if self.store.has_snapshot_for(year, month).await {
            return Ok(None);
        }
        match self.archive.capture(year, month).await? {
            CaptureOutcome::Captured { .. } => Ok(Some((year, month))),
            CaptureOutcome::Protected => Ok(None),
        }
    }
}

/// `min(1, age / horizon) / (1 + 0.5 * breadth)`, clamped to [0, 1]
pub fn staleness_score(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    breadth: usize,
    fade_horizon_days: i64,
) -> f64 {
    let age_days = (now - created_at).num_seconds() as f64 / 86_400.0;
    let horizon = fade_horizon_days.max(1) as f64;
    let age_factor = (age_days / horizon).min(1.0);
    (age_factor / (1.0 + 0.5 * breadth as f64)).clamp(0.0, 1.0)
}

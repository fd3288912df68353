//! Monthly snapshot archive and temporal queries.
//!
//! A snapshot freezes each category's live summary for one calendar month.
//! Queries resolve a (category, month) pair to the live row for the current
//! month and to the archived row otherwise; nothing here ever writes live
//! state. Every entry point refreshes the store first, so a long-lived
//! archive sees what other processes committed since it was opened.

use crate::category::Category;
use crate::clock::Clock;
use crate::config::ArchiveConfig;
use crate::observations::ObservationSource;
use crate::oracle::TextOracle;
use crate::store::{DistilledState, KeyObservation, Snapshot, Store};
use crate::{DistillError, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A calendar month
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(DistillError::InvalidPeriod(format!(
                "month must be 1-12, got {month}"
            )));
        }
        if !(1970..=9999).contains(&year) {
            return Err(DistillError::InvalidPeriod(format!("year out of range: {year}")));
        }
        Ok(Self { year, month })
    }

    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self { year: self.year - 1, month: 12 }
        } else {
            Self { year: self.year, month: self.month - 1 }
        }
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    /// Half-open UTC bounds `[first instant, first instant of next month)`
    pub fn bounds(self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = month_start(self)?;
        let end = month_start(self.next())?;
        Ok((start, end))
    }
}

fn month_start(period: Period) -> Result<DateTime<Utc>> {
    Utc.with_ymd_and_hms(period.year, period.month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| DistillError::InvalidPeriod(period.to_string()))
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = DistillError;

    /// Parses `YYYY-MM`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DistillError::InvalidPeriod(format!("expected YYYY-MM, got {s:?}"));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl From<(i32, u32)> for Period {
    fn from((year, month): (i32, u32)) -> Self {
        Self { year, month }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured { rows: usize, replaced: usize },
    /// Closed month already archived and protection is on
    Protected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recall {
    Live(DistilledState),
    Archived(Snapshot),
    NotFound,
}

impl Recall {
    pub fn content(&self) -> Option<&str> {
        match self {
            Recall::Live(state) => Some(&state.content),
            Recall::Archived(snapshot) => Some(&snapshot.content),
            Recall::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Delta {
        category: Category,
        from: Period,
        to: Period,
        narrative: String,
    },
    /// At least one side has neither live nor archived content
    Incomplete { missing: Vec<Period> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reflection {
    Synthesized {
        /// Archived months used, oldest first
        months: Vec<Period>,
        included_live: bool,
        narrative: String,
    },
    InsufficientHistory,
}

pub struct SnapshotArchive {
    store: Arc<Store>,
    source: Arc<dyn ObservationSource>,
    oracle: Arc<dyn TextOracle>,
    clock: Arc<dyn Clock>,
    config: ArchiveConfig,
}

impl SnapshotArchive {
    pub fn new(
        store: Arc<Store>,
        source: Arc<dyn ObservationSource>,
        oracle: Arc<dyn TextOracle>,
        clock: Arc<dyn Clock>,
        config: ArchiveConfig,
    ) -> Self {
        Self {
            store,
            source,
            oracle,
            clock,
            config,
        }
    }

    fn current_period(&self) -> Period {
        self.clock.current_month().into()
    }

    // ── Capture ────────────────────────────────────────────────────

    /// Snapshot the current month, or the given one
    pub async fn take_snapshot(
        &self,
        year: Option<i32>,
        month: Option<u32>,
    ) -> Result<CaptureOutcome> {
        let current = self.current_period();
        self.capture(year.unwrap_or(current.year), month.unwrap_or(current.month))
            .await
    }

    /// Copy every category's live content into the archive under `(year, month)`.
    ///
    /// Rows are upserted: capturing the same month twice keeps the second copy,
    /// unless `protect_closed_months` is set and the month is already closed
    /// and archived.
    pub async fn capture(&self, year: i32, month: u32) -> Result<CaptureOutcome> {
        let period = Period::new(year, month)?;
        self.store.refresh().await?;
        if self.config.protect_closed_months
            && period < self.current_period()
            && self.store.has_snapshot_for(year, month).await
        {
            info!("Snapshot for {} is protected, leaving it untouched", period);
            return Ok(CaptureOutcome::Protected);
        }

        let (start, end) = period.bounds()?;
        let in_month = self.source.between(start, end).await?;

        // Pair each of the month's observations with its ledger record
        let mut digested = Vec::with_capacity(in_month.len());
        for observation in in_month {
            if let Some(record) = self.store.ledger_get(&observation.id).await {
                digested.push((observation, record));
            }
        }
        digested.sort_by(|a, b| {
            b.0.created_at
                .cmp(&a.0.created_at)
                .then_with(|| b.0.id.cmp(&a.0.id))
        });

        let now = self.clock.now();
        let live = self.store.read_all().await;
        let rows: Vec<Snapshot> = live
            .into_values()
            .map(|state| {
                let touching: Vec<_> = digested
                    .iter()
                    .filter(|(_, record)| record.categories.contains(&state.category))
                    .collect();
                let key_observations = touching
                    .iter()
                    .filter(|(_, record)| record.breadth() >= 2)
                    .take(self.config.key_observation_cap)
                    .map(|(observation, record)| KeyObservation {
                        observation_id: observation.id.clone(),
                        text: observation.text.clone(),
                        created_at: observation.created_at,
                        categories: record.categories.clone(),
                    })
                    .collect();
                Snapshot {
                    category: state.category,
                    year,
                    month,
                    content: state.content,
                    observation_count: touching.len() as u64,
                    key_observations,
                    captured_at: now,
                }
            })
            .collect();

        let count = rows.len();
        let replaced = self.store.upsert_snapshots(rows).await?;
        info!(
            "Captured snapshot for {}: {} rows ({} replaced)",
            period, count, replaced
        );
        Ok(CaptureOutcome::Captured {
            rows: count,
            replaced,
        })
    }

    pub async fn list_snapshots(&self) -> Vec<Snapshot> {
        if let Err(e) = self.store.refresh().await {
            warn!("Listing cached snapshots, refresh failed: {}", e);
        }
        self.store.list_snapshots().await
    }

    // ── Queries ────────────────────────────────────────────────────

    /// The current month always reads live state, even if it has a snapshot.
    pub async fn recall(&self, category: Category, year: i32, month: u32) -> Result<Recall> {
        let period = Period::new(year, month)?;
        self.store.refresh().await?;
        if period == self.current_period() {
            return Ok(Recall::Live(self.store.read(category).await));
        }
        Ok(match self.store.snapshot(category, year, month).await {
            Some(snapshot) => Recall::Archived(snapshot),
            None => Recall::NotFound,
        })
    }

    /// Describe how `category` changed between two months
    pub async fn compare(&self, category: Category, from: Period, to: Period) -> Result<Comparison> {
        let before = self.recall(category, from.year, from.month).await?;
        let after = self.recall(category, to.year, to.month).await?;

        let (before, after) = match (before.content(), after.content()) {
            (Some(b), Some(a)) => (b.to_string(), a.to_string()),
            _ => {
                let missing = [(from, &before), (to, &after)]
                    .into_iter()
                    .filter(|(_, r)| matches!(r, Recall::NotFound))
                    .map(|(p, _)| p)
                    .collect();
                debug!(category = %category, "Comparison incomplete: {:?}", missing);
                return Ok(Comparison::Incomplete { missing });
            }
        };

        let prompt = format!(
            r#"Compare two versions of the "{name}" summary ({describe}).

=== {from} ===
{before}

=== {to} ===
{after}

Describe what changed from {from} to {to} in these sections:
Added: items that appear only in {to}
Resolved: items closed, completed or gone by {to}
Shifted: items still present whose state or tone changed
Overall: one sentence on the direction of change
Output ONLY the comparison."#,
            name = category.as_str(),
            describe = category.describe(),
        );
        let narrative = self.oracle.generate(&prompt).await?;

        Ok(Comparison::Delta {
            category,
            from,
            to,
            narrative: narrative.trim().to_string(),
        })
    }

    /// Synthesize the narrative arc over the last `lookback_months` closed
    /// months plus the current live narrative.
    ///
    /// The walk back stops at the oldest archived narrative, so any lookback
    /// costs at most one step per month of history.
    pub async fn reflect(&self, lookback_months: u32) -> Result<Reflection> {
        self.store.refresh().await?;
        let mut months = Vec::new();
        let mut sections = Vec::new();

        let mut closed = Vec::new();
        if let Some(oldest) = self.store.oldest_snapshot(Category::Narrative).await {
            let oldest = Period::from(oldest);
            let mut period = self.current_period();
            for _ in 0..lookback_months {
                period = period.previous();
                if period < oldest {
                    break;
                }
                closed.push(period);
            }
        }
        closed.reverse();

        for period in closed {
            if let Some(snapshot) = self
                .store
                .snapshot(Category::Narrative, period.year, period.month)
                .await
            {
                sections.push(format!("=== {} ===\n{}", period, snapshot.content));
                months.push(period);
            }
        }

        let live = self.store.read(Category::Narrative).await;
        let included_live = !live.is_default();
        if included_live {
            sections.push(format!(
                "=== {} (current) ===\n{}",
                self.current_period(),
                live.content
            ));
        }

        if sections.is_empty() {
            debug!("Nothing to reflect on");
            return Ok(Reflection::InsufficientHistory);
        }

        let prompt = format!(
            r#"Below are monthly versions of a personal narrative summary, oldest first.

{}

Write a short reflection (one or two paragraphs) on the arc across these months:
what carried through, what changed, and where things seem to be heading.
Output ONLY the reflection."#,
            sections.join("\n\n")
        );
        let narrative = match self.oracle.generate(&prompt).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Reflection failed: {}", e);
                return Err(e);
            }
        };

        Ok(Reflection::Synthesized {
            months,
            included_live,
            narrative,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::observations::{InMemoryObservations, Observation};
    use crate::oracle::testing::StubOracle;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<Store>,
        source: Arc<InMemoryObservations>,
        oracle: Arc<StubOracle>,
        clock: Arc<FixedClock>,
    }

    impl Fixture {
        fn new(now: DateTime<Utc>) -> Self {
            Self {
                store: Arc::new(Store::in_memory()),
                source: Arc::new(InMemoryObservations::new()),
                oracle: Arc::new(StubOracle::new(|_| Ok("  A quieter month.  ".to_string()))),
                clock: Arc::new(FixedClock::new(now)),
            }
        }

        fn archive(&self, protect: bool) -> SnapshotArchive {
            SnapshotArchive::new(
                self.store.clone(),
                self.source.clone(),
                self.oracle.clone(),
                self.clock.clone(),
                ArchiveConfig {
                    key_observation_cap: 2,
                    protect_closed_months: protect,
                },
            )
        }
    }

    #[test]
    fn test_period_parse_and_validate() {
        assert_eq!("2025-10".parse::<Period>().unwrap(), Period { year: 2025, month: 10 });
        assert!("2025-13".parse::<Period>().is_err());
        assert!("October".parse::<Period>().is_err());
        assert!(Period::new(2025, 0).is_err());
        assert_eq!(Period::new(2025, 1).unwrap().previous().to_string(), "2024-12");
    }

    #[test]
    fn test_period_bounds_cross_year() {
        let (start, end) = Period::new(2025, 12).unwrap().bounds().unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_capture_counts_and_key_observations() {
        let fx = Fixture::new(at(2025, 11, 2));
        for (id, day, cats) in [
            ("o1", 3, vec![(Category::Mood, "tired")]),
            ("o2", 10, vec![(Category::Mood, "tense"), (Category::Tensions, "- rent")]),
            ("o3", 20, vec![(Category::Mood, "calm"), (Category::Narrative, "Settling.")]),
            ("o4", 25, vec![(Category::Mood, "ok"), (Category::People, "- Ana")]),
        ] {
            fx.source
                .push(Observation::new(id, format!("obs {id}"), at(2025, 10, day)))
                .await;
            let updates: Vec<_> = cats.into_iter().map(|(c, s)| (c, s.to_string())).collect();
            fx.store.commit_digestion(id, updates, at(2025, 10, day)).await.unwrap();
        }

        let outcome = fx.archive(false).capture(2025, 10).await.unwrap();
        assert_eq!(outcome, CaptureOutcome::Captured { rows: 6, replaced: 0 });

        let mood = fx.store.snapshot(Category::Mood, 2025, 10).await.unwrap();
        assert_eq!(mood.content, "ok");
        assert_eq!(mood.observation_count, 4);
        let keys: Vec<_> = mood
            .key_observations
            .iter()
            .map(|k| k.observation_id.as_str())
            .collect();
        assert_eq!(keys, vec!["o4", "o3"]);

        let commitments = fx.store.snapshot(Category::Commitments, 2025, 10).await.unwrap();
        assert_eq!(commitments.content, "No commitments tracked yet.");
        assert_eq!(commitments.observation_count, 0);
    }

    #[tokio::test]
    async fn test_capture_twice_keeps_second() {
        let fx = Fixture::new(at(2025, 11, 2));
        let archive = fx.archive(false);
        fx.store
            .replace(Category::Mood, "first".to_string(), "o1", at(2025, 11, 1))
            .await
            .unwrap();
        archive.capture(2025, 10).await.unwrap();
        fx.store
            .replace(Category::Mood, "second".to_string(), "o2", at(2025, 11, 2))
            .await
            .unwrap();
        let outcome = archive.capture(2025, 10).await.unwrap();

        assert_eq!(outcome, CaptureOutcome::Captured { rows: 6, replaced: 6 });
        let mood = fx.store.snapshot(Category::Mood, 2025, 10).await.unwrap();
        assert_eq!(mood.content, "second");
        assert_eq!(archive.list_snapshots().await.len(), 6);
    }

    #[tokio::test]
    async fn test_protected_closed_month_untouched() {
        let fx = Fixture::new(at(2025, 11, 2));
        let archive = fx.archive(true);
        fx.store
            .replace(Category::Mood, "first".to_string(), "o1", at(2025, 11, 1))
            .await
            .unwrap();
        archive.capture(2025, 10).await.unwrap();
        fx.store
            .replace(Category::Mood, "second".to_string(), "o2", at(2025, 11, 2))
            .await
            .unwrap();

        assert_eq!(archive.capture(2025, 10).await.unwrap(), CaptureOutcome::Protected);
        let mood = fx.store.snapshot(Category::Mood, 2025, 10).await.unwrap();
        assert_eq!(mood.content, "first");

        // The current month is never protected
        archive.take_snapshot(None, None).await.unwrap();
        assert!(matches!(
            archive.take_snapshot(None, None).await.unwrap(),
            CaptureOutcome::Captured { replaced: 6, .. }
        ));
    }

    #[tokio::test]
    async fn test_recall_current_month_reads_live() {
        let fx = Fixture::new(at(2025, 11, 15));
        let archive = fx.archive(false);
        fx.store
            .replace(Category::Mood, "snapshotted".to_string(), "o1", at(2025, 11, 10))
            .await
            .unwrap();
        archive.take_snapshot(None, None).await.unwrap();
        fx.store
            .replace(Category::Mood, "newer".to_string(), "o2", at(2025, 11, 15))
            .await
            .unwrap();

        let recall = archive.recall(Category::Mood, 2025, 11).await.unwrap();
        assert_eq!(recall.content(), Some("newer"));
        assert!(matches!(recall, Recall::Live(_)));
    }

    #[tokio::test]
    async fn test_recall_missing_month_is_not_found() {
        let fx = Fixture::new(at(2025, 11, 15));
        let recall = fx.archive(false).recall(Category::Mood, 2024, 3).await.unwrap();
        assert_eq!(recall, Recall::NotFound);
        assert!(fx.archive(false).recall(Category::Mood, 2024, 13).await.is_err());
    }

    #[tokio::test]
    async fn test_compare_incomplete_skips_oracle() {
        let fx = Fixture::new(at(2025, 11, 15));
        let from = Period::new(2025, 9).unwrap();
        let to = Period::new(2025, 11).unwrap();

        let comparison = fx.archive(false).compare(Category::Mood, from, to).await.unwrap();

        assert_eq!(comparison, Comparison::Incomplete { missing: vec![from] });
        assert_eq!(fx.oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn test_compare_delta_uses_both_sides() {
        let fx = Fixture::new(at(2025, 11, 15));
        let archive = fx.archive(false);
        fx.store
            .replace(Category::Mood, "Anxious about rent.".to_string(), "o1", at(2025, 10, 5))
            .await
            .unwrap();
        archive.capture(2025, 10).await.unwrap();
        fx.store
            .replace(Category::Mood, "Relieved and rested.".to_string(), "o2", at(2025, 11, 5))
            .await
            .unwrap();

        let comparison = archive
            .compare(
                Category::Mood,
                Period::new(2025, 10).unwrap(),
                Period::new(2025, 11).unwrap(),
            )
            .await
            .unwrap();

        let Comparison::Delta { narrative, .. } = comparison else {
            panic!("expected a delta");
        };
        assert_eq!(narrative, "A quieter month.");
        let prompts = fx.oracle.prompts.lock().unwrap();
        assert!(prompts[0].contains("Anxious about rent."));
        assert!(prompts[0].contains("Relieved and rested."));
    }

    #[tokio::test]
    async fn test_reflect_without_history() {
        let fx = Fixture::new(at(2025, 11, 15));
        let reflection = fx.archive(false).reflect(3).await.unwrap();
        assert_eq!(reflection, Reflection::InsufficientHistory);
        assert_eq!(fx.oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reflect_orders_months_oldest_first() {
        let fx = Fixture::new(at(2025, 9, 15));
        let archive = fx.archive(false);
        for (month, text) in [(9, "Started the new job."), (10, "Found a rhythm.")] {
            fx.clock.set(at(2025, month, 28));
            fx.store
                .replace(Category::Narrative, text.to_string(), "o", at(2025, month, 28))
                .await
                .unwrap();
            archive.take_snapshot(None, None).await.unwrap();
        }
        fx.clock.set(at(2025, 11, 15));
        fx.store
            .replace(Category::Narrative, "Planning a trip.".to_string(), "o", at(2025, 11, 15))
            .await
            .unwrap();

        let reflection = archive.reflect(3).await.unwrap();

        let Reflection::Synthesized { months, included_live, .. } = reflection else {
            panic!("expected a reflection");
        };
        assert_eq!(
            months,
            vec![Period::new(2025, 9).unwrap(), Period::new(2025, 10).unwrap()]
        );
        assert!(included_live);
        let prompts = fx.oracle.prompts.lock().unwrap();
        let prompt = &prompts[0];
        let sept = prompt.find("Started the new job.").unwrap();
        let oct = prompt.find("Found a rhythm.").unwrap();
        let nov = prompt.find("Planning a trip.").unwrap();
        assert!(sept < oct && oct < nov);
    }
    #[tokio::test]
    async fn test_reflect_huge_lookback_stops_at_oldest_snapshot() {
        let fx = Fixture::new(at(2025, 9, 15));
        let archive = fx.archive(false);
        for (month, text) in [(9, "Started the new job."), (10, "Found a rhythm.")] {
            fx.clock.set(at(2025, month, 28));
            fx.store
                .replace(Category::Narrative, text.to_string(), "o", at(2025, month, 28))
                .await
                .unwrap();
            archive.take_snapshot(None, None).await.unwrap();
        }
        fx.clock.set(at(2025, 11, 15));

        let reflection = archive.reflect(u32::MAX).await.unwrap();

        let Reflection::Synthesized { months, .. } = reflection else {
            panic!("expected a reflection");
        };
        assert_eq!(
            months,
            vec![Period::new(2025, 9).unwrap(), Period::new(2025, 10).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_long_lived_archive_captures_other_process_commits() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fx = Fixture {
            store: Arc::new(Store::open(tmp.path()).await.unwrap()),
            ..Fixture::new(at(2025, 11, 2))
        };
        let daemon = fx.archive(false);

        let cli = Store::open(tmp.path()).await.unwrap();
        fx.source
            .push(Observation::new("o1", "feeling drained", at(2025, 10, 20)))
            .await;
        cli.commit_digestion(
            "o1",
            vec![(Category::Mood, "feeling drained".to_string())],
            at(2025, 10, 20),
        )
        .await
        .unwrap();

        daemon.capture(2025, 10).await.unwrap();

        let Recall::Archived(snapshot) = daemon.recall(Category::Mood, 2025, 10).await.unwrap() else {
            panic!("expected an archived snapshot");
        };
        assert_eq!(snapshot.content, "feeling drained");
        assert_eq!(snapshot.observation_count, 1);

        // A snapshot taken elsewhere survives the daemon's next capture
        let other = SnapshotArchive::new(
            Arc::new(cli),
            fx.source.clone(),
            fx.oracle.clone(),
            fx.clock.clone(),
            ArchiveConfig::default(),
        );
        other.capture(2025, 9).await.unwrap();
        daemon.capture(2025, 10).await.unwrap();
        assert!(daemon.list_snapshots().await.iter().any(|s| s.month == 9));
    }
}

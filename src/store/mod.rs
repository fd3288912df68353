//! Distilled state, digestion ledger, staleness, runs and snapshots.
//!
//! Directory layout:
//!   {root}/state.json       distilled rows + ledger, always written together
//!   {root}/staleness.json   latest staleness annotation per observation
//!   {root}/runs.jsonl       consolidation runs, append-only
//!   {root}/snapshots.json   archived monthly snapshots
//!
//! JSON files are replaced atomically (write `.tmp`, then rename), so a crash
//! leaves either the old or the new file on disk, never a torn one. A store
//! created with [`Store::in_memory`] skips persistence entirely.
//!
//! Several processes may share one directory (a scheduled consolidation next
//! to one-shot CLI commands). Every write takes the directory lock, reloads
//! the file it is about to change, applies the change and persists, so no
//! process overwrites another's commit with a stale copy. Readers that may
//! have been open for a while call [`Store::refresh`] first.

mod lock;
pub mod records;

pub use records::{
    ConsolidationRun, DetectedPattern, DigestionRecord, DistilledState, KeyObservation, Snapshot,
    StalenessAnnotation,
};

use crate::category::{Category, CATEGORY_SET_VERSION};
use crate::{DistillError, Result};
use lock::DirLock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const STATE_FILE: &str = "state.json";
const STALENESS_FILE: &str = "staleness.json";
const RUNS_FILE: &str = "runs.jsonl";
const SNAPSHOTS_FILE: &str = "snapshots.json";

/// Everything that must commit as one unit when an observation is digested
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LiveState {
    #[serde(default)]
    category_set_version: u32,
    #[serde(default)]
    distilled: BTreeMap<Category, DistilledState>,
    #[serde(default)]
    ledger: BTreeMap<String, DigestionRecord>,
}

type SnapshotKey = (i32, u32, Category);

/// Count drift between a category row and the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountDrift {
    pub category: Category,
    pub observation_count: u64,
    pub ledger_count: u64,
}

/// New content for one category, produced by a merge against the row as it
/// stood at `based_on` observations.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryUpdate {
    pub category: Category,
    pub content: String,
    /// Expected `observation_count` at commit time; `None` skips the check
    pub based_on: Option<u64>,
}

impl CategoryUpdate {
    pub fn based_on(category: Category, content: String, observation_count: u64) -> Self {
        Self {
            category,
            content,
            based_on: Some(observation_count),
        }
    }
}

impl From<(Category, String)> for CategoryUpdate {
    fn from((category, content): (Category, String)) -> Self {
        Self {
            category,
            content,
            based_on: None,
        }
    }
}

pub struct Store {
    root: Option<PathBuf>,
    live: RwLock<LiveState>,
    staleness: RwLock<HashMap<String, StalenessAnnotation>>,
    runs: RwLock<Vec<ConsolidationRun>>,
    snapshots: RwLock<BTreeMap<SnapshotKey, Snapshot>>,
}

impl Store {
    /// Open (or create) a store rooted at `root`, seeding default rows for
    /// any category missing from disk.
    pub async fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).await?;

        let mut live: LiveState = read_json(&root.join(STATE_FILE)).await?.unwrap_or_default();
        let staleness: Vec<StalenessAnnotation> =
            read_json(&root.join(STALENESS_FILE)).await?.unwrap_or_default();
        let snapshots: Vec<Snapshot> =
            read_json(&root.join(SNAPSHOTS_FILE)).await?.unwrap_or_default();
        let runs = read_runs(&root.join(RUNS_FILE)).await?;

        let seeded = seed_defaults(&mut live, Utc::now());

        let store = Self {
            root: Some(root.to_path_buf()),
            live: RwLock::new(live),
            staleness: RwLock::new(index_staleness(staleness)),
            runs: RwLock::new(runs),
            snapshots: RwLock::new(index_snapshots(snapshots)),
        };

        if seeded > 0 {
            store.mutate_live(|_| Ok(())).await?;
            info!("Seeded {} default category rows in {:?}", seeded, root);
        }
        Ok(store)
    }

    /// A store that never touches disk
    pub fn in_memory() -> Self {
        let mut live = LiveState::default();
        seed_defaults(&mut live, Utc::now());
        Self {
            root: None,
            live: RwLock::new(live),
            staleness: RwLock::new(HashMap::new()),
            runs: RwLock::new(Vec::new()),
            snapshots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Reload every file from disk, picking up other processes' writes.
    /// A no-op for in-memory stores.
    pub async fn refresh(&self) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };

        // Each guard is held across its read so an in-process write cannot
        // land between the read and the swap
        {
            let mut live = self.live.write().await;
            if let Some(mut loaded) = read_json::<LiveState>(&root.join(STATE_FILE)).await? {
                seed_defaults(&mut loaded, Utc::now());
                *live = loaded;
            }
        }
        {
            let mut staleness = self.staleness.write().await;
            let rows: Vec<StalenessAnnotation> =
                read_json(&root.join(STALENESS_FILE)).await?.unwrap_or_default();
            *staleness = index_staleness(rows);
        }
        {
            let mut snapshots = self.snapshots.write().await;
            let rows: Vec<Snapshot> =
                read_json(&root.join(SNAPSHOTS_FILE)).await?.unwrap_or_default();
            *snapshots = index_snapshots(rows);
        }
        {
            let mut runs = self.runs.write().await;
            *runs = read_runs(&root.join(RUNS_FILE)).await?;
        }
        debug!("Refreshed store from {:?}", root);
        Ok(())
    }

    // ── Distilled state ────────────────────────────────────────────

    /// Current row for `category`; an absent row reads as the default.
    pub async fn read(&self, category: Category) -> DistilledState {
        let live = self.live.read().await;
        live.distilled
            .get(&category)
            .cloned()
            .unwrap_or_else(|| DistilledState::default_for(category, Utc::now()))
    }

    pub async fn read_all(&self) -> BTreeMap<Category, DistilledState> {
        let live = self.live.read().await;
        Category::ALL
            .iter()
            .map(|c| {
                let row = live
                    .distilled
                    .get(c)
                    .cloned()
                    .unwrap_or_else(|| DistilledState::default_for(*c, Utc::now()));
                (*c, row)
            })
            .collect()
    }

    /// Replace one category's content, bumping its count, outside any
    /// digestion. Prefer [`Store::commit_digestion`], which keeps the ledger
    /// in step.
    pub async fn replace(
        &self,
        category: Category,
        content: String,
        last_observation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DistilledState> {
        self.mutate_live(|live| Ok(apply_update(live, category, content, last_observation_id, now)))
            .await
    }

    // ── Ledger ─────────────────────────────────────────────────────

    pub async fn ledger_get(&self, observation_id: &str) -> Option<DigestionRecord> {
        self.live.read().await.ledger.get(observation_id).cloned()
    }

    pub async fn ledger_all(&self) -> Vec<DigestionRecord> {
        self.live.read().await.ledger.values().cloned().collect()
    }

    pub async fn ledger_len(&self) -> usize {
        self.live.read().await.ledger.len()
    }

    /// Commit one observation's digestion as a single transaction.
    ///
    /// Applies every category update and upserts the ledger record, then
    /// persists `state.json` once. If persisting fails, the in-memory state
    /// is restored and nothing is committed.
    ///
    /// Categories the ledger already lists for this observation are skipped,
    /// so an observation is never counted twice in one category. An update
    /// whose `based_on` count no longer matches the row fails the whole
    /// commit with [`DistillError::Conflict`]: the row moved since the merge
    /// read it, and the merge has to be redone. Returns the resulting ledger
    /// record.
    pub async fn commit_digestion<U: Into<CategoryUpdate>>(
        &self,
        observation_id: &str,
        updates: impl IntoIterator<Item = U>,
        now: DateTime<Utc>,
    ) -> Result<DigestionRecord> {
        let updates: Vec<CategoryUpdate> = updates.into_iter().map(Into::into).collect();
        self.mutate_live(|live| {
            let already: BTreeSet<Category> = live
                .ledger
                .get(observation_id)
                .map(|r| r.categories.clone())
                .unwrap_or_default();

            let pending: Vec<CategoryUpdate> = updates
                .into_iter()
                .filter(|u| {
                    let skip = already.contains(&u.category);
                    if skip {
                        debug!(
                            observation_id,
                            category = %u.category,
                            "Skipping update already recorded in ledger"
                        );
                    }
                    !skip
                })
                .collect();

            for update in &pending {
                let current = live.distilled.get(&update.category).map_or(0, |r| r.observation_count);
                if update.based_on.is_some_and(|expected| expected != current) {
                    return Err(DistillError::Conflict(update.category));
                }
            }

            let mut applied = BTreeSet::new();
            for update in pending {
                apply_update(live, update.category, update.content, observation_id, now);
                applied.insert(update.category);
            }

            let record = live
                .ledger
                .entry(observation_id.to_string())
                .or_insert_with(|| DigestionRecord {
                    observation_id: observation_id.to_string(),
                    categories: BTreeSet::new(),
                    digested_at: now,
                });
            record.categories.extend(applied);
            Ok(record.clone())
        })
        .await
    }

    /// Reset `category` to its default and drop it from every ledger record.
    /// Records themselves stay, so their observations remain digested.
    pub async fn reset_category(&self, category: Category, now: DateTime<Utc>) -> Result<()> {
        self.mutate_live(|live| {
            live.distilled
                .insert(category, DistilledState::default_for(category, now));
            for record in live.ledger.values_mut() {
                record.categories.remove(&category);
            }
            Ok(())
        })
        .await
    }

    /// Reset every category and clear the whole ledger
    pub async fn reset_all(&self, now: DateTime<Utc>) -> Result<()> {
        self.mutate_live(|live| {
            live.ledger.clear();
            for category in Category::ALL {
                live.distilled
                    .insert(category, DistilledState::default_for(category, now));
            }
            Ok(())
        })
        .await
    }

    /// Compare each row's count with the ledger tally for its category
    pub async fn count_drift(&self) -> Vec<CountDrift> {
        let live = self.live.read().await;
        let mut tally: BTreeMap<Category, u64> = BTreeMap::new();
        for record in live.ledger.values() {
            for category in &record.categories {
                *tally.entry(*category).or_default() += 1;
            }
        }

        Category::ALL
            .iter()
            .filter_map(|c| {
                let observation_count = live.distilled.get(c).map_or(0, |r| r.observation_count);
                let ledger_count = tally.get(c).copied().unwrap_or(0);
                (observation_count != ledger_count).then_some(CountDrift {
                    category: *c,
                    observation_count,
                    ledger_count,
                })
            })
            .collect()
    }

    // ── Staleness ──────────────────────────────────────────────────

    pub async fn staleness(&self, observation_id: &str) -> Option<StalenessAnnotation> {
        self.staleness.read().await.get(observation_id).cloned()
    }

    /// Overwrite the annotations for the given observations
    pub async fn write_staleness(&self, annotations: Vec<StalenessAnnotation>) -> Result<()> {
        if annotations.is_empty() {
            return Ok(());
        }
        let mut map = self.staleness.write().await;
        let _lock = self.lock().await?;
        if let Some(root) = &self.root {
            let on_disk: Vec<StalenessAnnotation> =
                read_json(&root.join(STALENESS_FILE)).await?.unwrap_or_default();
            *map = index_staleness(on_disk);
        }
        for annotation in annotations {
            map.insert(annotation.observation_id.clone(), annotation);
        }
        if let Some(root) = &self.root {
            let mut all: Vec<&StalenessAnnotation> = map.values().collect();
            all.sort_by(|a, b| a.observation_id.cmp(&b.observation_id));
            write_json_atomic(&root.join(STALENESS_FILE), &all).await?;
        }
        Ok(())
    }

    // ── Consolidation runs ─────────────────────────────────────────

    pub async fn append_run(&self, run: ConsolidationRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        let _lock = self.lock().await?;
        if let Some(root) = &self.root {
            let mut line = serde_json::to_string(&run)?;
            line.push('\n');
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(root.join(RUNS_FILE))
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        runs.push(run);
        Ok(())
    }

    pub async fn runs(&self) -> Vec<ConsolidationRun> {
        self.runs.read().await.clone()
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Insert or overwrite snapshots. Returns how many existing rows were replaced.
    pub async fn upsert_snapshots(&self, rows: Vec<Snapshot>) -> Result<usize> {
        let mut snapshots = self.snapshots.write().await;
        let _lock = self.lock().await?;
        if let Some(root) = &self.root {
            let on_disk: Vec<Snapshot> =
                read_json(&root.join(SNAPSHOTS_FILE)).await?.unwrap_or_default();
            *snapshots = index_snapshots(on_disk);
        }
        let before = snapshots.clone();
        let mut replaced = 0;
        for row in rows {
            if snapshots
                .insert((row.year, row.month, row.category), row)
                .is_some()
            {
                replaced += 1;
            }
        }
        if let Some(root) = &self.root {
            let all: Vec<&Snapshot> = snapshots.values().collect();
            if let Err(e) = write_json_atomic(&root.join(SNAPSHOTS_FILE), &all).await {
                *snapshots = before;
                return Err(e);
            }
        }
        Ok(replaced)
    }

    pub async fn snapshot(&self, category: Category, year: i32, month: u32) -> Option<Snapshot> {
        self.snapshots
            .read()
            .await
            .get(&(year, month, category))
            .cloned()
    }

    pub async fn has_snapshot_for(&self, year: i32, month: u32) -> bool {
        self.snapshots
            .read()
            .await
            .keys()
            .any(|(y, m, _)| *y == year && *m == month)
    }

    /// (year, month) of the oldest snapshot of `category`
    pub async fn oldest_snapshot(&self, category: Category) -> Option<(i32, u32)> {
        self.snapshots
            .read()
            .await
            .keys()
            .filter(|(_, _, c)| *c == category)
            .map(|(y, m, _)| (*y, *m))
            .min()
    }

    /// All snapshots ordered by (year, month, category)
    pub async fn list_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.read().await.values().cloned().collect()
    }

    // ── Persistence helpers ────────────────────────────────────────

    async fn lock(&self) -> Result<Option<DirLock>> {
        match &self.root {
            Some(root) => DirLock::acquire(root).await.map(Some),
            None => Ok(None),
        }
    }

    /// Read-modify-write of `state.json` under the directory lock.
    ///
    /// The in-memory copy is replaced by the file's current contents before
    /// `change` runs. If `change` or the write fails, memory is restored to
    /// what was on disk.
    async fn mutate_live<T>(&self, change: impl FnOnce(&mut LiveState) -> Result<T>) -> Result<T> {
        let mut live = self.live.write().await;
        let _lock = self.lock().await?;

        if let Some(root) = &self.root {
            if let Some(on_disk) = read_json::<LiveState>(&root.join(STATE_FILE)).await? {
                *live = on_disk;
                seed_defaults(&mut live, Utc::now());
            }
        }

        let before = live.clone();
        let out = match change(&mut *live) {
            Ok(out) => out,
            Err(e) => {
                *live = before;
                return Err(e);
            }
        };

        if let Some(root) = &self.root {
            if let Err(e) = write_json_atomic(&root.join(STATE_FILE), &*live).await {
                warn!("Failed to persist state, rolling back: {}", e);
                *live = before;
                return Err(e);
            }
        }
        Ok(out)
    }
}

fn index_staleness(rows: Vec<StalenessAnnotation>) -> HashMap<String, StalenessAnnotation> {
    rows.into_iter()
        .map(|a| (a.observation_id.clone(), a))
        .collect()
}

fn index_snapshots(rows: Vec<Snapshot>) -> BTreeMap<SnapshotKey, Snapshot> {
    rows.into_iter()
        .map(|s| ((s.year, s.month, s.category), s))
        .collect()
}

fn seed_defaults(live: &mut LiveState, now: DateTime<Utc>) -> usize {
    live.category_set_version = CATEGORY_SET_VERSION;
    let mut seeded = 0;
    for category in Category::ALL {
        live.distilled.entry(category).or_insert_with(|| {
            seeded += 1;
            DistilledState::default_for(category, now)
        });
    }
    seeded
}

fn apply_update(
    live: &mut LiveState,
    category: Category,
    content: String,
    observation_id: &str,
    now: DateTime<Utc>,
) -> DistilledState {
    let row = live
        .distilled
        .entry(category)
        .or_insert_with(|| DistilledState::default_for(category, now));
    row.content = content;
    row.last_observation_id = Some(observation_id.to_string());
    row.observation_count += 1;
    row.updated_at = now;
    row.clone()
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).await?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| DistillError::Storage(format!("failed to parse {:?}: {}", path, e)))
}

async fn read_runs(path: &Path) -> Result<Vec<ConsolidationRun>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).await?;
    let mut runs = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(run) => runs.push(run),
            Err(e) => warn!("Skipping malformed run at {:?}:{}: {}", path, index + 1, e),
        }
    }
    Ok(runs)
}

async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

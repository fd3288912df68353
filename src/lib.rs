//! Distill - living summaries over an append-only observation log
//!
//! Folds free-text observations about one subject into a handful of
//! continuously-updated category summaries, and archives monthly snapshots
//! of those summaries for retrospective queries:
//! - Classify and merge each observation exactly once
//! - Periodic consolidation (patterns, staleness, digest, snapshot trigger)
//! - Recall, compare and reflect across archived months

pub mod archive;
pub mod category;
pub mod clock;
pub mod config;
pub mod consolidate;
pub mod distill;
pub mod observations;
pub mod oracle;
pub mod store;

pub use archive::{CaptureOutcome, Comparison, Period, Recall, Reflection, SnapshotArchive};
pub use category::Category;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::DistillConfig;
pub use consolidate::Consolidator;
pub use distill::{DigestWorker, Distiller, RebuildScope};
pub use observations::{InMemoryObservations, JsonlObservationLog, Observation, ObservationSource};
pub use oracle::{HttpOracle, TextOracle};
pub use store::Store;

/// Result type for Distill operations
pub type Result<T> = std::result::Result<T, DistillError>;

/// Errors that can occur in Distill
#[derive(Debug, thiserror::Error)]
pub enum DistillError {
    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("A consolidation run is already in progress")]
    ConsolidationInProgress,

    #[error("Concurrent update to {0}; merge again")]
    Conflict(Category),

    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

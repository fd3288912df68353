//! Configuration for Distill.
//!
//! Resolution (highest precedence first):
//!   1. `DISTILL_MODEL` / `DISTILL_BASE_URL` environment variables
//!   2. `<data_dir>/config.toml`
//!   3. built-in defaults
//!
//! The data directory itself comes from `DISTILL_HOME`, falling back to
//! `~/.distill`.

use crate::category::Category;
use crate::{DistillError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    /// Directory holding state, snapshots, runs and the observation log
    #[serde(skip)]
    pub data_dir: PathBuf,

    pub oracle: OracleConfig,

    pub consolidation: ConsolidationConfig,

    pub archive: ArchiveConfig,
}

/// Settings for the HTTP text oracle
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// OpenAI-compatible base URL (the client appends `/chat/completions`)
    pub base_url: String,

    pub model: String,

    /// Environment variable holding the bearer token. Unset means no auth header.
    pub api_key_env: Option<String>,

    /// Per-call timeout; an elapsed timeout counts as a failed call
    pub timeout_secs: u64,

    /// Transport-level attempts for 5xx/network errors. 1 disables retry.
    pub max_attempts: u32,

    pub temperature: f32,

    pub max_tokens: u32,

    /// Extra static headers sent with every request
    pub http_headers: HashMap<String, String>,
}

/// Settings for the consolidation ("sleep") pass
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Trailing window sampled for patterns and strengthening
    pub window_days: i64,

    /// Minimum window observations before pattern detection and digest run
    pub min_observations: usize,

    /// Amount subtracted from a strengthened observation's staleness
    pub strengthen_step: f64,

    /// Observations older than this get a fresh staleness score
    pub stale_after_days: i64,

    /// Age at which the age factor of the staleness score saturates at 1
    pub fade_horizon_days: i64,

    /// Observations touching this category are always strengthened
    pub high_salience: Category,

    /// Period of the scheduled consolidation loop
    pub interval_minutes: u64,
}

/// Settings for the snapshot archive
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Maximum key observations kept per snapshot
    pub key_observation_cap: usize,

    /// Refuse to overwrite existing snapshots of closed months
    pub protect_closed_months: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: Some(DEFAULT_API_KEY_ENV.to_string()),
            timeout_secs: 60,
            max_attempts: 1,
            temperature: 0.2,
            max_tokens: 1024,
            http_headers: HashMap::new(),
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            min_observations: 3,
            strengthen_step: 0.1,
            stale_after_days: 30,
            fade_horizon_days: 180,
            high_salience: Category::Commitments,
            interval_minutes: 24 * 60,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            key_observation_cap: 5,
            protect_closed_months: false,
        }
    }
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            oracle: OracleConfig::default(),
            consolidation: ConsolidationConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

impl DistillConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Self::default()
        }
    }

    /// Load `<data_dir>/config.toml` if present, then apply env overrides.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let config_file = data_dir.join("config.toml");

        let mut config = if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file).await?;
            let parsed: DistillConfig = toml::from_str(&content)?;
            debug!("Loaded config from {:?}", config_file);
            parsed
        } else {
            DistillConfig::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.apply_env_overrides();
        config.validate()?;

        info!(
            "Config resolved: data_dir={:?}, model='{}', base_url='{}'",
            config.data_dir, config.oracle.model, config.oracle.base_url
        );
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("DISTILL_MODEL") {
            if !model.trim().is_empty() {
                self.oracle.model = model.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("DISTILL_BASE_URL") {
            if !url.trim().is_empty() {
                self.oracle.base_url = url.trim().to_string();
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let c = &self.consolidation;
        if c.window_days <= 0 || c.stale_after_days <= 0 || c.fade_horizon_days <= 0 {
            return Err(DistillError::Config(
                "consolidation day windows must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&c.strengthen_step) {
            return Err(DistillError::Config(
                "strengthen_step must be within [0, 1]".to_string(),
            ));
        }
        if self.oracle.max_attempts == 0 {
            return Err(DistillError::Config(
                "oracle.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.oracle.model = model.into();
        self
    }

    pub fn with_protect_closed_months(mut self, protect: bool) -> Self {
        self.archive.protect_closed_months = protect;
        self
    }

    pub fn observations_file(&self) -> PathBuf {
        self.data_dir.join("observations.jsonl")
    }
}

/// `DISTILL_HOME`, else `~/.distill`, else `./.distill`
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("DISTILL_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".distill"))
        .unwrap_or_else(|| PathBuf::from(".distill"))
}

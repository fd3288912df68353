//! The closed set of topics a living summary can belong to.
//!
//! Adding a variant is backward compatible: rows for it are synthesized with
//! the default sentinel on first read. Removing one breaks any snapshot that
//! still references it.

use crate::DistillError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Version of the category enumeration. Bump when variants change.
pub const CATEGORY_SET_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Commitments,
    People,
    Projects,
    Tensions,
    Mood,
    Narrative,
}

/// How a category's summary is rendered by the merger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Bulleted entries, each carrying a status
    ItemizedStatus,
    /// Open items that drop out as they resolve
    Contracting,
    /// Short free prose
    Prose,
}

impl Category {
    /// Every category, in lock-acquisition order.
    pub const ALL: [Category; 6] = [
        Category::Commitments,
        Category::People,
        Category::Projects,
        Category::Tensions,
        Category::Mood,
        Category::Narrative,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commitments => "commitments",
            Self::People => "people",
            Self::Projects => "projects",
            Self::Tensions => "tensions",
            Self::Mood => "mood",
            Self::Narrative => "narrative",
        }
    }

    /// One-line description used in classifier prompts
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Commitments => "promises, obligations, deadlines, things owed to someone",
            Self::People => "specific people, relationships, who said or did what",
            Self::Projects => "ongoing work, initiatives, goals with progress",
            Self::Tensions => "conflicts, worries, unresolved problems, friction",
            Self::Mood => "emotional state, energy level, how the subject feels",
            Self::Narrative => "the overall story of what is happening in the subject's life",
        }
    }

    pub fn merge_policy(&self) -> MergePolicy {
        match self {
            Self::Commitments | Self::People | Self::Projects => MergePolicy::ItemizedStatus,
            Self::Tensions => MergePolicy::Contracting,
            Self::Mood | Self::Narrative => MergePolicy::Prose,
        }
    }

    /// Sentinel content for a category nothing has touched yet
    pub fn default_content(&self) -> String {
        format!("No {} tracked yet.", self.as_str())
    }

    pub fn is_default_content(&self, content: &str) -> bool {
        content.trim() == self.default_content()
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Category {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| DistillError::UnknownCategory(s.to_string()))
    }
}

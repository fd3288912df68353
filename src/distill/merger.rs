//! Summary merger: folds one observation into one category's summary.
//!
//! The oracle regenerates the whole summary. Retention of entries the new
//! observation does not mention is requested in the prompt only; the checks
//! here catch the failure shapes we can detect cheaply: an empty reply, a
//! reply that collapses a real summary back to the sentinel, and a reply too
//! long to store without cutting entries off.

use crate::category::{Category, MergePolicy};
use crate::oracle::TextOracle;
use crate::{DistillError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on a merged summary, in characters
pub(crate) const MAX_SUMMARY_CHARS: usize = 6_000;

pub struct Merger {
    oracle: Arc<dyn TextOracle>,
}

impl Merger {
    pub fn new(oracle: Arc<dyn TextOracle>) -> Self {
        Self { oracle }
    }

    /// Produce the replacement summary for `category`.
    pub async fn merge(
        &self,
        category: Category,
        current: &str,
        observation: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<String> {
        let prompt = Self::prompt(category, current, observation, timestamp);
        let response = self.oracle.generate(&prompt).await?;
        let merged = validate_merge(category, current, &response)?;
        debug!(
            category = %category,
            "Merged summary: {} -> {} chars",
            current.len(),
            merged.len()
        );
        Ok(merged)
    }

    pub fn prompt(
        category: Category,
        current: &str,
        observation: &str,
        timestamp: DateTime<Utc>,
    ) -> String {
        let format_rules = match category.merge_policy() {
            MergePolicy::ItemizedStatus => {
                "Write a bulleted list. One bullet per item, each ending with its status \
                 in brackets, e.g. [open], [done], [waiting], [dropped]. Include names and \
                 dates when known."
            }
            MergePolicy::Contracting => {
                "Write a bulleted list of open tensions only. Remove an item when the \
                 observation shows it resolved; add new tensions as they appear."
            }
            MergePolicy::Prose => {
                "Write two to five sentences of plain prose. Emphasize the most recent \
                 state while keeping the arc of earlier entries."
            }
        };
        let closing_rule = match category.merge_policy() {
            MergePolicy::Contracting => "Resolved tensions are the only items you may drop.",
            _ => "Only drop or close an existing item if the observation explicitly closes it.",
        };

        format!(
            r#"You maintain the "{name}" summary ({describe}).

=== Current summary ===
{current}

=== New observation ({when}) ===
{observation}

Rewrite the complete summary so it incorporates the new observation.
Rules:
- Keep every existing entry the observation does not mention.
- {closing_rule}
- {format_rules}
- If the current summary is "{sentinel}", start a fresh summary.
Output ONLY the new summary text."#,
            name = category.as_str(),
            describe = category.describe(),
            when = timestamp.format("%Y-%m-%d %H:%M UTC"),
            sentinel = category.default_content(),
        )
    }
}

/// Reject replies that cannot be a replacement summary.
fn validate_merge(category: Category, current: &str, response: &str) -> Result<String> {
    let merged = response.trim();
    if merged.is_empty() {
        return Err(DistillError::Oracle(format!(
            "empty merge reply for {category}"
        )));
    }
    if category.is_default_content(merged) && !category.is_default_content(current) {
        return Err(DistillError::Oracle(format!(
            "merge reply for {category} discarded the existing summary"
        )));
    }
    let length = merged.chars().count();
    if length > MAX_SUMMARY_CHARS {
        warn!(
            category = %category,
            "Merge reply of {} chars exceeds the {} char limit; keeping the prior summary",
            length,
            MAX_SUMMARY_CHARS
        );
        return Err(DistillError::Oracle(format!(
            "merge reply for {category} is {length} chars, over the {MAX_SUMMARY_CHARS} limit"
        )));
    }
    Ok(merged.to_string())
}

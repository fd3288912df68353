//! Category classifier.
//!
//! The oracle is shown the closed category list and asked for the matching
//! names. Its answer is never trusted: it is split into word tokens, each
//! token is matched against the enumeration, and everything else is dropped.
//! Any oracle failure degrades to the empty set.

use crate::category::Category;
use crate::oracle::TextOracle;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Classifier {
    oracle: Arc<dyn TextOracle>,
}

impl Classifier {
    pub fn new(oracle: Arc<dyn TextOracle>) -> Self {
        Self { oracle }
    }

    /// Classify one observation. Never fails.
    pub async fn classify(&self, text: &str) -> BTreeSet<Category> {
        if text.trim().is_empty() {
            return BTreeSet::new();
        }

        match self.oracle.generate(&Self::prompt(text)).await {
            Ok(response) => {
                let categories = parse_categories(&response);
                debug!(
                    "Classified into [{}] from response {:?}",
                    join(&categories),
                    response
                );
                categories
            }
            Err(e) => {
                warn!("Classification failed, treating as no categories: {}", e);
                BTreeSet::new()
            }
        }
    }

    pub fn prompt(text: &str) -> String {
        let list = Category::ALL
            .iter()
            .map(|c| format!("- {}: {}", c.as_str(), c.describe()))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"Decide which of these categories the observation below is relevant to.

=== Categories ===
{list}

=== Observation ===
{text}

Reply with the matching category names separated by commas, for example:
commitments, people
Reply with "none" if no category applies. Output nothing else."#
        )
    }
}

/// Tokenize an oracle reply and keep only known category names.
pub fn parse_categories(response: &str) -> BTreeSet<Category> {
    response
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<Category>().ok())
        .collect()
}

fn join(categories: &BTreeSet<Category>) -> String {
    categories
        .iter()
        .map(Category::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

//! Text oracle: the external generative-text capability.
//!
//! Every caller treats the oracle as a black box returning unstructured text
//! and parses its output defensively. No call site names a provider; the
//! pipeline only sees `dyn TextOracle`.

mod http;

pub use http::HttpOracle;

use crate::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};

#[async_trait]
pub trait TextOracle: Send + Sync {
    /// Generate a completion for `prompt`. Timeouts surface as `Err`.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[async_trait]
impl<T: TextOracle + ?Sized> TextOracle for Arc<T> {
    async fn generate(&self, prompt: &str) -> Result<String> {
        (**self).generate(prompt).await
    }
}

fn think_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"))
}

/// Strip `<think>…</think>` blocks and a wrapping code fence from a response.
pub fn clean_response(raw: &str) -> String {
    let without_thinking = think_regex().replace_all(raw, "");
    let mut text = without_thinking.trim();

    // Unterminated reasoning block: nothing usable follows it
    if text.starts_with("<think>") {
        return String::new();
    }

    if text.starts_with("```") && text.ends_with("```") && text.len() >= 6 {
        text = &text[3..text.len() - 3];
        // Drop a language tag on the opening fence line
        if let Some(newline) = text.find('\n') {
            let tag = &text[..newline];
            if !tag.trim().contains(' ') {
                text = &text[newline + 1..];
            }
        }
    }

    text.trim().to_string()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_strips_think_block() {
        let raw = "<think>the user wants mood</think>\nmood";
        assert_eq!(clean_response(raw), "mood");
    }

    #[test]
    fn test_clean_unterminated_think() {
        assert_eq!(clean_response("<think>still reasoning"), "");
    }

    #[test]
    fn test_clean_code_fence() {
        let raw = "```markdown\n- Report for Marcus (due Friday)\n```";
        assert_eq!(clean_response(raw), "- Report for Marcus (due Friday)");
    }

    #[test]
    fn test_clean_plain_text_untouched() {
        assert_eq!(clean_response("  Feeling drained.  "), "Feeling drained.");
    }
}

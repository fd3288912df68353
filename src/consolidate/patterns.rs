//! Tolerant parsing of the pattern-detection reply.
//!
//! Expected shape is one pattern per line:
//!
//! ```text
//! pattern | frequency | category | significance
//! ```
//!
//! Also accepted: leading bullets or numbering, markdown table rows, `;` as
//! the separator, and `key: value` labelled fields in any order. Lines
//! without a pattern and a numeric frequency are dropped.

use crate::category::Category;
use crate::store::DetectedPattern;
use regex::Regex;
use std::sync::OnceLock;

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"))
}

fn list_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[-*•]+|\d+[.)])\s*").expect("static regex"))
}

#[derive(Default)]
struct Fields<'a> {
    pattern: Option<&'a str>,
    frequency: Option<&'a str>,
    category: Option<&'a str>,
    significance: Option<&'a str>,
}

pub fn parse_patterns(response: &str) -> Vec<DetectedPattern> {
    response.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<DetectedPattern> {
    let line = line.trim().trim_matches('|').trim();
    let line = list_marker_regex().replace(line, "");
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let separator = if line.contains('|') { '|' } else { ';' };
    let parts: Vec<&str> = line.split(separator).map(str::trim).collect();
    let fields = if parts.iter().any(|p| label_of(p).is_some()) {
        labelled(&parts)
    } else {
        positional(&parts)
    };

    let pattern = fields.pattern.map(clean).filter(|p| !p.is_empty())?;
    let frequency = number_regex()
        .find(fields.frequency?)?
        .as_str()
        .parse::<u32>()
        .ok()?;
    let category = fields.category.and_then(|c| clean(c).parse::<Category>().ok());
    let significance = fields.significance.map(clean).unwrap_or_default();

    Some(DetectedPattern {
        pattern,
        frequency,
        category,
        significance,
    })
}

fn positional<'a>(parts: &[&'a str]) -> Fields<'a> {
    Fields {
        pattern: parts.first().copied(),
        frequency: parts.get(1).copied(),
        category: parts.get(2).copied(),
        significance: parts.get(3).copied(),
    }
}

fn labelled<'a>(parts: &[&'a str]) -> Fields<'a> {
    let mut fields = Fields::default();
    for &part in parts {
        let Some((key, value)) = label_of(part) else {
            continue;
        };
        let slot = match key.as_str() {
            "pattern" | "theme" => &mut fields.pattern,
            "frequency" | "count" => &mut fields.frequency,
            "category" => &mut fields.category,
            "significance" | "why" => &mut fields.significance,
            _ => continue,
        };
        *slot = Some(value);
    }
    fields
}

/// Split `key: value` when `key` is a single word
fn label_of(part: &str) -> Option<(String, &str)> {
    let (key, value) = part.split_once(':')?;
    let key = clean(key).to_lowercase();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key, value.trim()))
}

fn clean(s: &str) -> String {
    s.trim().trim_matches(|c| c == '*' || c == '"' || c == '`').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_lines_with_bullets() {
        let reply = "- Late nights before deadlines | 3 | mood | sleep suffers under pressure\n\
                     2. Check-ins with Marcus | 2 | people | steady working relationship";
        let patterns = parse_patterns(reply);
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].pattern, "Late nights before deadlines");
        assert_eq!(patterns[0].frequency, 3);
        assert_eq!(patterns[0].category, Some(Category::Mood));
        assert_eq!(patterns[1].significance, "steady working relationship");
    }

    #[test]
    fn test_labelled_fields_any_order() {
        let reply = "frequency: 4; pattern: Skipping the gym; significance: energy dips; category: Mood";
        let patterns = parse_patterns(reply);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern, "Skipping the gym");
        assert_eq!(patterns[0].frequency, 4);
        assert_eq!(patterns[0].category, Some(Category::Mood));
    }

    #[test]
    fn test_markdown_table_drops_header_and_rule() {
        let reply = "| pattern | frequency | category | significance |\n\
                     |---|---|---|---|\n\
                     | Budget worries | 2 times | tensions | recurring |";
        let patterns = parse_patterns(reply);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].frequency, 2);
        assert_eq!(patterns[0].category, Some(Category::Tensions));
    }

    #[test]
    fn test_unknown_category_becomes_none() {
        let patterns = parse_patterns("Rainy weekends | 2 | weather | stays in");
        assert_eq!(patterns[0].category, None);
    }

    #[test]
    fn test_prose_is_dropped() {
        assert!(parse_patterns("I could not find any recurring themes this week.").is_empty());
        assert!(parse_patterns("").is_empty());
    }
}

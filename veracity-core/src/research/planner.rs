//! Query planning: turn the research question into search sub-queries.

use std::sync::LazyLock;

use regex::Regex;

use super::session::ResearchMode;

/// Splits a research question into the sub-queries sent to search.
#[derive(Debug, Clone, Default)]
pub struct QueryPlanner;

impl QueryPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Sub-queries for `query`, deduplicated case-insensitively, original first.
    pub fn plan(&self, query: &str, mode: ResearchMode) -> Vec<String> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        let mut plan = vec![
            query.to_string(),
            format!("{query} recent research"),
            format!("{query} evidence"),
        ];
        if mode == ResearchMode::Deep {
            plan.push(format!("{query} criticism"));
        }
        plan.extend(split_compound(query));

        let mut seen = std::collections::HashSet::new();
        plan.retain(|q| seen.insert(q.to_lowercase()));
        plan
    }
}

static COMPOUND_SEPARATOR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\s+(?:versus|vs\.?|and)\s+").ok());

/// Parts of a comparative or compound question ("A vs B", "A and B").
fn split_compound(question: &str) -> Vec<String> {
    let Some(separator) = COMPOUND_SEPARATOR.as_ref() else {
        return Vec::new();
    };
    let trimmed = question.trim_end_matches(['?', '.', '!']);
    let parts: Vec<&str> = separator.splitn(trimmed, 2).map(str::trim).collect();
    if parts.len() < 2 {
        return Vec::new();
    }
    parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_standard_plan() {
        let plan = QueryPlanner::new().plan("Is coffee healthy?", ResearchMode::Standard);
        assert_eq!(
            plan,
            vec![
                "Is coffee healthy?".to_string(),
                "Is coffee healthy? recent research".to_string(),
                "Is coffee healthy? evidence".to_string(),
            ]
        );
    }

    #[test]
    fn test_deep_adds_criticism() {
        let plan = QueryPlanner::new().plan("coffee", ResearchMode::Deep);
        assert_eq!(plan.last().map(String::as_str), Some("coffee criticism"));
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn test_comparative_split() {
        let plan = QueryPlanner::new().plan("Rust vs Go for web servers?", ResearchMode::Quick);
        assert!(plan.contains(&"Rust".to_string()));
        assert!(plan.contains(&"Go for web servers".to_string()));
    }

    #[test]
    fn test_empty_query() {
        assert!(QueryPlanner::new().plan("   ", ResearchMode::Quick).is_empty());
    }
}

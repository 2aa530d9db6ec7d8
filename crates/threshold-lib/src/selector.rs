//! Service and KPI selectors
//!
//! A selector is either a literal id or a case-insensitive title pattern in
//! which `*` stands for any substring. An empty selector list matches
//! everything.

use regex::Regex;

use crate::error::{Result, ThresholdError};

/// Compile a wildcard title pattern into an anchored, case-insensitive regex.
///
/// Everything except `*` is matched literally.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    format!("(?i)^{}$", body)
}

/// Compiled selector list
#[derive(Debug, Clone)]
pub struct SelectorMatcher {
    selectors: Vec<String>,
    patterns: Vec<Regex>,
}

impl SelectorMatcher {
    pub fn new(selectors: &[String]) -> Result<Self> {
        let patterns = selectors
            .iter()
            .map(|s| {
                Regex::new(&wildcard_to_regex(s)).map_err(|e| {
                    ThresholdError::InvalidArgument(format!("invalid selector {:?}: {}", s, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            selectors: selectors.to_vec(),
            patterns,
        })
    }

    /// Matches every id and title
    pub fn any() -> Self {
        Self {
            selectors: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    /// True when the id equals a selector or the title matches a pattern
    pub fn matches(&self, id: &str, title: &str) -> bool {
        if self.selectors.is_empty() {
            return true;
        }
        if self.selectors.iter().any(|s| s == id) {
            return true;
        }
        self.patterns.iter().any(|re| re.is_match(title))
    }

    /// Selectors for display; `*` stands for an empty list
    pub fn display(&self) -> Vec<String> {
        display_selectors(&self.selectors)
    }
}

/// Selectors for display; `*` stands for an empty list
pub fn display_selectors(selectors: &[String]) -> Vec<String> {
    if selectors.is_empty() {
        vec!["*".to_string()]
    } else {
        selectors.to_vec()
    }
}

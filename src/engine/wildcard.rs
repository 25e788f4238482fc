//! `*` wildcard patterns used by sender and subject conditions

use regex::{Regex, RegexBuilder};

use crate::error::{FlowError, Result};

/// Case-insensitive whole-string pattern where `*` matches any sequence
/// (including none). Every other character is literal.
#[derive(Debug, Clone)]
pub struct Wildcard {
    regex: Regex,
}

impl Wildcard {
    pub fn new(pattern: &str) -> Result<Self> {
        let body = pattern
            .trim()
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = RegexBuilder::new(&format!("^{}$", body))
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| FlowError::InvalidInput(format!("Bad pattern '{}': {}", pattern, e)))?;
        Ok(Self { regex })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text.trim())
    }
}

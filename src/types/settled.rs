//! Outcome of a batch where each item may fail on its own

use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settled<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<FailedItem>,
}

impl<T> Default for Settled<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> Settled<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&mut self, value: T) {
        self.succeeded.push(value);
    }

    pub fn err(&mut self, item: impl Into<String>, error: impl Display) {
        self.failed.push(FailedItem {
            item: item.into(),
            error: error.to_string(),
        });
    }

    pub fn record<E: Display>(&mut self, item: impl Into<String>, result: Result<T, E>) {
        match result {
            Ok(value) => self.ok(value),
            Err(e) => self.err(item, e),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl<T, E: Display> FromIterator<(String, Result<T, E>)> for Settled<T> {
    fn from_iter<I: IntoIterator<Item = (String, Result<T, E>)>>(iter: I) -> Self {
        let mut settled = Settled::new();
        for (item, result) in iter {
            settled.record(item, result);
        }
        settled
    }
}

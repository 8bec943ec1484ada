// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT topic filters.
//!
//! Filters are `/`-separated levels where `+` stands for exactly one level
//! and a trailing `#` for any number of levels. They are validated here and
//! handed to the broker as is; dispatch itself works on literal prefixes.

use std::fmt;
use thiserror::Error;

/// Invalid subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid topic filter '{filter}': {reason}")]
pub struct InvalidTopicFilter {
    pub filter: String,
    pub reason: &'static str,
}

/// A validated subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter(String);

impl TopicFilter {
    /// Validate a filter string.
    pub fn new(filter: impl Into<String>) -> Result<Self, InvalidTopicFilter> {
        let filter = filter.into();
        let invalid = |reason| InvalidTopicFilter {
            filter: filter.clone(),
            reason,
        };

        if filter.is_empty() {
            return Err(invalid("empty filter"));
        }
        if filter.contains('\0') {
            return Err(invalid("contains NUL"));
        }

        let levels: Vec<&str> = filter.split('/').collect();
        let last = levels.len() - 1;
        for (i, level) in levels.iter().enumerate() {
            if level.contains('#') && (*level != "#" || i != last) {
                return Err(invalid("'#' must be the whole last level"));
            }
            if level.contains('+') && *level != "+" {
                return Err(invalid("'+' must be a whole level"));
            }
        }

        Ok(Self(filter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

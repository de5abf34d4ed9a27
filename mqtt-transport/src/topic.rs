//! MQTT topic filter validation and matching.
//!
//! Filters follow the MQTT 3.1.1 rules: levels are separated by `/`, `+`
//! matches exactly one level and `#` matches any number of trailing levels
//! (including none) and must be the last level.

use crate::error::{Result, TransportError};

/// A validated MQTT topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter(String);

impl TopicFilter {
    /// Parse and validate a topic filter.
    pub fn new(filter: impl Into<String>) -> Result<Self> {
        let filter = filter.into();
        validate_filter(&filter)?;
        Ok(Self(filter))
    }

    /// Get the filter as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a concrete topic name matches this filter.
    pub fn matches(&self, topic: &str) -> bool {
        matches_filter(&self.0, topic)
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(TransportError::InvalidTopicFilter(
            "filter must not be empty".to_string(),
        ));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(TransportError::InvalidTopicFilter(format!(
                "'#' must occupy the whole last level in {filter}"
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(TransportError::InvalidTopicFilter(format!(
                "'+' must occupy a whole level in {filter}"
            )));
        }
    }

    Ok(())
}

/// Check whether `topic` matches the MQTT `filter`.
///
/// The filter is assumed valid; topics starting with `$` are never matched
/// by a leading wildcard.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

//! # Work Unit Value Objects
//!
//! A work unit is one addressable item of work (a list page, a search term, a product id)
//! tracked to a terminal state. Keys compare case- and whitespace-insensitively so the
//! same item enumerated as `"Foo  Bar"` and `"foo bar"` is only ever processed once.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named result counters reported by an extractor (e.g. `"products" => 12`).
pub type ResultCounts = BTreeMap<String, u64>;

/// Normalized work unit key.
///
/// Equality, ordering and hashing use the normalized form only; the original spelling is
/// kept so extractors can build case-sensitive URLs from it.
#[derive(Debug, Clone)]
pub struct WorkKey {
    normalized: String,
    original: String,
}

impl WorkKey {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let original = raw.into();
        Self {
            normalized: normalize_key(&original),
            original,
        }
    }

    /// Normalized form, used as the checkpoint map key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// Spelling as first enumerated
    #[must_use]
    pub fn original(&self) -> &str {
        &self.original
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }
}

impl PartialEq for WorkKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for WorkKey {}

impl Hash for WorkKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl PartialOrd for WorkKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl From<&str> for WorkKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for WorkKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Trim, collapse internal whitespace runs to one space, lowercase.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lifecycle status of a work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Pending,
    InProgress,
    Success,
    ZeroResult,
    Failed,
}

impl UnitStatus {
    /// `success` and `zero_result` are never re-attempted by a resume.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::ZeroResult)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::ZeroResult => "zero_result",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one work unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkUnit {
    /// Original spelling of the key
    pub key: String,
    pub status: UnitStatus,
    /// Number of recorded failures
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result_counts: ResultCounts,
    /// Why the extractor reported no data, for `zero_result` units
    pub zero_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnit {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Sum of all result counters
    #[must_use]
    pub fn extracted(&self) -> u64 {
        self.result_counts.values().sum()
    }
}

impl Default for WorkUnit {
    fn default() -> Self {
        Self {
            key: String::new(),
            status: UnitStatus::Pending,
            attempts: 0,
            last_error: None,
            result_counts: ResultCounts::new(),
            zero_reason: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;

    #[rstest]
    #[case("Foo Bar", "foo bar")]
    #[case("  foo   bar  ", "foo bar")]
    #[case("FOO\tBAR\n", "foo bar")]
    #[case("page-17", "page-17")]
    #[case("", "")]
    fn normalizes_case_and_whitespace(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(WorkKey::new(raw).as_str(), expected);
    }

    #[test]
    fn equality_ignores_spelling_but_keeps_original() {
        let a = WorkKey::new("Smart  Plug");
        let b = WorkKey::new("smart plug");
        assert_eq!(a, b);
        assert_eq!(a.original(), "Smart  Plug");

        let set: HashSet<WorkKey> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn terminal_statuses() {
        assert!(UnitStatus::Success.is_terminal());
        assert!(UnitStatus::ZeroResult.is_terminal());
        assert!(!UnitStatus::Failed.is_terminal());
        assert!(!UnitStatus::InProgress.is_terminal());
        assert!(!UnitStatus::Pending.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&UnitStatus::ZeroResult).unwrap();
        assert_eq!(json, "\"zero_result\"");
    }
}

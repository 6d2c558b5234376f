//! 작업 단위 추출기 트레이트
//!
//! Extraction reports a tagged outcome. "Page not found" and other structural absences
//! are [`ExtractionOutcome::ZeroResult`], never an error.

use thiserror::Error;

use crate::domain::identity::Identity;
use crate::domain::services::browser_session::BrowserSession;
use crate::domain::work_unit::{ResultCounts, WorkKey};

/// Failure classes the pool reacts to differently
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// Transient; retried in place with the same identity and session
    #[error("timed out: {0}")]
    Timeout(String),

    /// Block or challenge page; triggers an identity rotation
    #[error("blocked: {0}")]
    Blocked(String),

    #[error("{0}")]
    Other(String),
}

impl ExtractionError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Success { counts: ResultCounts },
    ZeroResult { reason: String },
    Failed(ExtractionError),
}

impl ExtractionOutcome {
    /// Success with a single named counter
    #[must_use]
    pub fn success_with(name: &str, count: u64) -> Self {
        let mut counts = ResultCounts::new();
        counts.insert(name.to_string(), count);
        Self::Success { counts }
    }
}

/// Stage-specific scraping logic
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        key: &WorkKey,
        session: &mut dyn BrowserSession,
        identity: &Identity,
    ) -> ExtractionOutcome;
}

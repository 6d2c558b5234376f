//! 브라우저 세션 협력자 트레이트
//!
//! The coordinator never drives a browser itself; scraper crates plug in a factory that
//! opens sessions (webdriver + browser) for a given identity.

use thiserror::Error;

use crate::domain::identity::Identity;

/// Session-level failures reported by the browser adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("failed to open browser session: {0}")]
    Open(String),

    #[error("authentication failed for identity {identity}: {reason}")]
    Authentication { identity: String, reason: String },

    #[error("session is not available: {0}")]
    Unavailable(String),

    #[error("failed to close session: {0}")]
    Close(String),
}

/// A live browser session owned by exactly one worker
pub trait BrowserSession: Send {
    /// Cheap liveness check (window handle / title query)
    fn is_alive(&mut self) -> bool;

    /// OS pids of the driver and browser processes behind this session
    fn pids(&self) -> Vec<u32>;

    /// Log in / present credentials for `identity`
    fn authenticate(&mut self, identity: &Identity) -> Result<(), SessionError>;

    fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens sessions for identities
pub trait SessionFactory: Send + Sync {
    fn open(&self, identity: &Identity) -> Result<Box<dyn BrowserSession>, SessionError>;
}

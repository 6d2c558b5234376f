//! Domain services
//!
//! Collaborator interfaces implemented by scraper crates.

pub mod browser_session;
pub mod extractor;

pub use browser_session::{BrowserSession, SessionError, SessionFactory};
pub use extractor::{ExtractionError, ExtractionOutcome, Extractor};

//! Domain layer
//!
//! Work units, identities and the collaborator traits the coordinator drives.

pub mod identity;
pub mod services;
pub mod work_unit;

pub use identity::{Identity, IdentityCursor, IdentityPool};
pub use services::{
    BrowserSession, ExtractionError, ExtractionOutcome, Extractor, SessionError, SessionFactory,
};
pub use work_unit::{ResultCounts, UnitStatus, WorkKey, WorkUnit, normalize_key};

//! # Crawling Module
//!
//! Runtime side of the coordinator:
//! - `queues`: bounded work queue shared by a pool's workers
//! - `rate_limiter`: batch window plus per-key cadence
//! - `session_guard`: browser session liveness and recreation
//! - `workers`: OS-thread worker pool for one stage
//! - `orchestrator`: ordered stages with resume and verification

// 명시적 모듈 선언 (mod.rs 비사용)
pub mod orchestrator;
pub mod queues;
pub mod rate_limiter;
pub mod session_guard;
pub mod state;
pub mod workers;

pub use orchestrator::{
    OrchestratorContext, Pipeline, PipelineError, PipelineOutcome, PipelineReport,
    StageDefinition, StageOrchestrator, StageSummary, StartPoint,
};
pub use queues::{QueueConfig, QueueError};
pub use rate_limiter::{CadenceScope, RateLimitConfig, RateLimiter};
pub use session_guard::{GuardError, SessionGuard};
pub use state::{PoolReport, SharedState};
pub use workers::{PoolDependencies, PoolError, WorkerPool, WorkerPoolConfig};

//! chorus-core: orchestration and memory-consistency layer shared by every
//! chorus service.
//!
//! Request deduplication with failure blackout, asynchronous jobs with
//! at-most-once result delivery, the layered config cascade, memory retrieval
//! with lock/visibility semantics, and cache invalidation fan-out. Service
//! binaries wire these together around a [`orchestrator::GenerationOrchestrator`].

pub mod cascade;
pub mod config;
pub mod config_cache;
pub mod dedup;
pub mod error;
pub mod events;
pub mod history;
pub mod jobs;
pub mod memory;
pub mod orchestrator;
pub mod providers;
pub mod types;

pub use error::{CoreError, Result};

//! HTTP route handlers.
//!
//! - `health`: liveness, readiness and the comprehensive health surface
//! - `ai`: capability submission endpoints
//! - `jobs`: job lookup, listing and cancellation

pub mod ai;
pub mod health;
pub mod jobs;

pub use ai::{data_process, llm_chat, llm_completion, nlp_process, vision_analyze};
pub use health::{comprehensive, health, live, metrics, ready};
pub use jobs::{delete_job, get_job, list_jobs};

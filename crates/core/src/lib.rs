//! Domain types and pure logic for the jokbo job orchestrator.
//!
//! This crate has no internal dependencies and performs no I/O.

pub mod error;
pub mod job;
pub mod live_task;
pub mod mode;
pub mod progress;
pub mod quota;
pub mod task;
pub mod types;

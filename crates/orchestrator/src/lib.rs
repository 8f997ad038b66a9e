//! Job orchestration and batch coordination.
//!
//! Components, leaves first: [`registry`], [`dispatcher`], [`progress`],
//! [`cancellation`], [`reconciler`], [`quota`]. [`service::Orchestrator`]
//! composes them into the caller-facing operations. All coordination goes
//! through the [`store::JobStore`] and [`queue::TaskQueue`] seams; nothing
//! here holds in-process locks across requests.

pub mod access;
pub mod background;
pub mod cancellation;
pub mod config;
pub mod dispatcher;
pub mod file_refs;
pub mod progress;
pub mod queue;
pub mod quota;
pub mod reconciler;
pub mod registry;
pub mod service;
pub mod store;

pub use config::OrchestratorConfig;
pub use service::Orchestrator;

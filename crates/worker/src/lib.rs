//! Worker side of the jokbo orchestrator.
//!
//! [`runtime::WorkerRuntime`] claims tasks from the queue and runs them
//! through the registered [`handlers`], enforcing time limits, forwarding
//! revoke requests and reporting every outcome back to the queue. The
//! external analysis service and file store are reached through the
//! [`analyzer`] and [`documents`] seams.

pub mod analyzer;
pub mod backoff;
pub mod config;
pub mod documents;
pub mod error;
pub mod handlers;
pub mod runtime;

pub use config::WorkerConfig;
pub use error::TaskError;
pub use runtime::WorkerRuntime;

//! Row models.
//!
//! Each submodule contains a `FromRow` struct matching the table and, where
//! the domain has a richer type, a conversion into the `jokbo-core` type.

pub mod job;
pub mod progress;
pub mod queue;
pub mod quota;
pub mod result;
pub mod user_job;

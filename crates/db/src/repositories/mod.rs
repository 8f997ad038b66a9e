//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod cancellation_repo;
pub mod job_repo;
pub mod progress_repo;
pub mod queue_repo;
pub mod quota_repo;
pub mod result_repo;
pub mod user_job_repo;

pub use cancellation_repo::CancellationRepo;
pub use job_repo::JobRepo;
pub use progress_repo::ProgressRepo;
pub use queue_repo::QueueRepo;
pub use quota_repo::QuotaRepo;
pub use result_repo::ResultRepo;
pub use user_job_repo::UserJobRepo;

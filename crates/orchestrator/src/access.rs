//! Who is asking, and whether they may touch a job.

use jokbo_core::error::CoreError;
use jokbo_core::job::Job;
use jokbo_core::types::UserId;

/// The caller of a job-scoped operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    /// An authenticated end user.
    User(UserId),
    /// Administrative tooling. Bypasses ownership checks.
    Operator,
}

impl Requester {
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Requester::User(user_id.into())
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Requester::User(id) => Some(id),
            Requester::Operator => None,
        }
    }

    /// Ownership check for a job.
    ///
    /// Jobs created without an owner can only be managed by an operator.
    pub fn authorize(&self, job: &Job) -> Result<(), CoreError> {
        match self {
            Requester::Operator => Ok(()),
            Requester::User(user_id) if job.is_owned_by(user_id) => Ok(()),
            Requester::User(_) => Err(CoreError::Forbidden(format!(
                "Not authorized for job {}",
                job.job_id
            ))),
        }
    }

    /// Check access to another user's data, such as their job list.
    pub fn authorize_user(&self, user_id: &str) -> Result<(), CoreError> {
        match self {
            Requester::Operator => Ok(()),
            Requester::User(own) if own == user_id => Ok(()),
            Requester::User(_) => Err(CoreError::Forbidden(format!(
                "Not authorized for user {user_id}"
            ))),
        }
    }
}

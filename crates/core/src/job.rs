//! Job records and submission input.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::mode::{AnalysisMode, ModelTier};
use crate::types::{JobId, TaskId, Timestamp, UserId};

/// Upper bound (inclusive) for `min_relevance`.
pub const MIN_RELEVANCE_MAX: i32 = 110;

/// Default relevance threshold applied by the submission surface.
pub const DEFAULT_MIN_RELEVANCE: i32 = 80;

/// Maximum number of input files per side.
const MAX_INPUT_FILES: usize = 64;

/// Maximum length of a single file key.
const MAX_FILE_KEY_LEN: usize = 512;

/// Content-addressed, TTL-bound file keys referenced by a job.
///
/// The file store owns the lifetime of the files; a job only holds keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRefs {
    /// Files iterated one unit at a time.
    pub primary: Vec<String>,
    /// Files every unit is analysed against.
    pub counterpart: Vec<String>,
}

impl InputRefs {
    pub fn all_keys(&self) -> Vec<String> {
        self.primary
            .iter()
            .chain(self.counterpart.iter())
            .cloned()
            .collect()
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub mode: AnalysisMode,
    pub owner_user_id: Option<UserId>,
    pub input_refs: InputRefs,
    pub model_tier: ModelTier,
    pub multi_api: bool,
    pub min_relevance: Option<i32>,
    /// Created but not yet dispatched.
    pub is_preflight: bool,
    pub is_batch: bool,
    /// Per-unit mode of a batch job.
    pub batch_unit_mode: Option<AnalysisMode>,
    /// Unit count estimated at preflight, if any.
    pub estimated_units: Option<u32>,
    /// Set once dispatch occurs.
    pub bound_task_id: Option<TaskId>,
    pub created_at: Timestamp,
}

impl Job {
    /// Build a fresh job record from validated input.
    pub fn from_new(input: NewJob, now: Timestamp) -> Result<Self, CoreError> {
        input.validate()?;
        let is_batch = input.is_batch || input.mode == AnalysisMode::Batch;
        let batch_unit_mode = if is_batch {
            Some(match input.mode {
                AnalysisMode::Batch => AnalysisMode::JokboCentric,
                other => other,
            })
        } else {
            None
        };
        Ok(Self {
            job_id: JobId::generate(),
            mode: input.mode,
            owner_user_id: input.owner_user_id,
            input_refs: input.input_refs,
            model_tier: input.model_tier,
            multi_api: input.multi_api,
            min_relevance: input.min_relevance,
            is_preflight: true,
            is_batch,
            batch_unit_mode,
            estimated_units: input.estimated_units,
            bound_task_id: None,
            created_at: now,
        })
    }

    /// Number of independently tracked units this job will report.
    ///
    /// One unit per primary file, whatever the mode.
    pub fn unit_count(&self) -> u32 {
        self.input_refs.primary.len().max(1) as u32
    }

    /// A job with no bound task has never been dispatched.
    pub fn is_draft(&self) -> bool {
        self.bound_task_id.is_none()
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_user_id.as_deref() == Some(user_id)
    }
}

/// Input for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub mode: AnalysisMode,
    pub owner_user_id: Option<UserId>,
    pub input_refs: InputRefs,
    #[serde(default)]
    pub model_tier: ModelTier,
    #[serde(default)]
    pub multi_api: bool,
    pub min_relevance: Option<i32>,
    #[serde(default)]
    pub is_batch: bool,
    pub estimated_units: Option<u32>,
}

impl NewJob {
    /// Validate bounds and input shape for the requested mode.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_min_relevance(self.min_relevance)?;
        validate_file_keys("primary", &self.input_refs.primary)?;
        validate_file_keys("counterpart", &self.input_refs.counterpart)?;

        if self.input_refs.primary.is_empty() {
            return Err(CoreError::Validation(
                "At least one primary input file is required".to_string(),
            ));
        }
        if self.mode.requires_counterparts() && self.input_refs.counterpart.is_empty() {
            return Err(CoreError::Validation(format!(
                "Mode {} requires at least one counterpart file",
                self.mode
            )));
        }
        if self.is_batch && !self.mode.is_batchable() && self.mode != AnalysisMode::Batch {
            return Err(CoreError::Validation(format!(
                "Mode {} cannot be run as a batch",
                self.mode
            )));
        }
        if let Some(0) = self.estimated_units {
            return Err(CoreError::Validation(
                "Estimated units must be at least 1".to_string(),
            ));
        }
        if let Some(owner) = &self.owner_user_id {
            if owner.trim().is_empty() {
                return Err(CoreError::Validation(
                    "Owner user id must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Validate an optional relevance threshold against `0..=MIN_RELEVANCE_MAX`.
pub fn validate_min_relevance(value: Option<i32>) -> Result<(), CoreError> {
    match value {
        Some(v) if !(0..=MIN_RELEVANCE_MAX).contains(&v) => Err(CoreError::Validation(format!(
            "min_relevance must be between 0 and {MIN_RELEVANCE_MAX}, got {v}"
        ))),
        _ => Ok(()),
    }
}

fn validate_file_keys(side: &str, keys: &[String]) -> Result<(), CoreError> {
    if keys.len() > MAX_INPUT_FILES {
        return Err(CoreError::Validation(format!(
            "At most {MAX_INPUT_FILES} {side} files are allowed"
        )));
    }
    for (i, key) in keys.iter().enumerate() {
        if key.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "{side} file key at index {i} must not be empty"
            )));
        }
        if key.len() > MAX_FILE_KEY_LEN {
            return Err(CoreError::Validation(format!(
                "{side} file key at index {i} exceeds {MAX_FILE_KEY_LEN} characters"
            )));
        }
    }
    Ok(())
}

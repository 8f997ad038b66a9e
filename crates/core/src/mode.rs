//! Analysis modes and model tiers.
//!
//! Both arrive as string tags from the outer surface. They are parsed once
//! at the boundary; everything past that point matches on the enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How a job's inputs are analysed against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    /// Each exam (jokbo) file is analysed against all lecture files.
    JokboCentric,
    /// Each lecture file is analysed against all exam files.
    LessonCentric,
    /// Extract only the exam pages relevant to the lectures.
    PartialJokbo,
    /// Exam files only, split into question groups.
    ExamOnly,
    /// Fan-out of jokbo-centric units, one subtask per primary file.
    Batch,
}

impl AnalysisMode {
    pub const ALL: [AnalysisMode; 5] = [
        AnalysisMode::JokboCentric,
        AnalysisMode::LessonCentric,
        AnalysisMode::PartialJokbo,
        AnalysisMode::ExamOnly,
        AnalysisMode::Batch,
    ];

    /// Wire tag for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMode::JokboCentric => "jokbo-centric",
            AnalysisMode::LessonCentric => "lesson-centric",
            AnalysisMode::PartialJokbo => "partial-jokbo",
            AnalysisMode::ExamOnly => "exam-only",
            AnalysisMode::Batch => "batch",
        }
    }

    /// Whether a job in this mode needs a non-empty counterpart set.
    pub fn requires_counterparts(self) -> bool {
        match self {
            AnalysisMode::JokboCentric
            | AnalysisMode::LessonCentric
            | AnalysisMode::PartialJokbo
            | AnalysisMode::Batch => true,
            AnalysisMode::ExamOnly => false,
        }
    }

    /// Whether this mode can be used as the per-unit mode of a batch.
    pub fn is_batchable(self) -> bool {
        matches!(
            self,
            AnalysisMode::JokboCentric | AnalysisMode::LessonCentric
        )
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalysisMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| CoreError::Validation(format!("Unsupported mode: \"{s}\"")))
    }
}

/// Which model tier the external analyzer should use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    #[default]
    Flash,
    Pro,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Flash => "flash",
            ModelTier::Pro => "pro",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flash" => Ok(ModelTier::Flash),
            "pro" => Ok(ModelTier::Pro),
            other => Err(CoreError::Validation(format!(
                "Unsupported model tier: \"{other}\""
            ))),
        }
    }
}

use thiserror::Error;

use crate::lifecycle::PipelineState;
use crate::topology::StageRole;

/// Process exit code for a clean run.
pub const EXIT_OK: i32 = 0;
/// Process exit code when the command line cannot be parsed.
pub const EXIT_USAGE: i32 = 1;
/// Process exit code for configuration, assembly and runtime failures.
pub const EXIT_FAILURE: i32 = -1;

/// Failures that abort startup or a run.
///
/// Annotation export problems are absent: they are scoped to a
/// single frame and never leave the redaction engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not create {role} stage from factory '{factory}': {reason}")]
    StageConstruction {
        role: StageRole,
        factory: String,
        reason: String,
    },

    #[error("could not link {upstream} -> {downstream}: {reason}")]
    Link {
        upstream: StageRole,
        downstream: StageRole,
        reason: String,
    },

    #[error("graph refused transition to {0:?}")]
    StateChange(PipelineState),

    #[error("stream error from {stage}: {message}")]
    Stream { stage: String, message: String },
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }
}

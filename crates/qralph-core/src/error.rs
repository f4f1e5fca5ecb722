use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// PhaseError
// ---------------------------------------------------------------------------

/// A refused transition. Never accompanied by a state mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("cannot move from {from} to {to}: {reason}")]
pub struct PhaseError {
    pub from: String,
    pub to: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_precondition: Option<String>,
}

impl PhaseError {
    pub fn illegal(from: impl ToString, to: impl ToString) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            reason: "no such edge in the transition graph".to_string(),
            missing_precondition: None,
        }
    }

    pub fn unmet(
        from: impl ToString,
        to: impl ToString,
        reason: impl Into<String>,
        missing: impl Into<String>,
    ) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.into(),
            missing_precondition: Some(missing.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// CorruptionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("corrupt file {path}: {reason}")]
pub struct CorruptionError {
    pub path: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// RecoveryError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("no valid checkpoint for project '{0}'")]
    NoValidCheckpoint(String),

    /// Rollback had no target after the healing budget ran out. Needs a human.
    #[error("fatal recovery failure for '{project}': {reason}; human intervention required")]
    Fatal { project: String, reason: String },
}

// ---------------------------------------------------------------------------
// QralphError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QralphError {
    #[error("not initialized: run 'qralph init'")]
    NotInitialized,

    #[error("no project selected: pass --project or run 'qralph init'")]
    NoProject,

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    ProjectExists(String),

    #[error("invalid project id '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidProjectId(String),

    #[error("request text is empty")]
    EmptyRequest,

    #[error("invalid phase: {0}")]
    InvalidPhase(String),

    #[error("invalid mode '{0}': must be coding or work")]
    InvalidMode(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Corruption(#[from] CorruptionError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("lock contention on '{scope}': held by pid {holder}")]
    LockContention { scope: String, holder: String },

    #[error("lock not held: mutation on '{expected}' with a guard for '{actual}'")]
    LockNotHeld { expected: String, actual: String },

    #[error("'{operation}' needs phase {expected}; project is in {actual}")]
    WrongPhase {
        operation: String,
        expected: String,
        actual: String,
    },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("finding not found: {0}")]
    FindingNotFound(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("verification could not run: {0}")]
    Verify(String),

    #[error("search error: {0}")]
    Search(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl QralphError {
    /// True when the failure means required files could not be read or
    /// written, or the exclusive lock could not be taken.
    pub fn is_environment_failure(&self) -> bool {
        matches!(
            self,
            QralphError::NotInitialized
                | QralphError::NoProject
                | QralphError::ProjectNotFound(_)
                | QralphError::Corruption(_)
                | QralphError::Recovery(_)
                | QralphError::LockContention { .. }
                | QralphError::LockNotHeld { .. }
                | QralphError::Io(_)
                | QralphError::Yaml(_)
                | QralphError::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QralphError>;

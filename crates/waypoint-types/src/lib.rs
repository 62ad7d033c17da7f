//! Shared types and errors for the Waypoint workflow engine.
//!
//! This crate provides the foundational types used across all other Waypoint crates:
//! - `WaypointError` — unified error taxonomy
//! - `WorkflowSession` — the canonical, persisted record of one workflow run
//! - `PatternDefinition` / `PatternMatch` — scan rules and their concrete hits

pub mod pattern;
pub mod session;

pub use pattern::{ClassifierRule, DiscoverySummary, PatternDefinition, PatternFlags, PatternMatch};
pub use session::{
    ChecklistItem, ChecklistItemKind, FileClass, FileEntry, FileStatus, Finding, ItemStatus,
    Phase, PhaseMode, PhaseStatus, PhaseTask, ProposedChange, SessionCounters, SessionProgress,
    SessionStatus, Severity, WorkflowSession,
};

use serde::{Deserialize, Serialize};

/// Unified error type for all Waypoint subsystems.
#[derive(Debug, thiserror::Error)]
pub enum WaypointError {
    // === Configuration Errors ===
    #[error("Unknown workflow type '{workflow_type}'")]
    UnknownWorkflowType { workflow_type: String },

    #[error("Workflow '{workflow_type}' requires option '{option}'")]
    MissingRequiredOption {
        workflow_type: String,
        option: String,
    },

    #[error("No files under '{root}' match the workflow's include patterns")]
    EmptyScope { root: String },

    #[error("Invalid workflow definition '{workflow_type}': {message}")]
    InvalidDefinition {
        workflow_type: String,
        message: String,
    },

    #[error("Workflow type '{workflow_type}' is built in and override was not permitted")]
    DefinitionConflict { workflow_type: String },

    #[error("Built-in workflow type '{workflow_type}' cannot be unregistered")]
    CannotUnregisterBuiltin { workflow_type: String },

    // === Scan Errors ===
    #[error("Invalid pattern '{pattern_id}': {message}")]
    InvalidPattern { pattern_id: String, message: String },

    // === State Errors ===
    #[error("Session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    #[error("Invalid completed action '{action_id}': {reason}")]
    InvalidCompletedAction { action_id: String, reason: String },

    #[error("Invalid batch operation '{operation}'")]
    InvalidOperation { operation: String },

    #[error("Confirmation token '{token}' is invalid or expired; run a new dry run")]
    InvalidOrExpiredToken { token: String },

    #[error("Session '{session_id}' was modified concurrently (expected version {expected}, found {found})")]
    ConcurrentModification {
        session_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Session '{session_id}' is {status} and accepts no further progress")]
    SessionClosed { session_id: String, status: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse error taxonomy used by callers to decide how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller input must be corrected; never retried.
    Configuration,
    /// Session or token state does not permit the request; re-fetch and retry.
    State,
    /// A file or pattern could not be processed.
    Scan,
    Internal,
}

impl WaypointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WaypointError::UnknownWorkflowType { .. }
            | WaypointError::MissingRequiredOption { .. }
            | WaypointError::EmptyScope { .. }
            | WaypointError::InvalidDefinition { .. }
            | WaypointError::DefinitionConflict { .. }
            | WaypointError::CannotUnregisterBuiltin { .. } => ErrorKind::Configuration,
            WaypointError::SessionNotFound { .. }
            | WaypointError::InvalidCompletedAction { .. }
            | WaypointError::InvalidOperation { .. }
            | WaypointError::InvalidOrExpiredToken { .. }
            | WaypointError::ConcurrentModification { .. }
            | WaypointError::SessionClosed { .. } => ErrorKind::State,
            WaypointError::InvalidPattern { .. } => ErrorKind::Scan,
            WaypointError::Io(_) | WaypointError::Json(_) | WaypointError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            WaypointError::UnknownWorkflowType { .. } => "unknown_workflow_type",
            WaypointError::MissingRequiredOption { .. } => "missing_required_option",
            WaypointError::EmptyScope { .. } => "empty_scope",
            WaypointError::InvalidDefinition { .. } => "invalid_definition",
            WaypointError::DefinitionConflict { .. } => "definition_conflict",
            WaypointError::CannotUnregisterBuiltin { .. } => "cannot_unregister_builtin",
            WaypointError::InvalidPattern { .. } => "invalid_pattern",
            WaypointError::SessionNotFound { .. } => "session_not_found",
            WaypointError::InvalidCompletedAction { .. } => "invalid_completed_action",
            WaypointError::InvalidOperation { .. } => "invalid_operation",
            WaypointError::InvalidOrExpiredToken { .. } => "invalid_or_expired_token",
            WaypointError::ConcurrentModification { .. } => "concurrent_modification",
            WaypointError::SessionClosed { .. } => "session_closed",
            WaypointError::Io(_) => "io",
            WaypointError::Json(_) => "json",
            WaypointError::Other(_) => "other",
        }
    }

    /// Returns `true` if retrying against freshly loaded state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WaypointError::ConcurrentModification { .. })
    }
}

/// A convenience alias for `Result<T, WaypointError>`.
pub type Result<T> = std::result::Result<T, WaypointError>;

/// Structured form of an error, returned across the operation boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&WaypointError> for ErrorPayload {
    fn from(err: &WaypointError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

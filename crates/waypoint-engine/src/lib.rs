//! Workflow session engine: definitions, sessions, the next-action cursor,
//! progress reports, batch operations and completion reports.
//!
//! [`SessionManager`] is the entry point. It owns a [`DefinitionRegistry`],
//! a [`SessionStore`], a [`TokenStore`] and per-session locks, and exposes
//! `start`, `next`, `progress`, `batch` and `complete` (plus `resume`,
//! `status` and `list`).

pub mod actions;
pub mod batch;
pub mod config;
pub mod definition;
pub mod events;
pub mod locks;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod report;
pub mod store;
pub mod token_file;
pub mod tokens;
pub mod transforms;
pub mod validation;

pub use actions::{advance, phase_action_id, NextAction, PHASE_ACTION_PREFIX};
pub use batch::{
    BatchExecution, BatchFailure, BatchFilter, BatchOperation, BatchPreview, BatchRequest,
    BatchResponse, GroupReport, InstanceGroup, InstanceSample,
};
pub use config::EngineConfig;
pub use definition::{ChecklistTemplateItem, PhaseTemplate, WorkflowDefinition};
pub use events::{EventEmitter, SessionEvent};
pub use manager::{NextResponse, SessionManager, StartRequest, StartResponse, StatusResponse};
pub use progress::{apply_report, ChecklistExpansion, CompletedAction, ProgressReport, ReportOutcome};
pub use registry::{parse_definitions, DefinitionRegistry, DefinitionSource, RegisteredWorkflow, WorkflowSummary};
pub use report::{CompleteResponse, CompletionReport, CompletionSummary};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, SessionSummary};
pub use token_file::{StateLock, TokenFile};
pub use tokens::{ConfirmationToken, TokenStore};
pub use transforms::{expand_variables, session_variables};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};

//! Session manager: the five operations an agent drives a workflow with.
//!
//! Every mutating call holds the session's lock from load to save, so the
//! token check-then-act in `batch` and concurrent `progress` reports on one
//! session are serialised. The store's version check catches writers in
//! other processes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use waypoint_patterns::DiscoveryEngine;
use waypoint_tools::{ContentStore, FileScanner, InventorySummary};
use waypoint_types::{
    ChecklistItem, ChecklistItemKind, DiscoverySummary, PatternMatch, Phase, PhaseStatus,
    PhaseTask, Result, SessionProgress, SessionStatus, WaypointError, WorkflowSession,
};

use crate::actions::{advance, NextAction};
use crate::batch::{self, BatchFilter, BatchOperation, BatchRequest, BatchResponse, SourceMap};
use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;
use crate::events::{EventEmitter, SessionEvent};
use crate::locks::SessionLocks;
use crate::progress::{apply_report, ProgressReport};
use crate::registry::{DefinitionRegistry, RegisteredWorkflow, WorkflowSummary};
use crate::report::{CompleteResponse, CompletionReport, CompletionSummary};
use crate::store::{SessionStore, SessionSummary};
use crate::tokens::TokenStore;
use crate::transforms::session_variables;
use crate::validation::Diagnostic;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub workflow_type: String,
    pub scope_root: String,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    /// Run leading autonomous phases before returning.
    #[serde(default = "default_true")]
    pub run_autonomous: bool,
    /// Bound on autonomous work; the engine default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl StartRequest {
    pub fn new(workflow_type: impl Into<String>, scope_root: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            scope_root: scope_root.into(),
            options: BTreeMap::new(),
            run_autonomous: true,
            timeout_ms: None,
        }
    }

    pub fn option(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub phases: Vec<Phase>,
    pub file_inventory_summary: InventorySummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_summary: Option<DiscoverySummary>,
    pub next_action: NextAction,
    pub progress: SessionProgress,
}

/// Returned by `next`, `progress` and `resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextResponse {
    pub session_id: String,
    pub next_action: NextAction,
    pub progress: SessionProgress,
    /// Set when a progress report repeated one already applied.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_summary: Option<DiscoverySummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub session: SessionSummary,
    pub phases: Vec<Phase>,
    pub progress: SessionProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_summary: Option<DiscoverySummary>,
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

pub struct SessionManager {
    registry: RwLock<DefinitionRegistry>,
    store: Arc<dyn SessionStore>,
    content: Arc<dyn ContentStore>,
    tokens: TokenStore,
    locks: SessionLocks,
    events: EventEmitter,
    config: EngineConfig,
}

impl SessionManager {
    pub fn new(
        registry: DefinitionRegistry,
        store: Arc<dyn SessionStore>,
        content: Arc<dyn ContentStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry: RwLock::new(registry),
            store,
            content,
            tokens: TokenStore::new(config.token_retention),
            locks: SessionLocks::new(),
            events: EventEmitter::default(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    // --- Definitions ---

    pub async fn register_definition(
        &self,
        definition: WorkflowDefinition,
        allow_override_builtin: bool,
    ) -> Result<Vec<Diagnostic>> {
        self.registry
            .write()
            .await
            .register(definition, allow_override_builtin)
    }

    pub async fn unregister_definition(&self, workflow_type: &str) -> Result<()> {
        self.registry.write().await.unregister(workflow_type)
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.registry.read().await.list_available()
    }

    async fn workflow(&self, workflow_type: &str) -> Result<Arc<RegisteredWorkflow>> {
        self.registry.read().await.get(workflow_type)
    }

    // --- start ---

    /// Create a session: resolve the definition, scan the scope, instantiate
    /// phases and checklists, run leading autonomous phases, persist.
    pub async fn start(&self, request: StartRequest) -> Result<StartResponse> {
        let workflow = self.workflow(&request.workflow_type).await?;
        let definition = &workflow.definition;
        check_required_options(definition, &request.options)?;

        let root = Path::new(&request.scope_root);
        let mut files = FileScanner::new(self.content.as_ref())
            .scan(root, &definition.include, &definition.exclude)
            .await?;
        if files.is_empty() {
            return Err(WaypointError::EmptyScope {
                root: request.scope_root.clone(),
            });
        }
        let inventory = InventorySummary::from_entries(&files);

        let vars = session_variables(&request.workflow_type, &request.scope_root, &request.options);
        for (fi, file) in files.iter_mut().enumerate() {
            file.checklist = definition.instantiate_checklist(fi, &vars);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let mut session = WorkflowSession::new(
            session_id.clone(),
            request.workflow_type.clone(),
            request.scope_root.clone(),
            definition.instantiate_phases(&vars),
            files,
            request.options.clone(),
        );
        session.status = SessionStatus::InProgress;
        tracing::info!(
            session_id = %session_id,
            workflow = %request.workflow_type,
            files = session.files.len(),
            "Session started"
        );

        if request.run_autonomous {
            let timeout = request
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.config.autonomous_timeout);
            self.run_autonomous_phases(&mut session, &workflow, Instant::now() + timeout)
                .await;
        } else {
            defer_autonomous_phases(&mut session);
        }

        for file in &mut session.files {
            file.refresh_status();
        }
        session.recount();
        let next_action = advance(&mut session);
        self.store.save(&mut session).await?;

        self.events.emit(SessionEvent::SessionStarted {
            session_id: session_id.clone(),
            workflow_type: session.workflow_type.clone(),
            files_total: session.counters.files_total,
        });

        Ok(StartResponse {
            session_id,
            status: session.status,
            phases: session.phases.clone(),
            file_inventory_summary: inventory,
            discovery_summary: session.discovery.clone(),
            progress: session.progress(),
            next_action,
        })
    }

    /// Finish unfinished autonomous phases of a persisted session.
    pub async fn resume(&self, session_id: &str, timeout: Option<Duration>) -> Result<NextResponse> {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.load(session_id).await?;
        ensure_open(&session)?;
        let workflow = self.workflow(&session.workflow_type).await?;

        let deadline = Instant::now() + timeout.unwrap_or(self.config.autonomous_timeout);
        let before = session.clone();
        self.run_autonomous_phases(&mut session, &workflow, deadline).await;
        for file in &mut session.files {
            file.refresh_status();
        }
        session.recount();
        let next_action = advance(&mut session);
        self.persist_if_changed(&before, &mut session).await?;
        tracing::info!(session_id = %session_id, "Session resumed");

        Ok(NextResponse {
            session_id: session_id.to_string(),
            next_action,
            progress: session.progress(),
            replayed: false,
            discovery_summary: session.discovery.clone(),
        })
    }

    // --- next / progress ---

    pub async fn next(&self, session_id: &str) -> Result<NextResponse> {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.load(session_id).await?;
        let before = session.clone();
        let next_action = advance(&mut session);
        self.persist_if_changed(&before, &mut session).await?;

        Ok(NextResponse {
            session_id: session_id.to_string(),
            next_action,
            progress: session.progress(),
            replayed: false,
            discovery_summary: None,
        })
    }

    pub async fn progress(&self, session_id: &str, report: ProgressReport) -> Result<NextResponse> {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.load(session_id).await?;
        let before = session.clone();

        let outcome = apply_report(&mut session, &report)?;
        let next_action = advance(&mut session);
        self.persist_if_changed(&before, &mut session).await?;

        if outcome.replayed {
            tracing::debug!(
                session_id = %session_id,
                action = %report.completed_action.action_id,
                "Progress report replayed"
            );
        }
        if let Some((item_id, status)) = outcome.closed_item {
            tracing::debug!(session_id = %session_id, item = %item_id, status = %status, "Checklist item closed");
            self.events.emit(SessionEvent::ItemCompleted {
                session_id: session_id.to_string(),
                item_id,
                status,
            });
        }
        if let Some((file, added)) = outcome.expanded {
            tracing::info!(session_id = %session_id, file = %file, added, "Checklist expanded");
            self.events.emit(SessionEvent::ChecklistExpanded {
                session_id: session_id.to_string(),
                file,
                added,
            });
        }
        if outcome.session_failed {
            let phase_id = report
                .completed_action
                .action_id
                .trim_start_matches(crate::actions::PHASE_ACTION_PREFIX)
                .to_string();
            tracing::warn!(session_id = %session_id, phase = %phase_id, "Session failed");
            self.events.emit(SessionEvent::SessionFailed {
                session_id: session_id.to_string(),
                phase_id,
            });
        }

        Ok(NextResponse {
            session_id: session_id.to_string(),
            next_action,
            progress: session.progress(),
            replayed: outcome.replayed,
            discovery_summary: None,
        })
    }

    // --- batch ---

    /// Dry-run, execute or group pattern instances.
    ///
    /// A request carrying a `confirmation_token` executes; otherwise a
    /// `dry_run` request previews and mints a token. The token is consumed
    /// whenever it belongs to this session, even if the request then fails.
    pub async fn batch(&self, session_id: &str, request: BatchRequest) -> Result<BatchResponse> {
        let operation: BatchOperation = request.operation.parse()?;
        let filter = request.filter.clone().normalized();

        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.load(session_id).await?;

        if operation.is_read_only() {
            return Ok(BatchResponse::Grouped(batch::group_by_type(&session, &filter)));
        }
        ensure_open(&session)?;

        let token = match request.confirmation_token {
            Some(token) => token,
            None if request.dry_run => {
                let sources = self.read_sources(&session, operation, &filter).await;
                let preview = batch::preview(&session, operation, &filter, sources.as_ref());
                let token =
                    self.tokens
                        .issue(session_id, operation, &filter, preview.instances_affected);
                tracing::info!(
                    session_id = %session_id,
                    operation = %operation,
                    instances = preview.instances_affected,
                    "Batch dry run"
                );
                return Ok(BatchResponse::DryRun(preview.with_token(session_id, token.token)));
            }
            None => {
                return Err(WaypointError::InvalidOrExpiredToken {
                    token: "<missing>".to_string(),
                })
            }
        };

        let issued = self
            .tokens
            .take(&token, session_id)
            .ok_or_else(|| WaypointError::InvalidOrExpiredToken {
                token: token.clone(),
            })?;
        if !issued.authorises(operation, &filter) {
            tracing::warn!(
                session_id = %session_id,
                issued_for = %issued.operation,
                requested = %operation,
                "Confirmation token does not match the request"
            );
            return Err(WaypointError::InvalidOrExpiredToken { token });
        }

        let sources = self.read_sources(&session, operation, &filter).await;
        let result = batch::execute(&mut session, operation, &filter, sources.as_ref())?;
        advance(&mut session);
        self.store.save(&mut session).await?;

        tracing::info!(
            session_id = %session_id,
            operation = %operation,
            modified = result.modified,
            failed = result.failed,
            "Batch executed"
        );
        self.events.emit(SessionEvent::BatchExecuted {
            session_id: session_id.to_string(),
            operation: operation.to_string(),
            modified: result.modified,
            failed: result.failed,
        });
        Ok(BatchResponse::Executed(result))
    }

    /// Current text of every file an `apply_fixes` selection touches.
    async fn read_sources(
        &self,
        session: &WorkflowSession,
        operation: BatchOperation,
        filter: &BatchFilter,
    ) -> Option<SourceMap> {
        if operation != BatchOperation::ApplyFixes {
            return None;
        }
        let paths: BTreeSet<&str> = batch::select(session, filter)
            .into_iter()
            .map(|(fi, _)| session.files[fi].path.as_str())
            .collect();
        let root = Path::new(&session.scope_root);
        let mut sources = SourceMap::new();
        for path in paths {
            let content = match self.content.read_file(root, path).await {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(session_id = %session.id, file = %path, error = %e, "Could not re-read file");
                    None
                }
            };
            sources.insert(path.to_string(), content);
        }
        Some(sources)
    }

    // --- complete / status / list ---

    pub async fn complete(&self, session_id: &str, generate_report: bool) -> Result<CompleteResponse> {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.load(session_id).await?;

        match session.status {
            SessionStatus::Completed => {}
            SessionStatus::Failed => {
                return Err(WaypointError::SessionClosed {
                    session_id: session_id.to_string(),
                    status: session.status.to_string(),
                })
            }
            SessionStatus::Pending | SessionStatus::InProgress => {
                session.status = SessionStatus::Completed;
                session.recount();
                self.store.save(&mut session).await?;
                tracing::info!(
                    session_id = %session_id,
                    files_completed = session.counters.files_completed,
                    files_total = session.counters.files_total,
                    "Session completed"
                );
                self.events.emit(SessionEvent::SessionCompleted {
                    session_id: session_id.to_string(),
                });
            }
        }

        Ok(CompleteResponse {
            status: session.status,
            summary: CompletionSummary::from_session(&session),
            report: generate_report.then(|| CompletionReport::build(&session)),
        })
    }

    pub async fn status(&self, session_id: &str) -> Result<StatusResponse> {
        let session = self.load(session_id).await?;
        Ok(StatusResponse {
            session: SessionSummary::from(&session),
            phases: session.phases.clone(),
            progress: session.progress(),
            discovery_summary: session.discovery.clone(),
        })
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        self.store.list().await
    }

    /// The full persisted session.
    pub async fn session(&self, session_id: &str) -> Result<WorkflowSession> {
        self.load(session_id).await
    }

    // --- internals ---

    async fn load(&self, session_id: &str) -> Result<WorkflowSession> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| WaypointError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Save only when something changed, emitting phase completions.
    async fn persist_if_changed(
        &self,
        before: &WorkflowSession,
        session: &mut WorkflowSession,
    ) -> Result<()> {
        if *before == *session {
            return Ok(());
        }
        self.store.save(session).await?;
        for (old, new) in before.phases.iter().zip(&session.phases) {
            if !old.status.is_done() && new.status.is_done() {
                self.events.emit(SessionEvent::PhaseCompleted {
                    session_id: session.id.clone(),
                    phase_id: new.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Run the leading autonomous phases in order, stopping at the first
    /// guided phase or when `deadline` passes.
    async fn run_autonomous_phases(
        &self,
        session: &mut WorkflowSession,
        workflow: &RegisteredWorkflow,
        deadline: Instant,
    ) {
        for idx in 0..session.phases.len() {
            if session.phases[idx].status.is_done() {
                continue;
            }
            match session.phases[idx].task {
                PhaseTask::Inventory => {
                    session.phases[idx].status = PhaseStatus::Completed;
                }
                PhaseTask::PatternDiscovery => {
                    session.phases[idx].status = PhaseStatus::InProgress;
                    session.current_phase_id = Some(session.phases[idx].id.clone());
                    let summary = self.discover(session, workflow, deadline).await;
                    self.events.emit(SessionEvent::DiscoveryFinished {
                        session_id: session.id.clone(),
                        instances: summary.total_instances,
                        complete: summary.complete,
                    });
                    if !summary.complete {
                        tracing::warn!(
                            session_id = %session.id,
                            phase = %session.phases[idx].id,
                            "Autonomous phase stopped at its deadline"
                        );
                        return;
                    }
                    session.phases[idx].status = PhaseStatus::Completed;
                    self.events.emit(SessionEvent::PhaseCompleted {
                        session_id: session.id.clone(),
                        phase_id: session.phases[idx].id.clone(),
                    });
                }
                PhaseTask::FileChecklist | PhaseTask::Agent => return,
            }
        }
    }

    /// Scan the inventory, continuing after the files an earlier, interrupted
    /// pass already visited. Returns the accumulated summary.
    async fn discover(
        &self,
        session: &mut WorkflowSession,
        workflow: &RegisteredWorkflow,
        deadline: Instant,
    ) -> DiscoverySummary {
        let previous = session.discovery.take().filter(|d| !d.complete);
        let offset = previous.as_ref().map_or(0, |d| d.files_visited());
        let files: Vec<String> = session
            .files
            .iter()
            .skip(offset)
            .map(|f| f.path.clone())
            .collect();

        let outcome = DiscoveryEngine::new(self.content.as_ref())
            .discover(
                Path::new(&session.scope_root),
                &files,
                &workflow.patterns,
                Some(deadline),
            )
            .await;
        let added = materialize_matches(session, outcome.matches);
        tracing::info!(session_id = %session.id, added, "Pattern instances added to checklists");

        let summary = match previous {
            Some(mut prev) => {
                prev.merge(&outcome.summary);
                prev
            }
            None => outcome.summary,
        };
        session.discovery = Some(summary.clone());
        summary
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn check_required_options(
    definition: &WorkflowDefinition,
    options: &BTreeMap<String, serde_json::Value>,
) -> Result<()> {
    for key in &definition.required_options {
        let present = match options.get(key) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(WaypointError::MissingRequiredOption {
                workflow_type: definition.workflow_type.clone(),
                option: key.clone(),
            });
        }
    }
    Ok(())
}

fn ensure_open(session: &WorkflowSession) -> Result<()> {
    if session.status.is_terminal() {
        return Err(WaypointError::SessionClosed {
            session_id: session.id.clone(),
            status: session.status.to_string(),
        });
    }
    Ok(())
}

/// When autonomous pre-processing is declined, optional autonomous phases
/// are skipped; required ones wait for `resume`.
fn defer_autonomous_phases(session: &mut WorkflowSession) {
    for phase in &mut session.phases {
        match phase.task {
            PhaseTask::Inventory => phase.status = PhaseStatus::Completed,
            PhaseTask::PatternDiscovery if !phase.required => phase.status = PhaseStatus::Skipped,
            _ => {}
        }
    }
}

/// Append one pattern-instance item per match, skipping matches whose
/// `(file, pattern, line)` is already on the checklist. Returns the number
/// added.
fn materialize_matches(session: &mut WorkflowSession, matches: Vec<PatternMatch>) -> usize {
    let mut seen: BTreeSet<(String, String, usize)> = session
        .pattern_items()
        .filter_map(|(_, item)| item.pattern_match().map(PatternMatch::dedup_key))
        .collect();

    let mut added = 0;
    for m in matches {
        if !seen.insert(m.dedup_key()) {
            continue;
        }
        let Some(fi) = session.file_index(&m.file) else {
            tracing::warn!(session_id = %session.id, file = %m.file, "Match for a file outside the inventory");
            continue;
        };
        let file = &mut session.files[fi];
        let id = ChecklistItem::make_id(fi, file.checklist.len());
        let description = format!(
            "[{}] {} instance at line {}",
            m.pattern_id, m.instance_type, m.line
        );
        file.checklist.push(ChecklistItem::new(
            id,
            description,
            ChecklistItemKind::PatternInstance { pattern_match: m },
        ));
        added += 1;
    }
    added
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use waypoint_tools::MemoryContentStore;
    use waypoint_types::{FileStatus, ItemStatus};

    const MIGRATION_SOURCE: &str = "codeunit 50100 Demo\n{\n    procedure Run()\n    begin\n        Error('Boom');\n        Message(HelloMsg);\n    end;\n}\n";

    fn manager(content: MemoryContentStore) -> SessionManager {
        SessionManager::new(
            DefinitionRegistry::with_builtins().unwrap(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(content),
            EngineConfig::default(),
        )
    }

    fn three_files() -> MemoryContentStore {
        MemoryContentStore::new()
            .with_file("src/A.Codeunit.al", "codeunit 1 A {}")
            .with_file("src/B.Codeunit.al", "codeunit 2 B {}")
            .with_file("src/C.Table.al", "table 3 C {}")
            .with_file("README.md", "docs")
    }

    fn migration_request() -> StartRequest {
        StartRequest::new("version-migration", "/repo")
            .option("source_version", "14")
            .option("target_version", "24")
    }

    // --- start ---

    #[tokio::test]
    async fn start_code_review() {
        let m = manager(three_files());
        let response = m.start(StartRequest::new("code-review", "/repo")).await.unwrap();

        assert_eq!(response.status, SessionStatus::InProgress);
        assert_eq!(response.file_inventory_summary.files_total, 3);
        assert_eq!(response.phases[0].status, PhaseStatus::Completed);
        assert_eq!(response.progress.current_phase.as_deref(), Some("analysis"));
        assert!(response.discovery_summary.is_none());
        match &response.next_action {
            NextAction::PerformItem { action_id, file, .. } => {
                assert_eq!(action_id, "f0-i0");
                assert_eq!(file, "src/A.Codeunit.al");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_rejects_unknown_type_and_empty_scope() {
        let m = manager(three_files());
        let err = m.start(StartRequest::new("perf-audit", "/repo")).await.unwrap_err();
        assert!(matches!(err, WaypointError::UnknownWorkflowType { .. }));

        let m = manager(MemoryContentStore::new().with_file("README.md", "x"));
        let err = m.start(StartRequest::new("code-review", "/repo")).await.unwrap_err();
        assert!(matches!(err, WaypointError::EmptyScope { .. }));
    }

    #[tokio::test]
    async fn start_requires_declared_options() {
        let m = manager(three_files());
        let err = m
            .start(StartRequest::new("version-migration", "/repo").option("source_version", "14"))
            .await
            .unwrap_err();
        match err {
            WaypointError::MissingRequiredOption { option, .. } => assert_eq!(option, "target_version"),
            other => panic!("unexpected error: {other}"),
        }

        let err = m
            .start(
                StartRequest::new("version-migration", "/repo")
                    .option("source_version", "14")
                    .option("target_version", ""),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::MissingRequiredOption { .. }));
    }

    #[tokio::test]
    async fn start_runs_discovery() {
        let m = manager(MemoryContentStore::new().with_file("src/Demo.Codeunit.al", MIGRATION_SOURCE));
        let response = m.start(migration_request()).await.unwrap();

        let summary = response.discovery_summary.unwrap();
        assert!(summary.complete);
        assert_eq!(summary.by_instance_type["literal"], 1);
        assert_eq!(summary.by_instance_type["text_constant"], 1);
        assert_eq!(response.phases[1].status, PhaseStatus::Completed);
        assert_eq!(response.progress.current_phase.as_deref(), Some("migration"));
        assert_eq!(response.progress.instances_total, 2);

        let session = m.session(&response.session_id).await.unwrap();
        assert!(session.phases[2]
            .instruction
            .as_deref()
            .unwrap()
            .contains("from 14 to 24"));
    }

    #[tokio::test]
    async fn start_without_autonomous_defers_discovery() {
        let m = manager(MemoryContentStore::new().with_file("src/Demo.Codeunit.al", MIGRATION_SOURCE));
        let mut request = migration_request();
        request.run_autonomous = false;
        let response = m.start(request).await.unwrap();

        assert!(response.discovery_summary.is_none());
        assert!(matches!(
            response.next_action,
            NextAction::RunAutonomousPhase { ref phase_id, .. } if phase_id == "discovery"
        ));

        let resumed = m.resume(&response.session_id, None).await.unwrap();
        assert_eq!(resumed.discovery_summary.unwrap().total_instances, 2);
        assert!(matches!(resumed.next_action, NextAction::PerformItem { .. }));
    }

    #[tokio::test]
    async fn elapsed_deadline_leaves_discovery_in_progress() {
        let m = manager(MemoryContentStore::new().with_file("src/Demo.Codeunit.al", MIGRATION_SOURCE));
        let mut request = migration_request();
        request.timeout_ms = Some(0);
        let response = m.start(request).await.unwrap();

        assert_eq!(response.status, SessionStatus::InProgress);
        assert_eq!(response.phases[0].status, PhaseStatus::Completed);
        assert_eq!(response.phases[1].status, PhaseStatus::InProgress);
        assert!(!response.discovery_summary.unwrap().complete);

        let resumed = m.resume(&response.session_id, Some(Duration::from_secs(5))).await.unwrap();
        let summary = resumed.discovery_summary.unwrap();
        assert!(summary.complete);
        assert_eq!(summary.files_scanned, 1);
        assert_eq!(resumed.progress.instances_total, 2);
    }

    // --- next / progress ---

    #[tokio::test]
    async fn next_is_idempotent() {
        let m = manager(three_files());
        let id = m.start(StartRequest::new("code-review", "/repo")).await.unwrap().session_id;

        let first = m.next(&id).await.unwrap();
        let version = m.session(&id).await.unwrap().version;
        for _ in 0..3 {
            let again = m.next(&id).await.unwrap();
            assert_eq!(again.next_action, first.next_action);
        }
        assert_eq!(m.session(&id).await.unwrap().version, version);
    }

    #[tokio::test]
    async fn progress_walks_files_and_phases() {
        let m = manager(MemoryContentStore::new().with_file("a.al", "x"));
        let id = m.start(StartRequest::new("code-review", "/repo")).await.unwrap().session_id;

        for item in ["f0-i0", "f0-i1", "f0-i2"] {
            let r = m
                .progress(&id, ProgressReport::new(item, ItemStatus::Completed))
                .await
                .unwrap();
            let p = &r.progress;
            assert_eq!(p.files_completed + p.files_pending + p.files_in_progress, p.files_total);
        }

        let r = m.next(&id).await.unwrap();
        assert_eq!(r.next_action.action_id(), Some("phase:report"));
        assert_eq!(r.progress.files_completed, 1);

        let r = m
            .progress(&id, ProgressReport::new("phase:report", ItemStatus::Completed))
            .await
            .unwrap();
        assert!(matches!(r.next_action, NextAction::CompleteWorkflow { .. }));

        let done = m.complete(&id, true).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.report.unwrap().incomplete_files.is_empty());

        let err = m
            .progress(&id, ProgressReport::new("f0-i0", ItemStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn unknown_session() {
        let m = manager(three_files());
        assert!(matches!(
            m.next("missing").await.unwrap_err(),
            WaypointError::SessionNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn session_locks_do_not_accumulate() {
        let m = manager(three_files());
        for i in 0..50 {
            assert!(m.next(&format!("missing-{i}")).await.is_err());
        }
        assert!(m.locks.is_empty());

        let id = m.start(StartRequest::new("code-review", "/repo")).await.unwrap().session_id;
        m.next(&id).await.unwrap();
        m.progress(&id, ProgressReport::new("f0-i0", ItemStatus::Completed))
            .await
            .unwrap();
        m.status(&id).await.unwrap();
        m.complete(&id, false).await.unwrap();
        assert!(m.locks.is_empty());
    }

    #[tokio::test]
    async fn progress_replay_reports_flag() {
        let m = manager(three_files());
        let id = m.start(StartRequest::new("code-review", "/repo")).await.unwrap().session_id;
        let report = ProgressReport::new("f0-i0", ItemStatus::Completed);
        assert!(!m.progress(&id, report.clone()).await.unwrap().replayed);
        let version = m.session(&id).await.unwrap().version;
        assert!(m.progress(&id, report).await.unwrap().replayed);
        assert_eq!(m.session(&id).await.unwrap().version, version);
    }

    // --- batch ---

    #[tokio::test]
    async fn batch_dry_run_then_execute() {
        let m = manager(MemoryContentStore::new().with_file("src/Demo.Codeunit.al", MIGRATION_SOURCE));
        let id = m.start(migration_request()).await.unwrap().session_id;
        let filter = BatchFilter {
            instance_types: vec!["literal".into()],
            ..BatchFilter::default()
        };

        let dry = m
            .batch(
                &id,
                BatchRequest {
                    operation: "apply_fixes".into(),
                    filter: filter.clone(),
                    dry_run: true,
                    confirmation_token: None,
                },
            )
            .await
            .unwrap();
        let BatchResponse::DryRun(preview) = dry else {
            panic!("expected a preview");
        };
        assert_eq!(preview.instances_affected, 1);
        assert_eq!(preview.stale_instances, 0);

        let request = BatchRequest {
            operation: "apply_fixes".into(),
            filter,
            dry_run: false,
            confirmation_token: Some(preview.confirmation_token.clone()),
        };
        let BatchResponse::Executed(result) = m.batch(&id, request.clone()).await.unwrap() else {
            panic!("expected an execution");
        };
        assert_eq!(result.modified, 1);
        assert_eq!(result.applied[0].after.as_deref(), Some("Error(ErrorLbl)"));

        let session = m.session(&id).await.unwrap();
        assert_eq!(session.counters.instances_auto_fixed, 1);

        let err = m.batch(&id, request).await.unwrap_err();
        assert!(matches!(err, WaypointError::InvalidOrExpiredToken { .. }));
    }

    #[tokio::test]
    async fn batch_rejects_unknown_operation_and_missing_token() {
        let m = manager(MemoryContentStore::new().with_file("src/Demo.Codeunit.al", MIGRATION_SOURCE));
        let id = m.start(migration_request()).await.unwrap().session_id;

        let err = m
            .batch(
                &id,
                BatchRequest {
                    operation: "delete_all".into(),
                    filter: BatchFilter::default(),
                    dry_run: true,
                    confirmation_token: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::InvalidOperation { .. }));

        let err = m
            .batch(
                &id,
                BatchRequest {
                    operation: "skip_instances".into(),
                    filter: BatchFilter::default(),
                    dry_run: false,
                    confirmation_token: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::InvalidOrExpiredToken { .. }));
    }

    #[tokio::test]
    async fn mismatched_filter_consumes_token() {
        let m = manager(MemoryContentStore::new().with_file("src/Demo.Codeunit.al", MIGRATION_SOURCE));
        let id = m.start(migration_request()).await.unwrap().session_id;

        let BatchResponse::DryRun(preview) = m
            .batch(
                &id,
                BatchRequest {
                    operation: "skip_instances".into(),
                    filter: BatchFilter::default(),
                    dry_run: true,
                    confirmation_token: None,
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected a preview");
        };
        assert_eq!(m.tokens().len(), 1);

        let err = m
            .batch(
                &id,
                BatchRequest {
                    operation: "apply_fixes".into(),
                    filter: BatchFilter::default(),
                    dry_run: false,
                    confirmation_token: Some(preview.confirmation_token),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::InvalidOrExpiredToken { .. }));
        assert!(m.tokens().is_empty());
    }

    #[tokio::test]
    async fn apply_fixes_fails_items_whose_file_changed() {
        let content = Arc::new(MemoryContentStore::new().with_file("src/Demo.Codeunit.al", MIGRATION_SOURCE));
        let m = SessionManager::new(
            DefinitionRegistry::with_builtins().unwrap(),
            Arc::new(MemorySessionStore::new()),
            content.clone(),
            EngineConfig::default(),
        );
        let id = m.start(migration_request()).await.unwrap().session_id;
        let filter = BatchFilter {
            instance_types: vec!["literal".into()],
            ..BatchFilter::default()
        };
        let BatchResponse::DryRun(preview) = m
            .batch(
                &id,
                BatchRequest {
                    operation: "apply_fixes".into(),
                    filter: filter.clone(),
                    dry_run: true,
                    confirmation_token: None,
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected a preview");
        };

        content.insert("src/Demo.Codeunit.al", "codeunit 50100 Demo {}\n");
        let BatchResponse::Executed(result) = m
            .batch(
                &id,
                BatchRequest {
                    operation: "apply_fixes".into(),
                    filter,
                    dry_run: false,
                    confirmation_token: Some(preview.confirmation_token),
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected an execution");
        };
        assert_eq!(result.modified, 0);
        assert_eq!(result.failed, 1);
        assert!(result.failures[0].reason.contains("no longer contains"));
    }

    #[tokio::test]
    async fn group_by_type_is_read_only() {
        let m = manager(MemoryContentStore::new().with_file("src/Demo.Codeunit.al", MIGRATION_SOURCE));
        let id = m.start(migration_request()).await.unwrap().session_id;
        let version = m.session(&id).await.unwrap().version;

        let BatchResponse::Grouped(report) = m
            .batch(
                &id,
                BatchRequest {
                    operation: "group_by_type".into(),
                    filter: BatchFilter::default(),
                    dry_run: false,
                    confirmation_token: None,
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected groups");
        };
        assert_eq!(report.total, 2);
        assert!(report.groups.contains_key("literal"));
        assert!(m.tokens().is_empty());
        assert_eq!(m.session(&id).await.unwrap().version, version);
    }

    // --- complete / status ---

    #[tokio::test]
    async fn complete_early_lists_incomplete_files() {
        let m = manager(three_files());
        let id = m.start(StartRequest::new("code-review", "/repo")).await.unwrap().session_id;
        let done = m.complete(&id, true).await.unwrap();
        let report = done.report.unwrap();
        assert_eq!(report.incomplete_files.len(), 3);
        assert!(report.markdown.contains("## Incomplete files"));

        // idempotent
        let again = m.complete(&id, false).await.unwrap();
        assert_eq!(again.status, SessionStatus::Completed);
        assert!(again.report.is_none());
    }

    #[tokio::test]
    async fn status_and_list() {
        let m = manager(three_files());
        let id = m.start(StartRequest::new("code-review", "/repo")).await.unwrap().session_id;
        let status = m.status(&id).await.unwrap();
        assert_eq!(status.session.session_id, id);
        assert_eq!(status.phases.len(), 3);
        assert_eq!(m.list().await.unwrap().len(), 1);
        let session = m.session(&id).await.unwrap();
        assert_eq!(session.files[0].status, FileStatus::InProgress);
    }

    #[tokio::test]
    async fn events_are_emitted() {
        let m = manager(three_files());
        let mut rx = m.events().subscribe();
        let id = m.start(StartRequest::new("code-review", "/repo")).await.unwrap().session_id;
        m.progress(&id, ProgressReport::new("f0-i0", ItemStatus::Skipped))
            .await
            .unwrap();

        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::SessionStarted { files_total: 3, .. }));
        match rx.recv().await.unwrap() {
            SessionEvent::ItemCompleted { item_id, status, .. } => {
                assert_eq!(item_id, "f0-i0");
                assert_eq!(status, ItemStatus::Skipped);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

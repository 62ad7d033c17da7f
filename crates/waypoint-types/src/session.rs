//! The workflow session record and everything it owns: phases, the per-file
//! checklist, findings and proposed changes.
//!
//! A [`WorkflowSession`] is the single source of truth for a run. It is
//! serialised as a whole by the session store, so every type here is plain
//! serde data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pattern::{DiscoverySummary, PatternMatch};

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the engine runs a phase itself or needs agent turns for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseMode {
    Autonomous,
    Guided,
}

/// What a phase actually does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseTask {
    /// Build the file inventory. Always performed by `start`.
    Inventory,
    /// Run the workflow's pattern definitions over the inventory.
    PatternDiscovery,
    /// Walk the per-file checklist, one action per item.
    FileChecklist,
    /// A single session-level step the agent performs and reports.
    Agent,
}

impl PhaseTask {
    /// The only mode a phase with this task may run in.
    pub fn mode(self) -> PhaseMode {
        match self {
            PhaseTask::Inventory | PhaseTask::PatternDiscovery => PhaseMode::Autonomous,
            PhaseTask::FileChecklist | PhaseTask::Agent => PhaseMode::Guided,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_done(self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Skipped | ItemStatus::Failed
        )
    }

    /// Still waiting for work.
    pub fn is_open(self) -> bool {
        matches!(self, ItemStatus::Pending | ItemStatus::InProgress)
    }

    /// Counts towards a file's completion when the item is required.
    pub fn satisfies_requirement(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Skipped)
    }

    /// Checklist transitions only move forward:
    /// `pending → in_progress → {completed, skipped, failed}`, and a pending
    /// item may jump straight to a terminal status.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        match (self, next) {
            (ItemStatus::Pending, ItemStatus::InProgress) => true,
            (ItemStatus::Pending | ItemStatus::InProgress, n) => n.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "in_progress" => Ok(ItemStatus::InProgress),
            "completed" => Ok(ItemStatus::Completed),
            "skipped" => Ok(ItemStatus::Skipped),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(format!("unknown item status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One ordered stage of a session, instantiated from a definition template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub mode: PhaseMode,
    pub task: PhaseTask,
    #[serde(default = "default_true")]
    pub required: bool,
    pub status: PhaseStatus,
    #[serde(default)]
    pub instruction: Option<String>,
}

// ---------------------------------------------------------------------------
// Checklist
// ---------------------------------------------------------------------------

/// Variant-specific payload of a checklist item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChecklistItemKind {
    Analysis,
    Validation,
    TopicApplication { topic_id: String },
    PatternInstance { pattern_match: PatternMatch },
}

impl ChecklistItemKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChecklistItemKind::Analysis => "analysis",
            ChecklistItemKind::Validation => "validation",
            ChecklistItemKind::TopicApplication { .. } => "topic_application",
            ChecklistItemKind::PatternInstance { .. } => "pattern_instance",
        }
    }
}

/// One unit of work on a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
    pub status: ItemStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(flatten)]
    pub kind: ChecklistItemKind,
}

impl ChecklistItem {
    /// Id of the `index`-th item of the `file_index`-th file.
    pub fn make_id(file_index: usize, index: usize) -> String {
        format!("f{file_index}-i{index}")
    }

    pub fn new(id: String, description: impl Into<String>, kind: ChecklistItemKind) -> Self {
        Self {
            id,
            description: description.into(),
            required: true,
            status: ItemStatus::Pending,
            result: None,
            kind,
        }
    }

    pub fn pattern_match(&self) -> Option<&PatternMatch> {
        match &self.kind {
            ChecklistItemKind::PatternInstance { pattern_match } => Some(pattern_match),
            _ => None,
        }
    }

    pub fn pattern_match_mut(&mut self) -> Option<&mut PatternMatch> {
        match &mut self.kind {
            ChecklistItemKind::PatternInstance { pattern_match } => Some(pattern_match),
            _ => None,
        }
    }

    /// Move to `next` if the transition is allowed. Returns whether it was applied.
    pub fn transition(&mut self, next: ItemStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Findings and proposed changes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

fn default_category() -> String {
    "general".to_string()
}

/// An observation recorded by the agent. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_category")]
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
}

/// A concrete code edit suggestion. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedChange {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line_start: Option<usize>,
    #[serde(default)]
    pub line_end: Option<usize>,
    #[serde(default)]
    pub original: String,
    pub proposed: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub impact: Option<String>,
    #[serde(default)]
    pub auto_applicable: bool,
}

// ---------------------------------------------------------------------------
// FileEntry
// ---------------------------------------------------------------------------

/// Coarse classification assigned during the inventory scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileClass {
    Source,
    Test,
    Config,
    Documentation,
    Other,
}

impl FileClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FileClass::Source => "source",
            FileClass::Test => "test",
            FileClass::Config => "config",
            FileClass::Documentation => "documentation",
            FileClass::Other => "other",
        }
    }

    /// Classify a root-relative path by its location and extension.
    pub fn classify(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        let in_test_dir = lower
            .split('/')
            .any(|seg| matches!(seg, "test" | "tests" | "testing" | "__tests__"));
        let stem = lower.rsplit('/').next().unwrap_or(&lower);
        let test_name = stem.contains(".test.") || stem.contains("_test.") || stem.contains(".spec.");

        match ext {
            "md" | "txt" | "rst" | "adoc" => FileClass::Documentation,
            "json" | "yaml" | "yml" | "toml" | "xml" | "ini" | "cfg" | "xlf" => FileClass::Config,
            _ if in_test_dir || test_name => FileClass::Test,
            "" => FileClass::Other,
            _ => FileClass::Source,
        }
    }
}

/// One file under analysis and its checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the session's scope root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub class: FileClass,
    pub status: FileStatus,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub proposed_changes: Vec<ProposedChange>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        let class = FileClass::classify(&path);
        Self {
            path,
            size,
            class,
            status: FileStatus::Pending,
            checklist: Vec::new(),
            findings: Vec::new(),
            proposed_changes: Vec::new(),
        }
    }

    /// Index of the first item still waiting for work.
    pub fn first_open_item(&self) -> Option<usize> {
        self.checklist.iter().position(|i| i.status.is_open())
    }

    pub fn has_open_items(&self) -> bool {
        self.first_open_item().is_some()
    }

    /// Recompute `status` from the checklist.
    ///
    /// A file is `completed` once nothing is open and every required item is
    /// completed or skipped. A file whose required item failed stays
    /// `in_progress`.
    pub fn refresh_status(&mut self) {
        let required_satisfied = self
            .checklist
            .iter()
            .filter(|i| i.required)
            .all(|i| i.status.satisfies_requirement());
        let touched = self
            .checklist
            .iter()
            .any(|i| i.status != ItemStatus::Pending);

        self.status = if required_satisfied && !self.has_open_items() {
            FileStatus::Completed
        } else if touched {
            FileStatus::InProgress
        } else {
            FileStatus::Pending
        };
    }
}

// ---------------------------------------------------------------------------
// WorkflowSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub files_total: usize,
    pub files_completed: usize,
    pub files_in_progress: usize,
    pub files_pending: usize,
    pub instances_total: usize,
    pub instances_completed: usize,
    pub instances_skipped: usize,
    pub instances_auto_fixed: usize,
}

/// Progress snapshot returned alongside every next action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProgress {
    pub status: SessionStatus,
    pub current_phase: Option<String>,
    pub phases_done: usize,
    pub phases_total: usize,
    pub current_file_index: usize,
    pub current_file: Option<String>,
    pub files_total: usize,
    pub files_completed: usize,
    pub files_in_progress: usize,
    pub files_pending: usize,
    pub instances_total: usize,
    pub instances_completed: usize,
    pub instances_auto_fixed: usize,
    pub findings: usize,
    pub proposed_changes: usize,
    pub percent_complete: f64,
}

/// One in-progress or completed execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: String,
    pub workflow_type: String,
    pub scope_root: String,
    pub status: SessionStatus,
    pub current_phase_id: Option<String>,
    pub current_file_index: usize,
    pub phases: Vec<Phase>,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub proposed_changes: Vec<ProposedChange>,
    #[serde(default)]
    pub counters: SessionCounters,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub discovery: Option<DiscoverySummary>,
    /// Optimistic-concurrency version, bumped by the store on every save.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(
        id: impl Into<String>,
        workflow_type: impl Into<String>,
        scope_root: impl Into<String>,
        phases: Vec<Phase>,
        files: Vec<FileEntry>,
        options: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        let current_phase_id = phases.first().map(|p| p.id.clone());
        let mut session = Self {
            id: id.into(),
            workflow_type: workflow_type.into(),
            scope_root: scope_root.into(),
            status: SessionStatus::Pending,
            current_phase_id,
            current_file_index: 0,
            phases,
            files,
            findings: Vec::new(),
            proposed_changes: Vec::new(),
            counters: SessionCounters::default(),
            options,
            discovery: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        session.recount();
        session
    }

    pub fn phase_index(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == phase_id)
    }

    pub fn current_phase_index(&self) -> Option<usize> {
        self.current_phase_id
            .as_deref()
            .and_then(|id| self.phase_index(id))
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.current_phase_index().map(|i| &self.phases[i])
    }

    /// Find a checklist item by id, returning `(file_index, item_index)`.
    pub fn locate_item(&self, item_id: &str) -> Option<(usize, usize)> {
        self.files.iter().enumerate().find_map(|(fi, file)| {
            file.checklist
                .iter()
                .position(|item| item.id == item_id)
                .map(|ii| (fi, ii))
        })
    }

    pub fn file_index(&self, path: &str) -> Option<usize> {
        self.files.iter().position(|f| f.path == path)
    }

    /// Every pattern-instance item in the session with its file index.
    pub fn pattern_items(&self) -> impl Iterator<Item = (usize, &ChecklistItem)> {
        self.files.iter().enumerate().flat_map(|(fi, file)| {
            file.checklist
                .iter()
                .filter(|i| i.pattern_match().is_some())
                .map(move |i| (fi, i))
        })
    }

    /// Recompute every derived counter from the file inventory.
    ///
    /// `instances_auto_fixed` is not derivable and is left untouched.
    pub fn recount(&mut self) {
        let mut counters = SessionCounters {
            files_total: self.files.len(),
            instances_auto_fixed: self.counters.instances_auto_fixed,
            ..SessionCounters::default()
        };
        for file in &self.files {
            match file.status {
                FileStatus::Completed => counters.files_completed += 1,
                FileStatus::InProgress => counters.files_in_progress += 1,
                FileStatus::Pending => counters.files_pending += 1,
            }
            for item in file.checklist.iter().filter(|i| i.pattern_match().is_some()) {
                counters.instances_total += 1;
                match item.status {
                    ItemStatus::Completed => counters.instances_completed += 1,
                    ItemStatus::Skipped => counters.instances_skipped += 1,
                    _ => {}
                }
            }
        }
        self.counters = counters;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn progress(&self) -> SessionProgress {
        let c = &self.counters;
        let total_items: usize = self.files.iter().map(|f| f.checklist.len()).sum();
        let closed_items: usize = self
            .files
            .iter()
            .flat_map(|f| f.checklist.iter())
            .filter(|i| i.status.is_terminal())
            .count();
        let percent_complete = if total_items == 0 {
            if self.status == SessionStatus::Completed { 100.0 } else { 0.0 }
        } else {
            (closed_items as f64 / total_items as f64 * 1000.0).round() / 10.0
        };

        SessionProgress {
            status: self.status,
            current_phase: self.current_phase_id.clone(),
            phases_done: self.phases.iter().filter(|p| p.status.is_done()).count(),
            phases_total: self.phases.len(),
            current_file_index: self.current_file_index,
            current_file: self
                .files
                .get(self.current_file_index)
                .map(|f| f.path.clone()),
            files_total: c.files_total,
            files_completed: c.files_completed,
            files_in_progress: c.files_in_progress,
            files_pending: c.files_pending,
            instances_total: c.instances_total,
            instances_completed: c.instances_completed,
            instances_auto_fixed: c.instances_auto_fixed,
            findings: self.findings.len(),
            proposed_changes: self.proposed_changes.len(),
            percent_complete,
        }
    }
}

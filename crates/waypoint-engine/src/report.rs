//! Completion summary and the final report rendered for the user.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waypoint_types::{
    DiscoverySummary, FileStatus, Finding, ItemStatus, PhaseStatus, PhaseTask, SessionStatus,
    Severity, WorkflowSession,
};

/// Headline numbers of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub session_id: String,
    pub workflow_type: String,
    pub scope_root: String,
    pub files_total: usize,
    pub files_completed: usize,
    pub instances_total: usize,
    pub instances_completed: usize,
    pub instances_skipped: usize,
    pub instances_auto_fixed: usize,
    pub findings: usize,
    pub proposed_changes: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: i64,
}

impl CompletionSummary {
    pub fn from_session(session: &WorkflowSession) -> Self {
        let c = &session.counters;
        Self {
            session_id: session.id.clone(),
            workflow_type: session.workflow_type.clone(),
            scope_root: session.scope_root.clone(),
            files_total: c.files_total,
            files_completed: c.files_completed,
            instances_total: c.instances_total,
            instances_completed: c.instances_completed,
            instances_skipped: c.instances_skipped,
            instances_auto_fixed: c.instances_auto_fixed,
            findings: session.findings.len(),
            proposed_changes: session.proposed_changes.len(),
            started_at: session.created_at,
            finished_at: session.updated_at,
            duration_seconds: (session.updated_at - session.created_at).num_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub id: String,
    pub name: String,
    pub task: PhaseTask,
    pub required: bool,
    pub status: PhaseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item_id: String,
    pub file: String,
    pub description: String,
    pub result: Option<String>,
}

/// Everything the agent needs to present the outcome of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub summary: CompletionSummary,
    pub phases: Vec<PhaseOutcome>,
    pub findings_by_severity: BTreeMap<Severity, usize>,
    pub findings_by_category: BTreeMap<String, usize>,
    /// Critical and high severity findings, most severe first.
    pub key_findings: Vec<Finding>,
    pub auto_applicable_changes: usize,
    pub incomplete_files: Vec<String>,
    pub failed_items: Vec<FailedItem>,
    pub discovery: Option<DiscoverySummary>,
    pub markdown: String,
}

impl CompletionReport {
    pub fn build(session: &WorkflowSession) -> Self {
        let summary = CompletionSummary::from_session(session);

        let phases = session
            .phases
            .iter()
            .map(|p| PhaseOutcome {
                id: p.id.clone(),
                name: p.name.clone(),
                task: p.task,
                required: p.required,
                status: p.status,
            })
            .collect();

        let mut findings_by_severity = BTreeMap::new();
        let mut findings_by_category = BTreeMap::new();
        for f in &session.findings {
            *findings_by_severity.entry(f.severity).or_insert(0) += 1;
            *findings_by_category.entry(f.category.clone()).or_insert(0) += 1;
        }

        let mut key_findings: Vec<Finding> = session
            .findings
            .iter()
            .filter(|f| f.severity <= Severity::High)
            .cloned()
            .collect();
        key_findings.sort_by_key(|f| f.severity);

        let incomplete_files = session
            .files
            .iter()
            .filter(|f| f.status != FileStatus::Completed)
            .map(|f| f.path.clone())
            .collect();

        let failed_items = session
            .files
            .iter()
            .flat_map(|file| {
                file.checklist
                    .iter()
                    .filter(|i| i.status == ItemStatus::Failed)
                    .map(move |i| FailedItem {
                        item_id: i.id.clone(),
                        file: file.path.clone(),
                        description: i.description.clone(),
                        result: i.result.clone(),
                    })
            })
            .collect();

        let mut report = Self {
            summary,
            phases,
            findings_by_severity,
            findings_by_category,
            key_findings,
            auto_applicable_changes: session
                .proposed_changes
                .iter()
                .filter(|c| c.auto_applicable)
                .count(),
            incomplete_files,
            failed_items,
            discovery: session.discovery.clone(),
            markdown: String::new(),
        };
        report.markdown = report.render_markdown();
        report
    }

    fn render_markdown(&self) -> String {
        let s = &self.summary;
        let mut out = String::new();
        let _ = writeln!(out, "# {} report", s.workflow_type);
        let _ = writeln!(out);
        let _ = writeln!(out, "- Session: `{}`", s.session_id);
        let _ = writeln!(out, "- Scope: `{}`", s.scope_root);
        let _ = writeln!(out, "- Files: {}/{} completed", s.files_completed, s.files_total);
        if s.instances_total > 0 {
            let _ = writeln!(
                out,
                "- Pattern instances: {} total, {} completed ({} auto-fixed), {} skipped",
                s.instances_total, s.instances_completed, s.instances_auto_fixed, s.instances_skipped
            );
        }
        let _ = writeln!(out, "- Duration: {}s", s.duration_seconds);

        let _ = writeln!(out, "\n## Phases\n");
        for p in &self.phases {
            let status = match p.status {
                PhaseStatus::Pending => "pending",
                PhaseStatus::InProgress => "in progress",
                PhaseStatus::Completed => "completed",
                PhaseStatus::Skipped => "skipped",
            };
            let _ = writeln!(out, "- {} (`{}`): {}", p.name, p.id, status);
        }

        let _ = writeln!(out, "\n## Findings\n");
        if self.findings_by_severity.is_empty() {
            let _ = writeln!(out, "No findings recorded.");
        } else {
            for (severity, count) in &self.findings_by_severity {
                let _ = writeln!(out, "- {}: {}", severity.as_str(), count);
            }
            if !self.key_findings.is_empty() {
                let _ = writeln!(out, "\n### Critical and high\n");
                for f in &self.key_findings {
                    let location = match (&f.file, f.line) {
                        (Some(file), Some(line)) => format!("{file}:{line}"),
                        (Some(file), None) => file.clone(),
                        _ => "session".to_string(),
                    };
                    let _ = writeln!(
                        out,
                        "- **{}** [{}] {}: {}",
                        f.severity.as_str(),
                        f.category,
                        location,
                        f.description
                    );
                    if let Some(suggestion) = &f.suggestion {
                        let _ = writeln!(out, "  - Suggestion: {suggestion}");
                    }
                }
            }
        }

        if s.proposed_changes > 0 {
            let _ = writeln!(
                out,
                "\n## Proposed changes\n\n{} proposed, {} auto-applicable.",
                s.proposed_changes, self.auto_applicable_changes
            );
        }

        if !self.incomplete_files.is_empty() {
            let _ = writeln!(out, "\n## Incomplete files\n");
            for path in &self.incomplete_files {
                let _ = writeln!(out, "- {path}");
            }
        }

        if !self.failed_items.is_empty() {
            let _ = writeln!(out, "\n## Failed items\n");
            for item in &self.failed_items {
                let _ = writeln!(out, "- `{}` {}: {}", item.item_id, item.file, item.description);
            }
        }
        out
    }
}

/// Response of the `complete` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub status: SessionStatus,
    pub summary: CompletionSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<CompletionReport>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

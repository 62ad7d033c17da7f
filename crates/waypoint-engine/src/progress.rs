//! Progress reports: the only way an agent changes a session's checklist.

use serde::{Deserialize, Serialize};

use waypoint_types::{
    ChecklistItem, ChecklistItemKind, Finding, ItemStatus, PhaseStatus, PhaseTask, ProposedChange,
    Result, SessionStatus, WaypointError, WorkflowSession,
};

use crate::actions::PHASE_ACTION_PREFIX;

/// The action being reported and how it ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedAction {
    pub action_id: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub result: Option<String>,
}

/// A checklist item the agent wants added to the action's file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistExpansion {
    #[serde(default)]
    pub topic_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: Option<bool>,
}

impl ChecklistExpansion {
    pub fn topic(topic_id: impl Into<String>) -> Self {
        Self {
            topic_id: Some(topic_id.into()),
            ..Self::default()
        }
    }

    fn into_item(self, id: String) -> ChecklistItem {
        let (kind, description) = match self.topic_id {
            Some(topic_id) => {
                let description = self
                    .description
                    .unwrap_or_else(|| format!("Apply knowledge topic '{topic_id}'"));
                (ChecklistItemKind::TopicApplication { topic_id }, description)
            }
            None => (ChecklistItemKind::Analysis, self.description.unwrap_or_default()),
        };
        let mut item = ChecklistItem::new(id, description, kind);
        item.required = self.required.unwrap_or(true);
        item
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub completed_action: CompletedAction,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub proposed_changes: Vec<ProposedChange>,
    #[serde(default)]
    pub expand_checklist: Vec<ChecklistExpansion>,
}

impl ProgressReport {
    pub fn new(action_id: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            completed_action: CompletedAction {
                action_id: action_id.into(),
                status,
                result: None,
            },
            findings: Vec::new(),
            proposed_changes: Vec::new(),
            expand_checklist: Vec::new(),
        }
    }
}

/// What applying a report changed, for logging and events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportOutcome {
    /// The action already had the reported status; nothing was applied.
    pub replayed: bool,
    pub closed_item: Option<(String, ItemStatus)>,
    pub closed_phase: Option<String>,
    /// File path and number of items appended to it.
    pub expanded: Option<(String, usize)>,
    pub session_failed: bool,
}

fn phase_status_str(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Pending => "pending",
        PhaseStatus::InProgress => "in_progress",
        PhaseStatus::Completed => "completed",
        PhaseStatus::Skipped => "skipped",
    }
}

/// Apply `report` to `session`.
///
/// On error the session may be partially modified; callers discard it and
/// keep the persisted copy.
pub fn apply_report(session: &mut WorkflowSession, report: &ProgressReport) -> Result<ReportOutcome> {
    if session.status.is_terminal() {
        return Err(WaypointError::SessionClosed {
            session_id: session.id.clone(),
            status: session.status.to_string(),
        });
    }

    let action_id = report.completed_action.action_id.as_str();
    let status = report.completed_action.status;
    let invalid = |reason: String| WaypointError::InvalidCompletedAction {
        action_id: action_id.to_string(),
        reason,
    };

    if !status.is_terminal() {
        return Err(invalid(format!(
            "status must be completed, skipped or failed, not {status}"
        )));
    }
    for e in &report.expand_checklist {
        let has_topic = e.topic_id.as_deref().is_some_and(|t| !t.trim().is_empty());
        let has_description = e.description.as_deref().is_some_and(|d| !d.trim().is_empty());
        if !has_topic && !has_description {
            return Err(invalid(
                "expand_checklist entries need a topic_id or a description".into(),
            ));
        }
    }

    let mut outcome = ReportOutcome::default();

    let file_index = if let Some(phase_id) = action_id.strip_prefix(PHASE_ACTION_PREFIX) {
        let idx = session
            .phase_index(phase_id)
            .ok_or_else(|| invalid(format!("no phase '{phase_id}'")))?;
        if !report.expand_checklist.is_empty() {
            return Err(invalid("expand_checklist requires a file-scoped action".into()));
        }
        let phase = &session.phases[idx];
        if phase.task != PhaseTask::Agent {
            return Err(invalid(format!("phase '{phase_id}' is not performed by the agent")));
        }
        match (phase.status, status) {
            (PhaseStatus::Completed, ItemStatus::Completed) | (PhaseStatus::Skipped, ItemStatus::Skipped) => {
                outcome.replayed = true;
                return Ok(outcome);
            }
            (s, _) if s.is_done() => {
                return Err(invalid(format!("phase is already {}", phase_status_str(s))));
            }
            _ => {}
        }
        if session.current_phase_id.as_deref() != Some(phase_id) {
            return Err(invalid(format!("phase '{phase_id}' is not the current phase")));
        }

        let required = phase.required;
        match status {
            ItemStatus::Skipped if required => {
                return Err(invalid("a required phase cannot be skipped".into()));
            }
            ItemStatus::Completed => {
                session.phases[idx].status = PhaseStatus::Completed;
                outcome.closed_phase = Some(phase_id.to_string());
            }
            ItemStatus::Skipped => {
                session.phases[idx].status = PhaseStatus::Skipped;
                outcome.closed_phase = Some(phase_id.to_string());
            }
            _ => {
                session.status = SessionStatus::Failed;
                outcome.session_failed = true;
            }
        }
        None
    } else {
        let (fi, ii) = session
            .locate_item(action_id)
            .ok_or_else(|| invalid("no such checklist item".into()))?;
        let item = &mut session.files[fi].checklist[ii];
        if item.status.is_terminal() {
            if item.status == status {
                outcome.replayed = true;
                return Ok(outcome);
            }
            return Err(invalid(format!("item is already {}", item.status)));
        }
        item.transition(status);
        if let Some(result) = &report.completed_action.result {
            item.result = Some(result.clone());
        }
        outcome.closed_item = Some((item.id.clone(), status));
        Some(fi)
    };

    let default_file = file_index.map(|fi| session.files[fi].path.clone());

    for finding in &report.findings {
        let mut finding = finding.clone();
        if finding.file.is_none() {
            finding.file = default_file.clone();
        }
        if let Some(target) = finding.file.as_deref().and_then(|p| session.file_index(p)) {
            session.files[target].findings.push(finding.clone());
        }
        session.findings.push(finding);
    }

    for change in &report.proposed_changes {
        let mut change = change.clone();
        if change.file.is_none() {
            change.file = default_file.clone();
        }
        if let Some(target) = change.file.as_deref().and_then(|p| session.file_index(p)) {
            session.files[target].proposed_changes.push(change.clone());
        }
        session.proposed_changes.push(change);
    }

    if let Some(fi) = file_index {
        let file = &mut session.files[fi];
        for expansion in report.expand_checklist.iter().cloned() {
            let id = ChecklistItem::make_id(fi, file.checklist.len());
            file.checklist.push(expansion.into_item(id));
        }
        if !report.expand_checklist.is_empty() {
            outcome.expanded = Some((file.path.clone(), report.expand_checklist.len()));
        }
        file.refresh_status();
    }

    if session.status == SessionStatus::Pending {
        session.status = SessionStatus::InProgress;
    }
    session.recount();
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! The next-action cursor.
//!
//! [`advance`] normalises a session's cursor and picks the single action an
//! agent must perform next. It only moves state forward: past finished
//! phases, past files with nothing open, and onto the chosen item.

use serde::{Deserialize, Serialize};

use waypoint_types::{
    ChecklistItem, ChecklistItemKind, FileStatus, ItemStatus, PatternMatch, Phase, PhaseStatus, PhaseTask,
    SessionStatus, WorkflowSession,
};

/// Prefix of action ids that name a whole phase rather than an item.
pub const PHASE_ACTION_PREFIX: &str = "phase:";

pub fn phase_action_id(phase_id: &str) -> String {
    format!("{PHASE_ACTION_PREFIX}{phase_id}")
}

/// The single thing an agent should do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NextAction {
    /// Work one checklist item of one file.
    PerformItem {
        action_id: String,
        phase_id: String,
        file: String,
        file_index: usize,
        item_type: String,
        description: String,
        required: bool,
        instruction: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern_match: Option<PatternMatch>,
    },
    /// Perform a session-level guided phase and report it.
    PerformPhase {
        action_id: String,
        phase_id: String,
        name: String,
        required: bool,
        instruction: String,
    },
    /// An autonomous phase has not finished; the caller should resume.
    RunAutonomousPhase {
        phase_id: String,
        name: String,
        instruction: String,
    },
    /// Nothing actionable is left. Files whose required items failed stay
    /// incomplete and are named here.
    CompleteWorkflow {
        instruction: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        incomplete_files: Vec<String>,
        /// Ids of required items that failed.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed_items: Vec<String>,
    },
    /// The session is completed or failed.
    Closed {
        status: SessionStatus,
        instruction: String,
    },
}

impl NextAction {
    /// Id a progress report must name, for actions that take one.
    pub fn action_id(&self) -> Option<&str> {
        match self {
            NextAction::PerformItem { action_id, .. } | NextAction::PerformPhase { action_id, .. } => {
                Some(action_id)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

fn item_instruction(phase: &Phase, file: &str, item: &ChecklistItem) -> String {
    let mut text = match &item.kind {
        ChecklistItemKind::Analysis => format!("Analyze {file}: {}", item.description),
        ChecklistItemKind::Validation => format!("Validate {file}: {}", item.description),
        ChecklistItemKind::TopicApplication { topic_id } => {
            format!("Apply knowledge topic '{topic_id}' to {file}: {}", item.description)
        }
        ChecklistItemKind::PatternInstance { pattern_match: m } => {
            let mut s = format!(
                "Review the {} instance of pattern '{}' at {}:{}: `{}`.",
                m.instance_type, m.pattern_id, file, m.line, m.matched_text
            );
            if let Some(r) = m.suggested_replacement.as_deref().filter(|r| !r.is_empty()) {
                s.push_str(&format!(" Suggested replacement: `{r}`."));
            }
            if let Some(a) = &m.suggested_action {
                s.push(' ');
                s.push_str(a);
            }
            if m.requires_manual_review {
                s.push_str(" This instance needs manual review.");
            }
            s
        }
    };
    text.push_str(&format!(
        "\nReport action {} as completed, skipped or failed.",
        item.id
    ));
    if let Some(guidance) = &phase.instruction {
        text.push_str("\n\n");
        text.push_str(guidance);
    }
    text
}

fn phase_instruction(phase: &Phase) -> String {
    let body = phase
        .instruction
        .clone()
        .unwrap_or_else(|| format!("Perform the '{}' phase: {}", phase.name, phase.description));
    format!(
        "{body}\nReport action {} as completed when done.",
        phase_action_id(&phase.id)
    )
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// First file with open items, searching from `from` and wrapping around.
fn next_open_file(session: &WorkflowSession, from: usize) -> Option<usize> {
    let n = session.files.len();
    (from..n)
        .chain(0..from.min(n))
        .find(|&fi| session.files[fi].has_open_items())
}

fn next_item(session: &mut WorkflowSession, phase_index: usize) -> Option<NextAction> {
    let fi = next_open_file(session, session.current_file_index)?;
    if fi != session.current_file_index {
        tracing::debug!(session_id = %session.id, file = %session.files[fi].path, "File cursor advanced");
        session.current_file_index = fi;
    }

    let file = &mut session.files[fi];
    let ii = file.first_open_item()?;
    let item = &mut file.checklist[ii];
    if item.status == ItemStatus::Pending {
        item.transition(ItemStatus::InProgress);
    }
    let item = item.clone();
    file.refresh_status();
    let path = file.path.clone();
    session.recount();

    let phase = &session.phases[phase_index];
    Some(NextAction::PerformItem {
        action_id: item.id.clone(),
        phase_id: phase.id.clone(),
        file: path.clone(),
        file_index: fi,
        item_type: item.kind.type_name().to_string(),
        description: item.description.clone(),
        required: item.required,
        instruction: item_instruction(phase, &path, &item),
        topic_id: match &item.kind {
            ChecklistItemKind::TopicApplication { topic_id } => Some(topic_id.clone()),
            _ => None,
        },
        pattern_match: item.pattern_match().cloned(),
    })
}

/// Normalise the cursor and return the next action. Calling this again
/// without intervening progress returns the same action.
pub fn advance(session: &mut WorkflowSession) -> NextAction {
    if session.status.is_terminal() {
        return NextAction::Closed {
            status: session.status,
            instruction: format!("Session is {}; no further work is accepted.", session.status),
        };
    }

    let start = session.current_phase_index().unwrap_or(0);
    for idx in start..session.phases.len() {
        if session.phases[idx].status.is_done() {
            continue;
        }
        let phase_id = session.phases[idx].id.clone();
        if session.current_phase_id.as_deref() != Some(phase_id.as_str()) {
            tracing::debug!(session_id = %session.id, phase = %phase_id, "Phase cursor advanced");
            session.current_phase_id = Some(phase_id.clone());
        }

        match session.phases[idx].task {
            PhaseTask::Inventory => {
                // the inventory is built by start itself
                session.phases[idx].status = PhaseStatus::Completed;
            }
            PhaseTask::PatternDiscovery => {
                let phase = &session.phases[idx];
                return NextAction::RunAutonomousPhase {
                    phase_id,
                    name: phase.name.clone(),
                    instruction: format!(
                        "Phase '{}' runs inside the engine and has not finished. Resume the session to continue it.",
                        phase.name
                    ),
                };
            }
            PhaseTask::FileChecklist => {
                if session.phases[idx].status == PhaseStatus::Pending {
                    session.phases[idx].status = PhaseStatus::InProgress;
                }
                if let Some(action) = next_item(session, idx) {
                    return action;
                }
                session.phases[idx].status = PhaseStatus::Completed;
                session.current_file_index = session.files.len();
                tracing::info!(session_id = %session.id, phase = %phase_id, "Checklist phase completed");
            }
            PhaseTask::Agent => {
                let phase = &mut session.phases[idx];
                if phase.status == PhaseStatus::Pending {
                    phase.status = PhaseStatus::InProgress;
                }
                return NextAction::PerformPhase {
                    action_id: phase_action_id(&phase.id),
                    phase_id,
                    name: phase.name.clone(),
                    required: phase.required,
                    instruction: phase_instruction(phase),
                };
            }
        }
    }

    completion_action(session)
}

fn completion_action(session: &WorkflowSession) -> NextAction {
    let incomplete_files: Vec<String> = session
        .files
        .iter()
        .filter(|f| f.status != FileStatus::Completed)
        .map(|f| f.path.clone())
        .collect();
    let failed_items: Vec<String> = session
        .files
        .iter()
        .flat_map(|f| f.checklist.iter())
        .filter(|i| i.required && i.status == ItemStatus::Failed)
        .map(|i| i.id.clone())
        .collect();

    let instruction = if incomplete_files.is_empty() && failed_items.is_empty() {
        "All required work is done. Complete the session to produce the final report.".to_string()
    } else {
        format!(
            "No actions remain, but {} file(s) are not completed ({}) and {} required item(s) failed ({}). \
             Complete the session to produce the final report, which lists them.",
            incomplete_files.len(),
            incomplete_files.join(", "),
            failed_items.len(),
            failed_items.join(", ")
        )
    };
    NextAction::CompleteWorkflow {
        instruction,
        incomplete_files,
        failed_items,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

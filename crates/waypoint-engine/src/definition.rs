//! Workflow definitions: immutable templates a session is instantiated from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use waypoint_types::{
    ChecklistItem, ChecklistItemKind, PatternDefinition, Phase, PhaseMode, PhaseStatus, PhaseTask,
};

use crate::transforms::expand_variables;

fn default_true() -> bool {
    true
}

/// Template for one phase of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task: PhaseTask,
    /// Defaults to the task's natural mode when omitted.
    #[serde(default)]
    pub mode: Option<PhaseMode>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub instruction: Option<String>,
}

impl PhaseTemplate {
    pub fn mode(&self) -> PhaseMode {
        self.mode.unwrap_or_else(|| self.task.mode())
    }

    pub fn instantiate(&self, vars: &HashMap<String, String>) -> Phase {
        Phase {
            id: self.id.clone(),
            name: self.name.clone(),
            description: expand_variables(&self.description, vars),
            mode: self.mode(),
            task: self.task,
            required: self.required,
            status: PhaseStatus::Pending,
            instruction: self
                .instruction
                .as_deref()
                .map(|i| expand_variables(i, vars)),
        }
    }
}

/// Template for one per-file checklist item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistTemplateItem {
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(flatten)]
    pub kind: ChecklistItemKind,
}

/// Immutable template for one workflow type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<PhaseTemplate>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub checklist: Vec<ChecklistTemplateItem>,
    #[serde(default)]
    pub patterns: Vec<PatternDefinition>,
    /// Option keys `start` must be given.
    #[serde(default)]
    pub required_options: Vec<String>,
}

impl WorkflowDefinition {
    pub fn instantiate_phases(&self, vars: &HashMap<String, String>) -> Vec<Phase> {
        self.phases.iter().map(|p| p.instantiate(vars)).collect()
    }

    /// Checklist items for the `file_index`-th file of the inventory.
    pub fn instantiate_checklist(
        &self,
        file_index: usize,
        vars: &HashMap<String, String>,
    ) -> Vec<ChecklistItem> {
        self.checklist
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut item = ChecklistItem::new(
                    ChecklistItem::make_id(file_index, i),
                    expand_variables(&t.description, vars),
                    t.kind.clone(),
                );
                item.required = t.required;
                item
            })
            .collect()
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseTemplate> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn has_task(&self, task: PhaseTask) -> bool {
        self.phases.iter().any(|p| p.task == task)
    }
}

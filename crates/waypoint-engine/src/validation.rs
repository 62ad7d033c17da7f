//! Definition validation: lint rules and diagnostics.
//!
//! Every [`WorkflowDefinition`] is checked by these rules before it is
//! registered. Call [`validate`] for advisory diagnostics or
//! [`validate_or_raise`] to fail on the first `Error`-severity issue.

use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;

use waypoint_patterns::CompiledPattern;
use waypoint_tools::build_glob_set;
use waypoint_types::{ChecklistItemKind, PatternMatch, PhaseTask, WaypointError};

use crate::definition::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic>;
}

impl Diagnostic {
    fn new(rule: &dyn LintRule, severity: Severity, message: String) -> Self {
        Self {
            rule: rule.name().into(),
            severity,
            message,
            phase_id: None,
            pattern_id: None,
            fix: None,
        }
    }

    fn phase(mut self, phase_id: &str) -> Self {
        self.phase_id = Some(phase_id.to_string());
        self
    }

    fn pattern(mut self, pattern_id: &str) -> Self {
        self.pattern_id = Some(pattern_id.to_string());
        self
    }

    fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Helper predicates
// ---------------------------------------------------------------------------

/// Probe spans a catch-all classifier matches without exception.
const CATCH_ALL_PROBES: &[&str] = &["a", "Z", "0", " ", "'", "(", ";", "_", "é"];

fn is_catch_all(pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match("") || CATCH_ALL_PROBES.iter().all(|p| re.is_match(p)),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct WorkflowTypeRule;
impl LintRule for WorkflowTypeRule {
    fn name(&self) -> &str { "workflow_type_valid" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        let t = &def.workflow_type;
        if t.is_empty() || t.chars().any(char::is_whitespace) {
            vec![Diagnostic::new(
                self,
                Severity::Error,
                format!("Workflow type '{t}' must be non-empty and contain no whitespace"),
            )
            .fix("Use a kebab-case identifier such as \"perf-audit\"")]
        } else {
            vec![]
        }
    }
}

struct HasPhasesRule;
impl LintRule for HasPhasesRule {
    fn name(&self) -> &str { "has_phases" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        if def.phases.is_empty() {
            vec![Diagnostic::new(self, Severity::Error, "Workflow defines no phases".into())
                .fix("Add at least an inventory phase")]
        } else {
            vec![]
        }
    }
}

struct UniquePhaseIdsRule;
impl LintRule for UniquePhaseIdsRule {
    fn name(&self) -> &str { "unique_phase_ids" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        def.phases
            .iter()
            .filter(|p| !seen.insert(p.id.as_str()))
            .map(|p| {
                Diagnostic::new(self, Severity::Error, format!("Phase id '{}' is declared more than once", p.id))
                    .phase(&p.id)
            })
            .collect()
    }
}

struct InventoryFirstRule;
impl LintRule for InventoryFirstRule {
    fn name(&self) -> &str { "inventory_first" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        let inventories: Vec<_> = def
            .phases
            .iter()
            .filter(|p| p.task == PhaseTask::Inventory)
            .collect();
        let first_is_inventory = def
            .phases
            .first()
            .is_some_and(|p| p.task == PhaseTask::Inventory);
        if def.phases.is_empty() {
            vec![]
        } else if inventories.len() != 1 || !first_is_inventory {
            vec![Diagnostic::new(
                self,
                Severity::Error,
                format!(
                    "Workflow must start with exactly one inventory phase (found {})",
                    inventories.len()
                ),
            )
            .fix("Declare a single phase with task \"inventory\" as the first phase")]
        } else {
            vec![]
        }
    }
}

struct ModeMatchesTaskRule;
impl LintRule for ModeMatchesTaskRule {
    fn name(&self) -> &str { "mode_matches_task" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        def.phases
            .iter()
            .filter(|p| p.mode.is_some_and(|m| m != p.task.mode()))
            .map(|p| {
                Diagnostic::new(
                    self,
                    Severity::Error,
                    format!(
                        "Phase '{}' declares mode {:?} but task {:?} runs {:?}",
                        p.id,
                        p.mode(),
                        p.task,
                        p.task.mode()
                    ),
                )
                .phase(&p.id)
                .fix("Remove the explicit mode or make it match the task")
            })
            .collect()
    }
}

struct SingleFileChecklistPhaseRule;
impl LintRule for SingleFileChecklistPhaseRule {
    fn name(&self) -> &str { "single_file_checklist_phase" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        let count = def
            .phases
            .iter()
            .filter(|p| p.task == PhaseTask::FileChecklist)
            .count();
        let has_items = !def.checklist.is_empty() || !def.patterns.is_empty();
        if count > 1 {
            vec![Diagnostic::new(
                self,
                Severity::Error,
                format!("Workflow declares {count} file_checklist phases; at most one is allowed"),
            )]
        } else if count == 0 && has_items {
            vec![Diagnostic::new(
                self,
                Severity::Error,
                "Workflow has checklist items or patterns but no file_checklist phase to work them".into(),
            )
            .fix("Add a guided phase with task \"file_checklist\"")]
        } else {
            vec![]
        }
    }
}

struct IncludeGlobsValidRule;
impl LintRule for IncludeGlobsValidRule {
    fn name(&self) -> &str { "include_globs_valid" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        match build_glob_set(&def.include) {
            Ok(_) => vec![],
            Err(e) => vec![Diagnostic::new(self, Severity::Error, format!("Invalid include glob: {e}"))],
        }
    }
}

struct ExcludeGlobsValidRule;
impl LintRule for ExcludeGlobsValidRule {
    fn name(&self) -> &str { "exclude_globs_valid" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        match build_glob_set(&def.exclude) {
            Ok(_) => vec![],
            Err(e) => vec![Diagnostic::new(self, Severity::Error, format!("Invalid exclude glob: {e}"))],
        }
    }
}

struct ChecklistTemplateKindsRule;
impl LintRule for ChecklistTemplateKindsRule {
    fn name(&self) -> &str { "checklist_template_kinds" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        def.checklist
            .iter()
            .filter_map(|t| match &t.kind {
                ChecklistItemKind::PatternInstance { .. } => Some(
                    Diagnostic::new(
                        self,
                        Severity::Error,
                        format!("Checklist template '{}' is a pattern_instance; those come from discovery", t.description),
                    )
                    .fix("Declare a pattern definition instead"),
                ),
                ChecklistItemKind::TopicApplication { topic_id } if topic_id.trim().is_empty() => Some(
                    Diagnostic::new(
                        self,
                        Severity::Error,
                        format!("Checklist template '{}' has an empty topic_id", t.description),
                    ),
                ),
                _ => None,
            })
            .collect()
    }
}

struct PatternRegexValidRule;
impl LintRule for PatternRegexValidRule {
    fn name(&self) -> &str { "pattern_regex_valid" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        def.patterns
            .iter()
            .filter_map(|p| CompiledPattern::compile(p).err().map(|e| (p, e)))
            .map(|(p, e)| Diagnostic::new(self, Severity::Error, e.to_string()).pattern(&p.id))
            .collect()
    }
}

struct UniquePatternIdsRule;
impl LintRule for UniquePatternIdsRule {
    fn name(&self) -> &str { "unique_pattern_ids" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        def.patterns
            .iter()
            .filter(|p| !seen.insert(p.id.as_str()))
            .map(|p| {
                Diagnostic::new(self, Severity::Error, format!("Pattern id '{}' is declared more than once", p.id))
                    .pattern(&p.id)
            })
            .collect()
    }
}

struct ClassifierNamesUniqueRule;
impl LintRule for ClassifierNamesUniqueRule {
    fn name(&self) -> &str { "classifier_names_unique" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for p in &def.patterns {
            let mut seen = HashSet::new();
            for rule in &p.classifiers {
                if !seen.insert(rule.name.as_str()) {
                    diags.push(
                        Diagnostic::new(
                            self,
                            Severity::Warning,
                            format!("Classifier '{}' is declared more than once; later copies never match", rule.name),
                        )
                        .pattern(&p.id),
                    );
                }
            }
        }
        diags
    }
}

/// Classification is first-match in declared order, so a rule that matches
/// everything hides every rule after it.
struct ClassifierShadowingRule;
impl LintRule for ClassifierShadowingRule {
    fn name(&self) -> &str { "classifier_shadowing" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for p in &def.patterns {
            let last = p.classifiers.len().saturating_sub(1);
            for (i, rule) in p.classifiers.iter().enumerate() {
                if i < last && is_catch_all(&rule.pattern) {
                    let hidden: Vec<_> = p.classifiers[i + 1..].iter().map(|r| r.name.as_str()).collect();
                    diags.push(
                        Diagnostic::new(
                            self,
                            Severity::Warning,
                            format!(
                                "Classifier '{}' matches every span and shadows {}",
                                rule.name,
                                hidden.join(", ")
                            ),
                        )
                        .pattern(&p.id)
                        .fix("Declare catch-all classifiers last"),
                    );
                }
            }
        }
        diags
    }
}

struct TransformationKeysKnownRule;
impl LintRule for TransformationKeysKnownRule {
    fn name(&self) -> &str { "transformation_keys_known" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for p in &def.patterns {
            for key in p.transformations.keys() {
                let known = key == PatternMatch::UNCLASSIFIED
                    || p.classifiers.iter().any(|r| &r.name == key);
                if !known {
                    diags.push(
                        Diagnostic::new(
                            self,
                            Severity::Warning,
                            format!("Transformation '{key}' has no classifier of that name and is never used"),
                        )
                        .pattern(&p.id),
                    );
                }
            }
        }
        diags
    }
}

struct DiscoveryPhaseHasPatternsRule;
impl LintRule for DiscoveryPhaseHasPatternsRule {
    fn name(&self) -> &str { "discovery_phase_has_patterns" }
    fn apply(&self, def: &WorkflowDefinition) -> Vec<Diagnostic> {
        let discovery: Vec<_> = def
            .phases
            .iter()
            .filter(|p| p.task == PhaseTask::PatternDiscovery)
            .collect();
        if !discovery.is_empty() && def.patterns.is_empty() {
            discovery
                .iter()
                .map(|p| {
                    Diagnostic::new(
                        self,
                        Severity::Warning,
                        format!("Discovery phase '{}' has no patterns to run", p.id),
                    )
                    .phase(&p.id)
                })
                .collect()
        } else if discovery.is_empty() && !def.patterns.is_empty() {
            vec![Diagnostic::new(
                self,
                Severity::Warning,
                format!("{} pattern(s) declared but no pattern_discovery phase runs them", def.patterns.len()),
            )]
        } else {
            vec![]
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(def: &WorkflowDefinition) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(WorkflowTypeRule),
        Box::new(HasPhasesRule),
        Box::new(UniquePhaseIdsRule),
        Box::new(InventoryFirstRule),
        Box::new(ModeMatchesTaskRule),
        Box::new(SingleFileChecklistPhaseRule),
        Box::new(IncludeGlobsValidRule),
        Box::new(ExcludeGlobsValidRule),
        Box::new(ChecklistTemplateKindsRule),
        Box::new(PatternRegexValidRule),
        Box::new(UniquePatternIdsRule),
        Box::new(ClassifierNamesUniqueRule),
        Box::new(ClassifierShadowingRule),
        Box::new(TransformationKeysKnownRule),
        Box::new(DiscoveryPhaseHasPatternsRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(def));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(def: &WorkflowDefinition) -> waypoint_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(def);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(WaypointError::InvalidDefinition {
            workflow_type: def.workflow_type.clone(),
            message: messages.join("; "),
        });
    }
    for d in &diagnostics {
        tracing::warn!(workflow = %def.workflow_type, rule = %d.rule, "{}", d.message);
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

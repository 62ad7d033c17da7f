//! Batch operations over pattern-instance checklist items.
//!
//! Selection and mutation are pure functions of a session. Token handling,
//! locking and reading current file contents live in the session manager.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use waypoint_patterns::match_still_present;
use waypoint_types::{ChecklistItem, ItemStatus, PatternMatch, Result, WaypointError, WorkflowSession};

/// Before/after pairs shown in a preview.
pub const MAX_SAMPLES: usize = 5;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Operation and filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    ApplyFixes,
    SkipInstances,
    FlagForReview,
    /// Read-only report; never needs a token.
    GroupByType,
}

impl BatchOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchOperation::ApplyFixes => "apply_fixes",
            BatchOperation::SkipInstances => "skip_instances",
            BatchOperation::FlagForReview => "flag_for_review",
            BatchOperation::GroupByType => "group_by_type",
        }
    }

    pub fn is_read_only(self) -> bool {
        self == BatchOperation::GroupByType
    }
}

impl std::fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchOperation {
    type Err = WaypointError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "apply_fixes" => Ok(BatchOperation::ApplyFixes),
            "skip_instances" => Ok(BatchOperation::SkipInstances),
            "flag_for_review" => Ok(BatchOperation::FlagForReview),
            "group_by_type" => Ok(BatchOperation::GroupByType),
            other => Err(WaypointError::InvalidOperation {
                operation: other.to_string(),
            }),
        }
    }
}

/// Selects pattern-instance items. Empty lists place no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFilter {
    #[serde(default)]
    pub instance_types: Vec<String>,
    /// Substrings of the file path; any one matching is enough.
    #[serde(default)]
    pub file_paths: Vec<String>,
    /// Exact status to select. When absent only open items are selected.
    #[serde(default)]
    pub status: Option<ItemStatus>,
    #[serde(default)]
    pub auto_fixable_only: bool,
}

impl BatchFilter {
    /// Sorted, deduplicated form used when comparing filters.
    pub fn normalized(mut self) -> Self {
        self.instance_types.sort();
        self.instance_types.dedup();
        self.file_paths.sort();
        self.file_paths.dedup();
        self
    }

    pub fn matches(&self, file_path: &str, item: &ChecklistItem) -> bool {
        let Some(m) = item.pattern_match() else {
            return false;
        };
        let status_ok = match self.status {
            Some(s) => item.status == s,
            None => item.status.is_open(),
        };
        status_ok
            && (self.instance_types.is_empty() || self.instance_types.contains(&m.instance_type))
            && (self.file_paths.is_empty() || self.file_paths.iter().any(|p| file_path.contains(p.as_str())))
            && (!self.auto_fixable_only || (m.auto_fixable && !m.requires_manual_review))
    }
}

/// `(file_index, item_index)` of every item matching `filter`, in inventory
/// then checklist order.
pub fn select(session: &WorkflowSession, filter: &BatchFilter) -> Vec<(usize, usize)> {
    session
        .files
        .iter()
        .enumerate()
        .flat_map(|(fi, file)| {
            file.checklist
                .iter()
                .enumerate()
                .filter(|(_, item)| filter.matches(&file.path, item))
                .map(move |(ii, _)| (fi, ii))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Current file contents
// ---------------------------------------------------------------------------

/// Current text of files touched by a batch; `None` marks an unreadable file.
pub type SourceMap = HashMap<String, Option<String>>;

/// Whether a recorded match still describes the file it came from. Files
/// missing from `sources` are not checked.
fn check_source(sources: &SourceMap, m: &PatternMatch) -> std::result::Result<(), String> {
    match sources.get(&m.file) {
        Some(Some(content)) if !match_still_present(content, m) => {
            Err(format!("line {} no longer contains the matched text", m.line))
        }
        Some(None) => Err("file could not be read".to_string()),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSample {
    pub item_id: String,
    pub file: String,
    pub line: usize,
    pub instance_type: String,
    pub before: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl InstanceSample {
    fn of(item: &ChecklistItem, m: &PatternMatch) -> Self {
        Self {
            item_id: item.id.clone(),
            file: m.file.clone(),
            line: m.line,
            instance_type: m.instance_type.clone(),
            before: m.matched_text.clone(),
            after: m.suggested_replacement.clone(),
        }
    }
}

/// Dry-run result. No session state was changed to produce it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPreview {
    pub operation: BatchOperation,
    pub filter: BatchFilter,
    pub instances_affected: usize,
    pub files_affected: usize,
    pub by_instance_type: BTreeMap<String, usize>,
    /// Selected fixes whose file no longer contains the matched text; they
    /// will fail on execute.
    pub stale_instances: usize,
    pub samples: Vec<InstanceSample>,
    pub confirmation_token: String,
    pub confirmation_prompt: String,
}

impl BatchPreview {
    pub fn with_token(mut self, session_id: &str, token: String) -> Self {
        self.confirmation_prompt = format!(
            "{} will change {} instance(s) across {} file(s) in session {}. \
             Re-run with confirmation_token {} to proceed.",
            self.operation, self.instances_affected, self.files_affected, session_id, token
        );
        self.confirmation_token = token;
        self
    }
}

/// A per-item failure; the rest of the batch still applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub item_id: String,
    pub file: String,
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchExecution {
    pub operation: Option<BatchOperation>,
    pub instances_matched: usize,
    pub modified: usize,
    pub failed: usize,
    pub by_instance_type: BTreeMap<String, usize>,
    /// Fixes recorded by `apply_fixes`, for the caller to write to disk.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub applied: Vec<InstanceSample>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub count: usize,
    pub auto_fixable: usize,
    pub manual_review: usize,
    pub files: Vec<String>,
    pub item_ids: Vec<String>,
    pub samples: Vec<InstanceSample>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupReport {
    pub total: usize,
    pub groups: BTreeMap<String, InstanceGroup>,
}

/// What a batch request returned, tagged by `mode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BatchResponse {
    DryRun(BatchPreview),
    Executed(BatchExecution),
    Grouped(GroupReport),
}

/// A batch request as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operation: String,
    #[serde(default)]
    pub filter: BatchFilter,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub confirmation_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Compute what `operation` would do. `confirmation_token` is left empty.
pub fn preview(
    session: &WorkflowSession,
    operation: BatchOperation,
    filter: &BatchFilter,
    sources: Option<&SourceMap>,
) -> BatchPreview {
    let selected = select(session, filter);
    let mut files = BTreeSet::new();
    let mut by_instance_type = BTreeMap::new();
    let mut samples = Vec::new();
    let mut stale_instances = 0;

    for &(fi, ii) in &selected {
        let item = &session.files[fi].checklist[ii];
        let Some(m) = item.pattern_match() else { continue };
        files.insert(fi);
        *by_instance_type.entry(m.instance_type.clone()).or_default() += 1;
        if let Some(sources) = sources {
            if check_source(sources, m).is_err() {
                stale_instances += 1;
            }
        }
        if samples.len() < MAX_SAMPLES {
            samples.push(InstanceSample::of(item, m));
        }
    }

    BatchPreview {
        operation,
        filter: filter.clone(),
        instances_affected: selected.len(),
        files_affected: files.len(),
        by_instance_type,
        stale_instances,
        samples,
        confirmation_token: String::new(),
        confirmation_prompt: String::new(),
    }
}

/// Re-resolve `filter` against the current session and apply `operation`
/// item by item. Failures are collected; nothing is rolled back.
pub fn execute(
    session: &mut WorkflowSession,
    operation: BatchOperation,
    filter: &BatchFilter,
    sources: Option<&SourceMap>,
) -> Result<BatchExecution> {
    if operation.is_read_only() {
        return Err(WaypointError::InvalidOperation {
            operation: format!("{operation} cannot be executed"),
        });
    }

    let selected = select(session, filter);
    let mut result = BatchExecution {
        operation: Some(operation),
        instances_matched: selected.len(),
        ..BatchExecution::default()
    };
    let mut touched = BTreeSet::new();
    let mut auto_fixed = 0;

    for (fi, ii) in selected {
        let item = &mut session.files[fi].checklist[ii];
        let Some(m) = item.pattern_match().cloned() else { continue };
        let fail = |reason: String| BatchFailure {
            item_id: item.id.clone(),
            file: m.file.clone(),
            line: m.line,
            reason,
        };

        let outcome: std::result::Result<(), String> = match operation {
            BatchOperation::ApplyFixes => {
                if !m.has_applicable_fix() {
                    Err("no applicable fix; requires manual review".to_string())
                } else if let Err(reason) = sources.map_or(Ok(()), |s| check_source(s, &m)) {
                    Err(reason)
                } else if !item.status.can_transition_to(ItemStatus::Completed) {
                    Err(format!("item is already {}", item.status))
                } else {
                    Ok(())
                }
            }
            BatchOperation::SkipInstances if !item.status.can_transition_to(ItemStatus::Skipped) => {
                Err(format!("item is already {}", item.status))
            }
            _ => Ok(()),
        };

        if let Err(reason) = outcome {
            result.failures.push(fail(reason));
            continue;
        }

        match operation {
            BatchOperation::ApplyFixes => {
                item.transition(ItemStatus::Completed);
                item.result = m.suggested_replacement.clone();
                result.applied.push(InstanceSample::of(item, &m));
                auto_fixed += 1;
            }
            BatchOperation::SkipInstances => {
                item.transition(ItemStatus::Skipped);
                item.result = Some("skipped by batch operation".to_string());
            }
            BatchOperation::FlagForReview => {
                if let Some(pm) = item.pattern_match_mut() {
                    pm.requires_manual_review = true;
                }
            }
            BatchOperation::GroupByType => {}
        }
        result.modified += 1;
        *result
            .by_instance_type
            .entry(m.instance_type.clone())
            .or_default() += 1;
        touched.insert(fi);
    }

    for fi in touched {
        session.files[fi].refresh_status();
    }
    session.counters.instances_auto_fixed += auto_fixed;
    session.recount();
    result.failed = result.failures.len();
    Ok(result)
}

/// Bucket matching instances by instance type.
pub fn group_by_type(session: &WorkflowSession, filter: &BatchFilter) -> GroupReport {
    let mut report = GroupReport::default();
    for (fi, ii) in select(session, filter) {
        let file = &session.files[fi];
        let item = &file.checklist[ii];
        let Some(m) = item.pattern_match() else { continue };
        let group = report.groups.entry(m.instance_type.clone()).or_default();
        group.count += 1;
        if m.auto_fixable && !m.requires_manual_review {
            group.auto_fixable += 1;
        }
        if m.requires_manual_review {
            group.manual_review += 1;
        }
        if !group.files.contains(&file.path) {
            group.files.push(file.path.clone());
        }
        group.item_ids.push(item.id.clone());
        if group.samples.len() < MAX_SAMPLES {
            group.samples.push(InstanceSample::of(item, m));
        }
        report.total += 1;
    }
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

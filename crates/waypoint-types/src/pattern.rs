//! Pattern definitions (scan rules supplied as configuration data) and the
//! concrete matches the discovery engine produces from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Regex flags applied to a pattern's inclusion expression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternFlags {
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub multi_line: bool,
    #[serde(default)]
    pub dot_matches_new_line: bool,
}

/// One ordered classification rule. The first rule whose `pattern` matches a
/// span assigns `name` as the span's instance type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub suggested_action: Option<String>,
    #[serde(default)]
    pub auto_fixable: bool,
}

/// A reusable scan rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub regex: String,
    #[serde(default)]
    pub flags: PatternFlags,
    /// Lines containing a match that also match this expression are discarded.
    #[serde(default)]
    pub exclude: Option<String>,
    /// Lines of context captured on either side of a match.
    #[serde(default)]
    pub context_lines: usize,
    #[serde(default)]
    pub classifiers: Vec<ClassifierRule>,
    /// Replacement templates keyed by instance type. `$1` / `${name}` expand to
    /// capture groups of the inclusion regex.
    #[serde(default)]
    pub transformations: BTreeMap<String, String>,
}

/// One concrete match of a [`PatternDefinition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub file: String,
    /// 1-based line of the start of the match.
    pub line: usize,
    /// 1-based column (in characters) of the start of the match.
    pub column: usize,
    pub matched_text: String,
    #[serde(default)]
    pub context: Vec<String>,
    pub instance_type: String,
    #[serde(default)]
    pub suggested_action: Option<String>,
    #[serde(default)]
    pub suggested_replacement: Option<String>,
    #[serde(default)]
    pub auto_fixable: bool,
    #[serde(default)]
    pub requires_manual_review: bool,
}

impl PatternMatch {
    /// Instance type assigned when no classifier rule matches.
    pub const UNCLASSIFIED: &'static str = "other";

    /// Key used to deduplicate matches materialised into a checklist.
    pub fn dedup_key(&self) -> (String, String, usize) {
        (self.file.clone(), self.pattern_id.clone(), self.line)
    }

    /// A fix can be applied mechanically: there is a suggestion and nothing
    /// asks for a human to look first.
    pub fn has_applicable_fix(&self) -> bool {
        !self.requires_manual_review
            && self
                .suggested_replacement
                .as_deref()
                .is_some_and(|s| !s.is_empty())
    }
}

/// Aggregate outcome of an autonomous discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub files_scanned: usize,
    pub files_with_matches: usize,
    pub files_failed: usize,
    pub patterns_skipped: usize,
    pub total_instances: usize,
    pub by_instance_type: BTreeMap<String, usize>,
    pub by_pattern: BTreeMap<String, usize>,
    pub auto_fixable: usize,
    pub auto_fixable_by_type: BTreeMap<String, usize>,
    pub manual_review: usize,
    /// `false` when the pass stopped at its deadline before visiting every file.
    pub complete: bool,
}

impl DiscoverySummary {
    /// Fold one match into the counters.
    pub fn record(&mut self, m: &PatternMatch) {
        self.total_instances += 1;
        *self
            .by_instance_type
            .entry(m.instance_type.clone())
            .or_default() += 1;
        *self.by_pattern.entry(m.pattern_id.clone()).or_default() += 1;
        if m.auto_fixable && !m.requires_manual_review {
            self.auto_fixable += 1;
            *self
                .auto_fixable_by_type
                .entry(m.instance_type.clone())
                .or_default() += 1;
        }
        if m.requires_manual_review {
            self.manual_review += 1;
        }
    }

    /// Files this pass already visited, successfully or not.
    pub fn files_visited(&self) -> usize {
        self.files_scanned + self.files_failed
    }

    /// Fold a continuation pass into this summary. `complete` follows `next`.
    pub fn merge(&mut self, next: &DiscoverySummary) {
        fn add_all(into: &mut BTreeMap<String, usize>, from: &BTreeMap<String, usize>) {
            for (k, v) in from {
                *into.entry(k.clone()).or_default() += v;
            }
        }
        self.files_scanned += next.files_scanned;
        self.files_with_matches += next.files_with_matches;
        self.files_failed += next.files_failed;
        self.patterns_skipped = next.patterns_skipped;
        self.total_instances += next.total_instances;
        add_all(&mut self.by_instance_type, &next.by_instance_type);
        add_all(&mut self.by_pattern, &next.by_pattern);
        self.auto_fixable += next.auto_fixable;
        add_all(&mut self.auto_fixable_by_type, &next.auto_fixable_by_type);
        self.manual_review += next.manual_review;
        self.complete = next.complete;
    }
}

//! The pattern discovery pass: every pattern over every file, with per-file
//! and per-pattern failures logged and skipped.

use std::path::Path;

use tokio::time::Instant;

use waypoint_tools::ContentStore;
use waypoint_types::{DiscoverySummary, PatternDefinition, PatternMatch};

use crate::compiled::CompiledPattern;

/// An ordered collection of compiled patterns.
pub struct PatternSet {
    patterns: Vec<CompiledPattern>,
    skipped: usize,
}

impl PatternSet {
    /// Compile every definition, logging and skipping malformed ones.
    pub fn compile(definitions: &[PatternDefinition]) -> Self {
        let mut patterns = Vec::with_capacity(definitions.len());
        let mut skipped = 0;
        for def in definitions {
            match CompiledPattern::compile(def) {
                Ok(p) => patterns.push(p),
                Err(e) => {
                    tracing::warn!(pattern = %def.id, error = %e, "Skipping malformed pattern");
                    skipped += 1;
                }
            }
        }
        Self { patterns, skipped }
    }

    /// Compile every definition, failing on the first malformed one.
    pub fn compile_strict(definitions: &[PatternDefinition]) -> waypoint_types::Result<Self> {
        let patterns = definitions
            .iter()
            .map(CompiledPattern::compile)
            .collect::<waypoint_types::Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            skipped: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn get(&self, pattern_id: &str) -> Option<&CompiledPattern> {
        self.patterns.iter().find(|p| p.id() == pattern_id)
    }

    /// All matches of all patterns in one file: patterns in declared order,
    /// matches in text order.
    pub fn scan_text(&self, file: &str, content: &str) -> Vec<PatternMatch> {
        self.patterns
            .iter()
            .flat_map(|p| p.find_matches(file, content))
            .collect()
    }
}

/// Result of a discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub matches: Vec<PatternMatch>,
    pub summary: DiscoverySummary,
}

/// Runs a [`PatternSet`] over files read from a [`ContentStore`].
pub struct DiscoveryEngine<'a> {
    store: &'a dyn ContentStore,
}

impl<'a> DiscoveryEngine<'a> {
    pub fn new(store: &'a dyn ContentStore) -> Self {
        Self { store }
    }

    /// Scan `files` (root-relative) in order. Stops before the next file once
    /// `deadline` has passed, reporting `summary.complete = false`.
    pub async fn discover(
        &self,
        root: &Path,
        files: &[String],
        patterns: &PatternSet,
        deadline: Option<Instant>,
    ) -> DiscoveryOutcome {
        let mut outcome = DiscoveryOutcome {
            summary: DiscoverySummary {
                patterns_skipped: patterns.skipped(),
                complete: true,
                ..DiscoverySummary::default()
            },
            ..DiscoveryOutcome::default()
        };

        for file in files {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(
                    scanned = outcome.summary.files_scanned,
                    remaining = files.len() - outcome.summary.files_scanned - outcome.summary.files_failed,
                    "Discovery deadline reached"
                );
                outcome.summary.complete = false;
                break;
            }

            let content = match self.store.read_file(root, file).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "Skipping unreadable file");
                    outcome.summary.files_failed += 1;
                    continue;
                }
            };
            outcome.summary.files_scanned += 1;

            let found = patterns.scan_text(file, &content);
            if !found.is_empty() {
                outcome.summary.files_with_matches += 1;
            }
            for m in &found {
                outcome.summary.record(m);
            }
            outcome.matches.extend(found);
        }

        tracing::info!(
            files = outcome.summary.files_scanned,
            instances = outcome.summary.total_instances,
            complete = outcome.summary.complete,
            "Pattern discovery finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use waypoint_tools::MemoryContentStore;
    use waypoint_types::ClassifierRule;

    fn find_pattern() -> PatternDefinition {
        let mut transformations = BTreeMap::new();
        transformations.insert("find_first".to_string(), "$1.FindFirst()".to_string());
        PatternDefinition {
            id: "find-dash".into(),
            description: String::new(),
            regex: r"(\w+)\.FIND\('-'\)".into(),
            flags: Default::default(),
            exclude: None,
            context_lines: 0,
            classifiers: vec![ClassifierRule {
                name: "find_first".into(),
                pattern: ".".into(),
                suggested_action: None,
                auto_fixable: true,
            }],
            transformations,
        }
    }

    fn broken_pattern() -> PatternDefinition {
        PatternDefinition {
            id: "broken".into(),
            regex: "(".into(),
            ..find_pattern()
        }
    }

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn malformed_patterns_are_skipped() {
        let set = PatternSet::compile(&[broken_pattern(), find_pattern()]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.skipped(), 1);
        assert!(set.get("find-dash").is_some());
        assert!(PatternSet::compile_strict(&[broken_pattern()]).is_err());
    }

    #[tokio::test]
    async fn discover_over_store() {
        let store = MemoryContentStore::new()
            .with_file("a.al", "Cust.FIND('-');\nVend.FIND('-');")
            .with_file("b.al", "nothing here");
        let set = PatternSet::compile(&[find_pattern()]);
        let engine = DiscoveryEngine::new(&store);

        let outcome = engine
            .discover(Path::new("/"), &files(&["a.al", "b.al"]), &set, None)
            .await;

        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(
            outcome.matches[0].suggested_replacement.as_deref(),
            Some("Cust.FindFirst()")
        );
        assert_eq!(outcome.summary.files_scanned, 2);
        assert_eq!(outcome.summary.files_with_matches, 1);
        assert_eq!(outcome.summary.auto_fixable, 2);
        assert!(outcome.summary.complete);
    }

    #[tokio::test]
    async fn unreadable_file_does_not_abort() {
        let store = MemoryContentStore::new().with_file("b.al", "X.FIND('-');");
        let set = PatternSet::compile(&[find_pattern()]);
        let engine = DiscoveryEngine::new(&store);

        let outcome = engine
            .discover(Path::new("/"), &files(&["missing.al", "b.al"]), &set, None)
            .await;

        assert_eq!(outcome.summary.files_failed, 1);
        assert_eq!(outcome.summary.files_scanned, 1);
        assert_eq!(outcome.matches.len(), 1);
    }

    #[tokio::test]
    async fn expired_deadline_stops_before_first_file() {
        let store = MemoryContentStore::new().with_file("a.al", "X.FIND('-');");
        let set = PatternSet::compile(&[find_pattern()]);
        let engine = DiscoveryEngine::new(&store);

        let outcome = engine
            .discover(Path::new("/"), &files(&["a.al"]), &set, Some(Instant::now()))
            .await;

        assert!(!outcome.summary.complete);
        assert!(outcome.matches.is_empty());
    }
}

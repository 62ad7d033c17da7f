//! Compiled form of a [`PatternDefinition`] and span classification.

use regex::{Regex, RegexBuilder};

use waypoint_types::{ClassifierRule, PatternDefinition, PatternMatch, Result, WaypointError};

use crate::lines::LineIndex;

struct CompiledRule {
    rule: ClassifierRule,
    regex: Regex,
}

/// A pattern definition with every expression compiled once.
pub struct CompiledPattern {
    definition: PatternDefinition,
    regex: Regex,
    exclude: Option<Regex>,
    classifiers: Vec<CompiledRule>,
}

fn invalid(pattern_id: &str, what: &str, err: regex::Error) -> WaypointError {
    WaypointError::InvalidPattern {
        pattern_id: pattern_id.to_string(),
        message: format!("{what}: {err}"),
    }
}

impl CompiledPattern {
    pub fn compile(definition: &PatternDefinition) -> Result<Self> {
        let id = definition.id.as_str();
        let regex = RegexBuilder::new(&definition.regex)
            .case_insensitive(definition.flags.case_insensitive)
            .multi_line(definition.flags.multi_line)
            .dot_matches_new_line(definition.flags.dot_matches_new_line)
            .build()
            .map_err(|e| invalid(id, "regex", e))?;

        let exclude = definition
            .exclude
            .as_deref()
            .map(|src| {
                RegexBuilder::new(src)
                    .case_insensitive(definition.flags.case_insensitive)
                    .build()
                    .map_err(|e| invalid(id, "exclude", e))
            })
            .transpose()?;

        let classifiers = definition
            .classifiers
            .iter()
            .map(|rule| {
                RegexBuilder::new(&rule.pattern)
                    .case_insensitive(definition.flags.case_insensitive)
                    .build()
                    .map(|regex| CompiledRule {
                        rule: rule.clone(),
                        regex,
                    })
                    .map_err(|e| invalid(id, &format!("classifier '{}'", rule.name), e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            definition: definition.clone(),
            regex,
            exclude,
            classifiers,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &PatternDefinition {
        &self.definition
    }

    /// The first rule, in declared order, whose sub-pattern matches `span`.
    pub fn classify(&self, span: &str) -> Option<&ClassifierRule> {
        self.classifiers
            .iter()
            .find(|c| c.regex.is_match(span))
            .map(|c| &c.rule)
    }

    /// Every non-excluded match of this pattern in `content`, in text order.
    pub fn find_matches(&self, file: &str, content: &str) -> Vec<PatternMatch> {
        let index = LineIndex::new(content);
        let mut matches = Vec::new();

        for caps in self.regex.captures_iter(content) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.as_str().is_empty() {
                continue;
            }
            let first_line = index.line_of(whole.start());
            let last_line = index.line_of(whole.end() - 1);

            if let Some(ref exclude) = self.exclude {
                if exclude.is_match(index.span_lines(content, first_line, last_line)) {
                    continue;
                }
            }

            let rule = self.classify(whole.as_str());
            let instance_type = rule
                .map(|r| r.name.clone())
                .unwrap_or_else(|| PatternMatch::UNCLASSIFIED.to_string());
            let mut requires_manual_review = rule.is_none();

            let suggested_replacement = match self.definition.transformations.get(&instance_type) {
                Some(template) => {
                    let mut expanded = String::new();
                    caps.expand(template, &mut expanded);
                    Some(expanded)
                }
                None => {
                    requires_manual_review = true;
                    None
                }
            };

            let column = content[index.line_start(first_line)..whole.start()]
                .chars()
                .count()
                + 1;

            matches.push(PatternMatch {
                pattern_id: self.definition.id.clone(),
                file: file.to_string(),
                line: first_line + 1,
                column,
                matched_text: whole.as_str().to_string(),
                context: index.context(
                    content,
                    first_line,
                    last_line,
                    self.definition.context_lines,
                ),
                instance_type,
                suggested_action: rule.and_then(|r| r.suggested_action.clone()),
                auto_fixable: rule.is_some_and(|r| r.auto_fixable)
                    && suggested_replacement.is_some(),
                suggested_replacement,
                requires_manual_review,
            });
        }
        matches
    }
}

/// Whether `m` still describes `content`: the recorded line exists and still
/// contains the first line of the matched text.
pub fn match_still_present(content: &str, m: &PatternMatch) -> bool {
    let index = LineIndex::new(content);
    if m.line == 0 || m.line > index.line_count() {
        return false;
    }
    let needle = m.matched_text.lines().next().unwrap_or_default();
    index.line_text(content, m.line - 1).contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use waypoint_types::PatternFlags;

    fn rule(name: &str, pattern: &str, auto_fixable: bool) -> ClassifierRule {
        ClassifierRule {
            name: name.into(),
            pattern: pattern.into(),
            suggested_action: Some(format!("handle {name}")),
            auto_fixable,
        }
    }

    fn message_pattern() -> PatternDefinition {
        let mut transformations = BTreeMap::new();
        transformations.insert("literal".to_string(), "${fn}(NewLbl)".to_string());
        transformations.insert("text_constant".to_string(), "${fn}(${arg})".to_string());
        PatternDefinition {
            id: "message-call".into(),
            description: "Message/Error calls".into(),
            regex: r"\b(?P<fn>Message|Error)\((?P<arg>[^)]*)\)".into(),
            flags: PatternFlags::default(),
            exclude: Some(r"^\s*//".into()),
            context_lines: 1,
            classifiers: vec![
                rule("literal", r"\(\s*'", true),
                rule("text_constant", r"\(\s*\w+(Txt|Msg|Err|Lbl)\b", false),
            ],
            transformations,
        }
    }

    #[test]
    fn compile_rejects_bad_regex() {
        let mut def = message_pattern();
        def.regex = "(unclosed".into();
        let err = CompiledPattern::compile(&def).err().unwrap();
        assert!(matches!(err, WaypointError::InvalidPattern { .. }));
    }

    #[test]
    fn compile_rejects_bad_classifier() {
        let mut def = message_pattern();
        def.classifiers.push(rule("broken", "[", false));
        let err = CompiledPattern::compile(&def).err().unwrap();
        assert!(err.to_string().contains("classifier 'broken'"));
    }

    #[test]
    fn classifies_first_matching_rule() {
        let compiled = CompiledPattern::compile(&message_pattern()).unwrap();
        let source = "begin\n    Message('Hello');\n    Error(NotFoundErr);\n    Message(Format(x));\nend";
        let matches = compiled.find_matches("a.al", source);

        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].instance_type, "literal");
        assert_eq!(matches[0].line, 2);
        assert_eq!(matches[0].column, 5);
        assert_eq!(matches[0].suggested_replacement.as_deref(), Some("Message(NewLbl)"));
        assert!(matches[0].auto_fixable);
        assert!(!matches[0].requires_manual_review);

        assert_eq!(matches[1].instance_type, "text_constant");
        assert_eq!(matches[1].suggested_replacement.as_deref(), Some("Error(NotFoundErr)"));
        assert!(!matches[1].auto_fixable);

        assert_eq!(matches[2].instance_type, "other");
        assert!(matches[2].requires_manual_review);
        assert!(matches[2].suggested_replacement.is_none());
    }

    #[test]
    fn declared_order_wins_over_later_rules() {
        let mut def = message_pattern();
        def.classifiers.insert(0, rule("anything", ".", false));
        let compiled = CompiledPattern::compile(&def).unwrap();
        let matches = compiled.find_matches("a.al", "Message('x');");
        assert_eq!(matches[0].instance_type, "anything");
        // no template for "anything"
        assert!(matches[0].requires_manual_review);
    }

    #[test]
    fn excluded_lines_are_dropped() {
        let compiled = CompiledPattern::compile(&message_pattern()).unwrap();
        let matches = compiled.find_matches("a.al", "// Message('old');\nMessage('new');");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].line, 2);
    }

    #[test]
    fn context_window_is_captured() {
        let compiled = CompiledPattern::compile(&message_pattern()).unwrap();
        let matches = compiled.find_matches("a.al", "one\ntwo\nMessage('x');\nfour\nfive");
        assert_eq!(matches[0].context, vec!["two", "Message('x');", "four"]);
    }

    #[test]
    fn repeated_scans_are_identical() {
        let compiled = CompiledPattern::compile(&message_pattern()).unwrap();
        let source = "Message('a');\nError(AErr);\nMessage(b);";
        let first = compiled.find_matches("a.al", source);
        for _ in 0..5 {
            assert_eq!(compiled.find_matches("a.al", source), first);
        }
    }

    #[test]
    fn case_insensitive_flag_applies() {
        let mut def = message_pattern();
        def.flags.case_insensitive = true;
        let compiled = CompiledPattern::compile(&def).unwrap();
        assert_eq!(compiled.find_matches("a.al", "MESSAGE('x');").len(), 1);
    }

    #[test]
    fn match_presence_check() {
        let compiled = CompiledPattern::compile(&message_pattern()).unwrap();
        let source = "x;\nMessage('a');";
        let m = compiled.find_matches("a.al", source).remove(0);
        assert!(match_still_present(source, &m));
        assert!(!match_still_present("x;\nMessage(ALbl);", &m));
        assert!(!match_still_present("x;", &m));
    }
}

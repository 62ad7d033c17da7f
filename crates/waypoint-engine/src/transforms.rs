//! Variable expansion for definition text.
//!
//! Phase instructions and checklist descriptions may reference session options
//! as `${option}`; they are expanded once, when a session is instantiated.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::{Captures, Regex};

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}\s]+)\}").expect("variable pattern is valid"));

/// Build the substitution table for a session: every scalar option plus
/// `workflow_type` and `scope_root`.
pub fn session_variables(
    workflow_type: &str,
    scope_root: &str,
    options: &BTreeMap<String, serde_json::Value>,
) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = options
        .iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k.clone(), s.clone())),
            serde_json::Value::Number(n) => Some((k.clone(), n.to_string())),
            serde_json::Value::Bool(b) => Some((k.clone(), b.to_string())),
            _ => None,
        })
        .collect();
    vars.insert("workflow_type".into(), workflow_type.to_string());
    vars.insert("scope_root".into(), scope_root.to_string());
    vars
}

/// Expand `${variable}` patterns in a string.
///
/// Replaces each occurrence of `${key}` with the corresponding value from `vars`
/// in a single left-to-right pass; substituted values are not expanded again.
/// Variables that do not appear in `vars` are left as-is.
pub fn expand_variables(template: &str, vars: &HashMap<String, String>) -> String {
    VARIABLE
        .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

//! Definition registry: built-in workflow templates plus a runtime override
//! layer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use waypoint_patterns::PatternSet;
use waypoint_types::{Result, WaypointError};

use crate::definition::WorkflowDefinition;
use crate::validation::{validate_or_raise, Diagnostic};

const BUILTIN_DEFINITIONS: &[&str] = &[
    include_str!("../definitions/code-review.json"),
    include_str!("../definitions/security-audit.json"),
    include_str!("../definitions/version-migration.json"),
];

// ---------------------------------------------------------------------------
// RegisteredWorkflow
// ---------------------------------------------------------------------------

/// A validated definition with its patterns compiled once.
pub struct RegisteredWorkflow {
    pub definition: WorkflowDefinition,
    pub patterns: PatternSet,
    pub builtin: bool,
    /// Warnings raised when the definition was registered.
    pub diagnostics: Vec<Diagnostic>,
}

impl RegisteredWorkflow {
    fn build(definition: WorkflowDefinition, builtin: bool) -> Result<Self> {
        let diagnostics = validate_or_raise(&definition)?;
        let patterns = PatternSet::compile_strict(&definition.patterns)?;
        Ok(Self {
            definition,
            patterns,
            builtin,
            diagnostics,
        })
    }
}

/// Where a listed workflow comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionSource {
    Builtin,
    /// A registered definition shadowing a built-in of the same type.
    Override,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_type: String,
    pub name: String,
    pub description: String,
    pub source: DefinitionSource,
    pub phases: Vec<String>,
    pub patterns: usize,
    pub required_options: Vec<String>,
}

// ---------------------------------------------------------------------------
// DefinitionRegistry
// ---------------------------------------------------------------------------

/// Workflow definitions by type. Lookups consult the override map first,
/// then the built-ins.
pub struct DefinitionRegistry {
    builtins: HashMap<String, Arc<RegisteredWorkflow>>,
    overrides: HashMap<String, Arc<RegisteredWorkflow>>,
}

impl DefinitionRegistry {
    /// An empty registry with no built-ins.
    pub fn new() -> Self {
        Self {
            builtins: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// A registry holding the embedded built-in definitions.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        for source in BUILTIN_DEFINITIONS {
            let definition: WorkflowDefinition = serde_json::from_str(source)?;
            let t = definition.workflow_type.clone();
            registry
                .builtins
                .insert(t, Arc::new(RegisteredWorkflow::build(definition, true)?));
        }
        Ok(registry)
    }

    /// Validate and register a definition.
    ///
    /// Registering a type that is built in fails with `DefinitionConflict`
    /// unless `allow_override_builtin` is set. Re-registering a custom type
    /// replaces it.
    pub fn register(
        &mut self,
        definition: WorkflowDefinition,
        allow_override_builtin: bool,
    ) -> Result<Vec<Diagnostic>> {
        let t = definition.workflow_type.clone();
        if self.builtins.contains_key(&t) && !allow_override_builtin {
            return Err(WaypointError::DefinitionConflict { workflow_type: t });
        }
        let registered = RegisteredWorkflow::build(definition, false)?;
        tracing::info!(
            workflow = %t,
            patterns = registered.patterns.len(),
            overrides_builtin = self.builtins.contains_key(&t),
            "Workflow definition registered"
        );
        let warnings = registered.diagnostics.clone();
        self.overrides.insert(t, Arc::new(registered));
        Ok(warnings)
    }

    pub fn get(&self, workflow_type: &str) -> Result<Arc<RegisteredWorkflow>> {
        self.overrides
            .get(workflow_type)
            .or_else(|| self.builtins.get(workflow_type))
            .cloned()
            .ok_or_else(|| WaypointError::UnknownWorkflowType {
                workflow_type: workflow_type.to_string(),
            })
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.overrides.contains_key(workflow_type) || self.builtins.contains_key(workflow_type)
    }

    /// Every resolvable workflow type, sorted by type.
    pub fn list_available(&self) -> Vec<WorkflowSummary> {
        let mut types: Vec<&String> = self.builtins.keys().chain(self.overrides.keys()).collect();
        types.sort();
        types.dedup();

        types
            .into_iter()
            .filter_map(|t| {
                let source = match (self.overrides.contains_key(t), self.builtins.contains_key(t)) {
                    (true, true) => DefinitionSource::Override,
                    (true, false) => DefinitionSource::Custom,
                    _ => DefinitionSource::Builtin,
                };
                let registered = self.get(t).ok()?;
                let def = &registered.definition;
                Some(WorkflowSummary {
                    workflow_type: def.workflow_type.clone(),
                    name: def.name.clone(),
                    description: def.description.clone(),
                    source,
                    phases: def.phases.iter().map(|p| p.id.clone()).collect(),
                    patterns: registered.patterns.len(),
                    required_options: def.required_options.clone(),
                })
            })
            .collect()
    }

    /// Remove a registered definition. Removing an override makes the
    /// built-in visible again; built-ins themselves cannot be removed.
    pub fn unregister(&mut self, workflow_type: &str) -> Result<()> {
        if self.overrides.remove(workflow_type).is_some() {
            tracing::info!(workflow = %workflow_type, "Workflow definition unregistered");
            return Ok(());
        }
        if self.builtins.contains_key(workflow_type) {
            return Err(WaypointError::CannotUnregisterBuiltin {
                workflow_type: workflow_type.to_string(),
            });
        }
        Err(WaypointError::UnknownWorkflowType {
            workflow_type: workflow_type.to_string(),
        })
    }

    /// Register every definition in a JSON file (one object or an array) with
    /// permission to override built-ins. Returns how many were registered.
    pub fn load_overrides(&mut self, path: &Path) -> Result<usize> {
        let json = std::fs::read_to_string(path)?;
        let definitions = parse_definitions(&json)?;
        let count = definitions.len();
        for definition in definitions {
            self.register(definition, true)?;
        }
        tracing::info!(path = %path.display(), count, "Loaded workflow overrides");
        Ok(count)
    }
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one definition or an array of definitions.
pub fn parse_definitions(json: &str) -> Result<Vec<WorkflowDefinition>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    if value.is_array() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Workflow definition parsing, validation, and file loading.
//!
//! Converts between YAML and `WorkflowDefinition` and checks the structural
//! constraints the engine relies on: unique step ids, a resolvable start step
//! and transition targets, and sane timeouts and retry ceilings.

use std::collections::HashSet;
use std::path::Path;

use flowline_types::workflow::WorkflowDefinition;
use thiserror::Error;

/// Highest `max_retries` a step may declare.
pub const MAX_STEP_RETRIES: u32 = 10;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A transition points at a step that does not exist.
    #[error("step '{step}' transitions to unknown step '{target}'")]
    UnknownTarget { step: String, target: String },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Id is non-empty
/// - At least one step exists, and step ids are unique
/// - `start_step_id` names an existing step
/// - Every transition target names an existing step
/// - Step and global timeouts are > 0 if set
/// - Step retry `max_retries` is at most [`MAX_STEP_RETRIES`]
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.id.trim().is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "workflow '{}' must have at least one step",
            def.id
        )));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(DefinitionError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    if !seen_ids.contains(def.start_step_id.as_str()) {
        return Err(DefinitionError::ValidationError(format!(
            "start step '{}' does not exist",
            def.start_step_id
        )));
    }

    for step in &def.steps {
        for transition in &step.transitions {
            if !seen_ids.contains(transition.target.as_str()) {
                return Err(DefinitionError::UnknownTarget {
                    step: step.id.clone(),
                    target: transition.target.clone(),
                });
            }
        }

        if step.timeout_ms == Some(0) {
            return Err(DefinitionError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }

        if let Some(retry) = &step.retry {
            if retry.max_retries > MAX_STEP_RETRIES {
                return Err(DefinitionError::ValidationError(format!(
                    "step '{}' max_retries {} exceeds {MAX_STEP_RETRIES}",
                    step.id, retry.max_retries
                )));
            }
        }
    }

    if def.global_timeout_ms == Some(0) {
        return Err(DefinitionError::ValidationError(
            "global timeout must be > 0".to_string(),
        ));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load and validate a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file, creating parent directories.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

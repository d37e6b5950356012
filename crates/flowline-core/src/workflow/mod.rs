//! Workflow execution: definitions, data flow, the engine and the runner.
//!
//! - `definition` -- YAML load/save and structural validation
//! - `context` -- input/output mapping between steps
//! - `expression` -- JEXL evaluator for transition and trigger conditions
//! - `engine` -- per-instance step loop with retry, recovery and approvals
//! - `runner` -- capacity parking and event-triggered starts on top of the engine

pub mod context;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod runner;

pub use definition::{
    DefinitionError, load_workflow_file, parse_workflow_yaml, save_workflow_file,
    serialize_workflow_yaml, validate_definition,
};
pub use engine::{EngineError, InstanceFilter, StartOptions, WorkflowEngine};
pub use expression::{ExpressionError, WorkflowEvaluator};
pub use runner::{PendingRequest, RunOutcome, RunnerError, WorkflowRunner};

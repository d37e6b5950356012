//! Workflow subcommands: `validate` and `run`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowline_core::workflow::{StartOptions, WorkflowEngine, load_workflow_file};
use flowline_types::event::EventKind;
use flowline_types::workflow::{StepStatus, WorkflowInstance, WorkflowStatus};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("Invalid workflow file '{}'", file.display()))?;

    if json {
        let out = serde_json::json!({
            "valid": true,
            "id": def.id,
            "name": def.name,
            "version": def.version,
            "steps": def.steps.len(),
            "start_step_id": def.start_step_id,
            "triggers": def.triggers.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' v{} is valid",
        style("*").green().bold(),
        style(&def.name).cyan(),
        def.version
    );
    println!("  ID: {}", def.id);
    println!("  Start step: {}", def.start_step_id);
    println!("  Error strategy: {:?}", def.error_strategy);

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Step", "Agent", "Required", "Approval", "Transitions"]);
    for step in &def.steps {
        let transitions: Vec<String> = step
            .transitions
            .iter()
            .map(|t| match &t.condition {
                Some(condition) => format!("{} if {condition}", t.target),
                None => t.target.clone(),
            })
            .collect();
        table.add_row(vec![
            Cell::new(&step.id),
            Cell::new(&step.agent_id),
            Cell::new(if step.required { "yes" } else { "no" }),
            Cell::new(if step.requires_approval { "yes" } else { "" }),
            Cell::new(transitions.join(", ")),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    file: &Path,
    input: &str,
    approve: bool,
    print_events: bool,
    json: bool,
) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("Invalid workflow file '{}'", file.display()))?;
    let input: Value = serde_json::from_str(input).context("--input is not valid JSON")?;
    let workflow_id = def.id.clone();
    state
        .engine
        .register_workflow(def)
        .context("Failed to register workflow")?;

    let watcher = spawn_event_watcher(state.engine.clone(), approve, print_events && !json);
    let result = state
        .engine
        .start_workflow(&workflow_id, input, StartOptions::sync())
        .await;
    watcher.abort();
    let instance = result.with_context(|| format!("Failed to start workflow '{workflow_id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
    } else {
        print_instance(&instance);
    }

    if instance.status != WorkflowStatus::Completed {
        bail!("workflow '{}' ended as {}", workflow_id, instance.status);
    }
    Ok(())
}

/// Answer approval requests and optionally echo engine events.
fn spawn_event_watcher(engine: WorkflowEngine, approve: bool, print: bool) -> JoinHandle<()> {
    let mut events = engine.event_bus().subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event watcher lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if print {
                println!(
                    "  {} {}",
                    style(event.kind.as_str()).dim(),
                    event.step_id.as_deref().unwrap_or("")
                );
            }
            if event.kind != EventKind::ApprovalRequested {
                continue;
            }
            let (Some(instance_id), Some(step_id)) = (event.instance_id, event.step_id.as_deref())
            else {
                continue;
            };
            if !approve {
                eprintln!(
                    "  {} Step '{}' requires approval; rejecting (pass --approve to accept)",
                    style("!").yellow().bold(),
                    step_id
                );
            }
            engine.approve(instance_id, step_id, approve);
        }
    })
}

fn print_instance(instance: &WorkflowInstance) {
    let status = match instance.status {
        WorkflowStatus::Completed => style(instance.status.to_string()).green(),
        WorkflowStatus::Failed | WorkflowStatus::Cancelled => style(instance.status.to_string()).red(),
        _ => style(instance.status.to_string()).yellow(),
    };
    println!();
    println!(
        "  {} Workflow '{}' v{}: {}",
        style("*").bold(),
        style(&instance.workflow_id).cyan(),
        instance.workflow_version,
        status
    );
    println!("  Instance: {}", instance.instance_id);

    let mut steps: Vec<_> = instance.step_results.values().collect();
    steps.sort_by_key(|r| r.started_at);

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Step", "Status", "Retries", "Time (ms)", "Error"]);
    for result in steps {
        let color = match result.status {
            StepStatus::Completed => Color::Green,
            StepStatus::Failed => Color::Red,
            _ => Color::Yellow,
        };
        table.add_row(vec![
            Cell::new(&result.step_id),
            Cell::new(format!("{:?}", result.status).to_lowercase()).fg(color),
            Cell::new(result.retry_count),
            Cell::new(result.execution_time_ms),
            Cell::new(
                result
                    .error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_default(),
            ),
        ]);
    }
    println!("{table}");

    if let Some(error) = &instance.error {
        println!("  {} {}: {}", style("Error").red().bold(), error.code, error.message);
    }
    if !instance.context.variables.is_empty() {
        println!("  Variables:");
        let mut variables: Vec<_> = instance.context.variables.iter().collect();
        variables.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in variables {
            println!("    {name} = {value}");
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::config::FlowlineConfig;
    use serde_json::json;
    use std::path::PathBuf;

    fn demo_order() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/order.yaml")
    }

    async fn run_demo(total: u32, approve: bool) -> WorkflowInstance {
        let state = AppState::init(FlowlineConfig::default());
        let def = load_workflow_file(&demo_order()).unwrap();
        let id = def.id.clone();
        state.engine.register_workflow(def).unwrap();

        let watcher = spawn_event_watcher(state.engine.clone(), approve, false);
        let instance = state
            .engine
            .start_workflow(&id, json!({ "order_id": 7, "total": total }), StartOptions::sync())
            .await
            .unwrap();
        watcher.abort();
        instance
    }

    #[test]
    fn test_demo_workflow_validates() {
        handle_validate(&demo_order(), true).unwrap();
        assert!(handle_validate(Path::new("/nonexistent/workflow.yaml"), true).is_err());
    }

    #[tokio::test]
    async fn test_small_order_skips_review_and_optional_notify() {
        let instance = run_demo(40, false).await;
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert!(!instance.step_results.contains_key("review"));
        assert_eq!(instance.step_results["notify"].status, StepStatus::Skipped);
        assert_eq!(instance.context.variables["total"], json!(40));
    }

    #[tokio::test]
    async fn test_large_order_goes_through_review() {
        let approved = run_demo(250, true).await;
        assert_eq!(approved.status, WorkflowStatus::Completed);
        assert_eq!(approved.step_results["review"].status, StepStatus::Completed);

        let rejected = run_demo(250, false).await;
        assert_eq!(rejected.status, WorkflowStatus::Failed);
        assert!(!rejected.step_results.contains_key("charge"));
    }
}

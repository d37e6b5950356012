//! Scheduling subcommands: `next-runs` preview and the `schedule` daemon.
//!
//! A jobs file lists the workflow definitions the jobs may target (paths
//! relative to the jobs file) and the job definitions themselves:
//!
//! ```yaml
//! workflows:
//!   - nightly-report.yaml
//! jobs:
//!   - id: heartbeat
//!     name: Heartbeat
//!     cron_expr: every 5 minutes
//!     target: { type: agent, agent_id: echo }
//!   - id: nightly
//!     name: Nightly report
//!     cron_expr: every day at 02:30
//!     timezone: "+01:00"
//!     target: { type: workflow, workflow_id: nightly-report }
//!     conditions: [{ type: business_days_only }]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowline_core::event::EventFilter;
use flowline_core::scheduler::{CronScheduler, parse_timezone};
use flowline_core::workflow::load_workflow_file;
use flowline_types::event::EventKind;
use flowline_types::job::{JobDefinition, JobInstance, JobStatus};
use serde::Deserialize;

use crate::state::AppState;

/// Contents of a jobs YAML file.
#[derive(Debug, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub workflows: Vec<PathBuf>,
    pub jobs: Vec<JobDefinition>,
}

/// Parse a jobs file, resolving workflow paths against its directory.
pub fn load_jobs_file(path: &Path) -> Result<JobsFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read jobs file '{}'", path.display()))?;
    let mut file: JobsFile = serde_yaml_ng::from_str(&raw)
        .with_context(|| format!("Failed to parse jobs file '{}'", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for workflow in &mut file.workflows {
        if workflow.is_relative() {
            *workflow = base.join(&*workflow);
        }
    }
    Ok(file)
}

// ---------------------------------------------------------------------------
// next-runs
// ---------------------------------------------------------------------------

pub fn handle_next_runs(expr: &str, timezone: &str, count: usize, json: bool) -> Result<()> {
    let runs = CronScheduler::next_runs(expr, timezone, count)
        .with_context(|| format!("Cannot preview '{expr}'"))?;
    let offset = parse_timezone(timezone)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#".to_string(), "UTC".to_string(), format!("Local ({offset})")]);
    for (i, run) in runs.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(run.format("%Y-%m-%d %H:%M")),
            Cell::new(run.with_timezone(&offset).format("%Y-%m-%d %H:%M %a")),
        ]);
    }
    println!();
    println!("  Next runs of '{}'", style(expr).cyan());
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// schedule daemon
// ---------------------------------------------------------------------------

pub async fn handle_schedule(state: &AppState, file: &Path, once: bool, json: bool) -> Result<()> {
    let jobs = load_jobs_file(file)?;

    for path in &jobs.workflows {
        let def = load_workflow_file(path)
            .with_context(|| format!("Invalid workflow file '{}'", path.display()))?;
        state.runner.register_triggers(&def)?;
        state.engine.register_workflow(def)?;
    }
    for def in jobs.jobs {
        let id = def.id.clone();
        state
            .scheduler
            .register_job(def)
            .with_context(|| format!("Failed to register job '{id}'"))?;
    }

    if !json {
        print_schedules(&state.scheduler);
    }

    if once {
        for def in state.scheduler.list_jobs().into_iter().filter(|d| d.enabled) {
            let instance = state
                .scheduler
                .run_now(&def.id, None)
                .await
                .with_context(|| format!("Failed to run job '{}'", def.id))?;
            tracing::info!(job_id = %def.id, status = ?instance.status, "job ran once");
        }
        print_history(&state.scheduler.history(None), json)?;
        return Ok(());
    }

    let listener = state.runner.spawn_event_listener();
    let reporter = spawn_job_reporter(state, json);
    state.scheduler.start().context("Failed to start the scheduler")?;
    if !json {
        println!("  {}", style("Scheduler running. Press Ctrl+C to stop").dim());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    state.scheduler.stop();
    reporter.abort();
    listener.abort();
    print_history(&state.scheduler.history(None), json)?;
    Ok(())
}

/// Print job lifecycle events as they happen.
fn spawn_job_reporter(state: &AppState, json: bool) -> tokio::task::JoinHandle<()> {
    let mut events = state.event_bus.subscribe_filtered(EventFilter::kinds([
        EventKind::JobStarted,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::JobRetrying,
    ]));
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if json {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
                continue;
            }
            let kind = match event.kind {
                EventKind::JobCompleted => style(event.kind.as_str()).green(),
                EventKind::JobFailed => style(event.kind.as_str()).red(),
                _ => style(event.kind.as_str()).dim(),
            };
            println!(
                "  {} {} {}",
                event.timestamp.format("%H:%M:%S"),
                kind,
                event.job_id.as_deref().unwrap_or("")
            );
        }
    })
}

fn print_schedules(scheduler: &CronScheduler) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Job", "Cron", "Enabled", "Next run (UTC)"]);
    for schedule in scheduler.list_schedules() {
        table.add_row(vec![
            Cell::new(&schedule.job_id),
            Cell::new(&schedule.cron_expr),
            Cell::new(if schedule.enabled { "yes" } else { "no" }),
            Cell::new(
                schedule
                    .next_run
                    .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }
    println!();
    println!("{table}");
}

fn print_history(history: &[JobInstance], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(history)?);
        return Ok(());
    }
    if history.is_empty() {
        println!("  No jobs ran.");
        return Ok(());
    }
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Job", "Instance", "Status", "Retries", "Error"]);
    for instance in history {
        let color = match instance.status {
            JobStatus::Completed => Color::Green,
            JobStatus::Failed => Color::Red,
            _ => Color::Yellow,
        };
        table.add_row(vec![
            Cell::new(&instance.job_id),
            Cell::new(instance.instance_id),
            Cell::new(format!("{:?}", instance.status).to_lowercase()).fg(color),
            Cell::new(instance.retry_count),
            Cell::new(
                instance
                    .error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_default(),
            ),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::job::{JobCondition, JobTarget};

    #[test]
    fn test_load_jobs_file_resolves_workflow_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.yaml");
        std::fs::write(
            &path,
            r#"
workflows:
  - nightly.yaml
jobs:
  - id: heartbeat
    name: Heartbeat
    cron_expr: every 5 minutes
    target: { type: agent, agent_id: echo }
  - id: nightly
    name: Nightly
    cron_expr: "30 2 * * *"
    timezone: "+01:00"
    target: { type: workflow, workflow_id: nightly-report }
    conditions: [{ type: business_days_only }]
"#,
        )
        .unwrap();

        let file = load_jobs_file(&path).unwrap();
        assert_eq!(file.workflows, vec![dir.path().join("nightly.yaml")]);
        assert_eq!(file.jobs.len(), 2);
        assert_eq!(file.jobs[0].timezone, "UTC");
        assert_eq!(file.jobs[0].priority, 5);
        assert_eq!(
            file.jobs[1].target,
            JobTarget::Workflow {
                workflow_id: "nightly-report".to_string()
            }
        );
        assert_eq!(file.jobs[1].conditions, vec![JobCondition::BusinessDaysOnly]);
    }

    #[test]
    fn test_load_jobs_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.yaml");
        std::fs::write(&path, "jobs: [{ id: broken }]").unwrap();
        assert!(load_jobs_file(&path).is_err());
        assert!(load_jobs_file(&dir.path().join("missing.yaml")).is_err());
    }
}

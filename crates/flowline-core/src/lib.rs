//! Workflow orchestration core for Flowline.
//!
//! Agents are the unit of work. Workflows chain them through guarded state
//! machines with per-step retry and error recovery; the cron scheduler and the
//! job queue run agents and workflows on a timetable with bounded concurrency.
//! Every lifecycle change is broadcast on the shared `EventBus`.

pub mod agent;
pub mod event;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod workflow;

//! Application state wiring the engine, runner and scheduler together.

use std::sync::Arc;

use flowline_core::agent::AgentRegistry;
use flowline_core::event::EventBus;
use flowline_core::scheduler::CronScheduler;
use flowline_core::workflow::{WorkflowEngine, WorkflowRunner};
use flowline_types::config::FlowlineConfig;

use crate::agents::demo_registry;

/// Shared handles used by the command handlers. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: FlowlineConfig,
    pub event_bus: EventBus,
    pub engine: WorkflowEngine,
    pub runner: WorkflowRunner,
    pub scheduler: CronScheduler,
}

impl AppState {
    /// Build every component from `config`, backed by the demo agents.
    pub fn init(config: FlowlineConfig) -> Self {
        let registry: Arc<dyn AgentRegistry> = demo_registry();
        let event_bus = EventBus::new(config.events.capacity);
        let engine = WorkflowEngine::new(config.engine.clone(), Arc::clone(&registry), event_bus.clone());
        let runner = WorkflowRunner::new(engine.clone());
        let scheduler = CronScheduler::new(
            config.scheduler.clone(),
            registry,
            event_bus.clone(),
            Some(engine.clone()),
        );
        scheduler.set_default_retry(config.retry.clone());

        Self {
            config,
            event_bus,
            engine,
            runner,
            scheduler,
        }
    }
}

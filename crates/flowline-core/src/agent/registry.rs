//! Agent registry for runtime agent lookup.

use std::sync::Arc;

use dashmap::DashMap;

use super::box_agent::BoxAgent;
use super::Agent;

/// Lookup of agents by id.
pub trait AgentRegistry: Send + Sync {
    fn get_agent(&self, id: &str) -> Option<Arc<BoxAgent>>;
}

/// Concurrent in-memory registry.
#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: DashMap<String, Arc<BoxAgent>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own id, replacing any previous entry.
    pub fn register<T: Agent + 'static>(&self, agent: T) {
        let boxed = BoxAgent::new(agent);
        self.agents.insert(boxed.id().to_string(), Arc::new(boxed));
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.agents.remove(id).is_some()
    }

    /// Registered ids, sorted.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl AgentRegistry for InMemoryAgentRegistry {
    fn get_agent(&self, id: &str) -> Option<Arc<BoxAgent>> {
        self.agents.get(id).map(|e| Arc::clone(e.value()))
    }
}

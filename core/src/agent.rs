use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use pilot_protocol::Action;

use crate::error::CoreErr;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::state::State;

/// What the core needs from an agent implementation. Everything else — the
/// LLM client, prompt construction, sandbox plugins — stays on the other
/// side of this trait.
///
/// `step` must be deterministic with respect to the state snapshot it
/// receives. Returning [`CoreErr::MalformedAction`], [`CoreErr::NoAction`]
/// or [`CoreErr::Response`] reports the failure back to the agent on its
/// next step; any other error ends the task.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn step(&self, state: &State) -> Result<Action>;

    /// Drop per-task internal state. Called when the controller reaches a
    /// terminal state.
    fn reset(&self) {}

    fn name(&self) -> &str;

    /// Handle to the cost accumulator the agent's LLM reports into.
    fn metrics(&self) -> Metrics;
}

/// Builds an agent wired to the given shared cost accumulator.
pub type AgentFactory = Box<dyn Fn(Metrics) -> Arc<dyn Agent> + Send + Sync>;

/// Name → factory lookup used to resolve `delegate` actions. Passed
/// explicitly into controllers; there is no global registry.
#[derive(Default)]
pub struct AgentRegistry {
    factories: Mutex<HashMap<String, AgentFactory>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn factories(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentFactory>> {
        match self.factories.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, name: impl Into<String>, factory: AgentFactory) -> Result<()> {
        let name = name.into();
        let mut factories = self.factories();
        if factories.contains_key(&name) {
            return Err(CoreErr::Internal(format!(
                "agent already registered under '{name}'"
            )));
        }
        factories.insert(name, factory);
        Ok(())
    }

    /// Instantiate the agent registered under `name`, wiring it to
    /// `metrics` so its spend lands in the caller's budget.
    pub fn create(&self, name: &str, metrics: Metrics) -> Result<Arc<dyn Agent>> {
        let factories = self.factories();
        let factory = factories
            .get(name)
            .ok_or_else(|| CoreErr::UnknownAgent(name.to_string()))?;
        Ok(factory(metrics))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAgent {
        metrics: Metrics,
    }

    #[async_trait]
    impl Agent for NullAgent {
        async fn step(&self, _state: &State) -> Result<Action> {
            Ok(Action::Null(pilot_protocol::NullArgs {}))
        }

        fn name(&self) -> &str {
            "Null"
        }

        fn metrics(&self) -> Metrics {
            self.metrics.clone()
        }
    }

    #[test]
    fn resolves_registered_agents() {
        let registry = AgentRegistry::new();
        registry
            .register("Null", Box::new(|metrics| Arc::new(NullAgent { metrics })))
            .unwrap();

        let shared = Metrics::new();
        let agent = registry.create("Null", shared.clone()).unwrap();
        assert_eq!(agent.name(), "Null");
        assert!(agent.metrics().shares_with(&shared));
        assert_eq!(registry.names(), vec!["Null".to_string()]);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = AgentRegistry::new();
        registry
            .register("Null", Box::new(|metrics| Arc::new(NullAgent { metrics })))
            .unwrap();
        assert!(registry
            .register("Null", Box::new(|metrics| Arc::new(NullAgent { metrics })))
            .is_err());
    }

    #[test]
    fn unknown_agent_fails() {
        let registry = AgentRegistry::new();
        assert!(matches!(
            registry.create("Ghost", Metrics::new()),
            Err(CoreErr::UnknownAgent(_))
        ));
    }
}

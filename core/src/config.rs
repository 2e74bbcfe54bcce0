use uuid::Uuid;

/// Default iteration cap for a task.
pub const DEFAULT_MAX_ITERATIONS: i64 = 100;

/// Knobs the core cares about, passed explicitly into every controller. No
/// process-wide configuration singletons.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Session id; unique per active stream.
    pub sid: String,

    /// Maximum number of iterations before traffic control pauses the task.
    pub max_iterations: i64,

    /// Maximum spend (in USD) per task; `None` means unlimited.
    pub max_budget_per_task: Option<f64>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sid: Uuid::new_v4().to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_budget_per_task: None,
        }
    }
}

impl CoreConfig {
    pub fn with_sid(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            ..Self::default()
        }
    }
}

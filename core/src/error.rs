use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreErr>;

/// Every failure the core can surface. The recoverable/terminal split of the
/// dispatch table lives in [`CoreErr::is_recoverable`], not in the variants
/// themselves: recoverable errors are fed back to the agent as an `error`
/// observation so it can self-correct, everything else ends the task.
#[derive(Error, Debug)]
pub enum CoreErr {
    /// The agent produced an action the core cannot interpret.
    #[error("malformed action: {0}")]
    MalformedAction(String),

    /// The agent's step returned without an action.
    #[error("agent must return an action")]
    NoAction,

    /// The LLM response behind the agent's step was unusable.
    #[error("error in LLM response: {0}")]
    Response(String),

    /// An iteration or cost cap was hit.
    #[error("{0}")]
    Budget(String),

    #[error("agent got stuck in a loop")]
    Stuck,

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A task-tree operation named an unrecognized state.
    #[error("invalid task state: {0}")]
    TaskState(String),

    /// A read addressed a path the file store does not have.
    #[error("path not found: {0}")]
    NotFound(String),

    /// No agent registered under the requested name.
    #[error("no agent registered under '{0}'")]
    UnknownAgent(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("persistence failed: {0}")]
    Persist(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreErr {
    /// Whether the step loop should continue after reporting this error to
    /// the agent.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreErr::MalformedAction(_) | CoreErr::NoAction | CoreErr::Response(_)
        )
    }
}

impl From<pilot_protocol::MalformedEventError> for CoreErr {
    fn from(e: pilot_protocol::MalformedEventError) -> Self {
        CoreErr::MalformedEvent(e.0)
    }
}

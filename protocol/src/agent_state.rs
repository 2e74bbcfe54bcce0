use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Lifecycle state of one agent controller.
///
/// `LOADING → INIT → RUNNING ⇄ PAUSED → AWAITING_USER_INPUT → RUNNING → …`
/// terminating in one of `FINISHED`, `REJECTED`, `ERROR` or `STOPPED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentState {
    /// The controller exists but has not adopted a state yet (fresh
    /// construction or a session restore in flight).
    Loading,

    /// The controller is initialized and waiting to be started. Entering
    /// `Init` consumes a saved `resume_state`, if any.
    Init,

    /// The step loop is actively invoking the agent.
    Running,

    /// Paused by the user or by traffic control.
    Paused,

    /// The agent asked the user a question and is waiting for the reply.
    AwaitingUserInput,

    /// The agent declared the task done.
    Finished,

    /// The agent declined the task.
    Rejected,

    /// The controller hit a terminal error (stuck loop, unexpected failure).
    Error,

    /// The controller was closed.
    Stopped,
}

impl AgentState {
    /// States a restored session may jump back into via `resume_state`.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            AgentState::Running
                | AgentState::Paused
                | AgentState::AwaitingUserInput
                | AgentState::Finished
        )
    }

    /// Terminal states reset the agent when entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Stopped | AgentState::Error)
    }
}

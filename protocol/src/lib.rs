//! Wire types for a pilot session.
//!
//! Everything that crosses the event stream — actions emitted by an agent or
//! a user, observations emitted by the environment — is defined here, along
//! with the JSON codec that external consumers (UIs, evaluators, sandbox
//! adapters) rely on. The `core` crate owns the machinery; this crate owns
//! the shapes.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod action;
mod agent_state;
mod event;
mod observation;

pub use action::Action;
pub use action::AddTaskArgs;
pub use action::BrowseInteractiveArgs;
pub use action::ChangeAgentStateArgs;
pub use action::CmdRunArgs;
pub use action::DelegateArgs;
pub use action::FileReadArgs;
pub use action::FileWriteArgs;
pub use action::FinishArgs;
pub use action::IPythonRunCellArgs;
pub use action::MessageArgs;
pub use action::ModifyTaskArgs;
pub use action::NullArgs;
pub use action::RejectArgs;
pub use action::SummarizeArgs;
pub use action::TaskItem;
pub use agent_state::AgentState;
pub use event::Event;
pub use event::EventPayload;
pub use event::EventSource;
pub use event::MalformedEventError;
pub use event::UNASSIGNED_EVENT_ID;
pub use observation::AgentStateChangedArgs;
pub use observation::BrowserOutputArgs;
pub use observation::CmdOutputArgs;
pub use observation::DelegateResultArgs;
pub use observation::ErrorArgs;
pub use observation::FileReadResultArgs;
pub use observation::FileWriteResultArgs;
pub use observation::IPythonOutputArgs;
pub use observation::Observation;

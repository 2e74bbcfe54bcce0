//! Root of the `pilot-core` library: the execution core that drives LLM
//! agents through a sense-plan-act loop against a sandboxed environment.
//!
//! The crate owns the session event stream, the controller state machine
//! with its budgets and stuck detection, and the persistence of both. Agent
//! implementations, LLM clients and sandboxes live behind the [`Agent`] and
//! [`Subscriber`] seams.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod config;
pub mod controller;
pub mod error;
pub mod event_stream;
pub mod file_store;
pub mod history;
pub mod metrics;
pub mod state;
pub mod stuck;
pub mod task;

pub use agent::Agent;
pub use agent::AgentFactory;
pub use agent::AgentRegistry;
pub use config::CoreConfig;
pub use config::DEFAULT_MAX_ITERATIONS;
pub use controller::AgentController;
pub use error::CoreErr;
pub use error::Result;
pub use event_stream::EventFilter;
pub use event_stream::EventStream;
pub use event_stream::Subscriber;
pub use file_store::FileStore;
pub use file_store::InMemoryFileStore;
pub use file_store::LocalFileStore;
pub use history::ShortTermHistory;
pub use metrics::Metrics;
pub use state::State;
pub use state::TrafficControlState;
pub use stuck::StuckDetector;
pub use task::RootTask;
pub use task::Task;
pub use task::TaskState;

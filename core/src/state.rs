use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pilot_protocol::Action;
use pilot_protocol::AgentState;
use pilot_protocol::EventPayload;
use pilot_protocol::EventSource;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use tracing::debug;
use tracing::error;

use crate::config::DEFAULT_MAX_ITERATIONS;
use crate::error::Result;
use crate::file_store::FileStore;
use crate::history::ShortTermHistory;
use crate::metrics::Metrics;
use crate::task::RootTask;

/// Budget enforcement mode for one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrafficControlState {
    /// No rate limiting.
    Normal,

    /// The task is paused because a budget was hit.
    Throttling,

    /// The user asked to resume past the budget; one more step is allowed
    /// before throttling kicks back in.
    Paused,
}

/// Everything one controller knows about its (sub)task.
///
/// `iteration` is shared across the whole delegation tree; `local_iteration`
/// counts within this subtask only. Serialization carries the history window
/// as its `start_id`/`end_id` pair — the view itself is rebound to the live
/// stream on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub root_task: RootTask,
    pub iteration: i64,
    pub local_iteration: i64,
    pub max_iterations: i64,
    #[serde(skip)]
    pub history: ShortTermHistory,
    pub inputs: BTreeMap<String, serde_json::Value>,
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub last_error: Option<String>,
    pub agent_state: AgentState,
    pub resume_state: Option<AgentState>,
    pub traffic_control_state: TrafficControlState,
    /// Spend for the whole task, shared by reference across delegates.
    pub metrics: Metrics,
    /// Spend for this subtask only.
    pub local_metrics: Metrics,
    /// 0 for the root controller; +1 per delegation level.
    pub delegate_level: i64,
    pub start_id: i64,
    pub end_id: i64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            root_task: RootTask::new(),
            iteration: 0,
            local_iteration: 0,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            history: ShortTermHistory::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            last_error: None,
            agent_state: AgentState::Loading,
            resume_state: None,
            traffic_control_state: TrafficControlState::Normal,
            metrics: Metrics::new(),
            local_metrics: Metrics::new(),
            delegate_level: 0,
            start_id: -1,
            end_id: -1,
        }
    }
}

impl State {
    pub fn new(max_iterations: i64) -> Self {
        Self {
            max_iterations,
            ..Self::default()
        }
    }

    /// Serialize to the session's opaque state blob
    /// (`sessions/<sid>/agent_state.pkl`, base64-encoded JSON). The
    /// in-memory state is untouched even when the write fails.
    pub fn save_to_session(&self, sid: &str, file_store: &dyn FileStore) -> Result<()> {
        let mut snapshot = self.clone();
        snapshot.start_id = self.history.start_id;
        snapshot.end_id = self.history.end_id;
        debug!("saving state to session {sid}: {}", snapshot.agent_state);
        let encoded = BASE64.encode(serde_json::to_vec(&snapshot)?);
        file_store
            .write(&state_path(sid), encoded.as_bytes())
            .inspect_err(|e| error!("failed to save state to session {sid}: {e}"))
    }

    /// Load a session's state blob and prepare it for a fresh controller:
    /// `resume_state` remembers where to jump back to (when the saved state
    /// was resumable), the error slot is cleared, and the controller starts
    /// over in `LOADING`.
    pub fn restore_from_session(sid: &str, file_store: &dyn FileStore) -> Result<State> {
        let encoded = file_store.read(&state_path(sid))?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| crate::error::CoreErr::Internal(format!("corrupt state blob: {e}")))?;
        let mut state: State = serde_json::from_slice(&bytes)?;
        state.resume_state = state.agent_state.is_resumable().then_some(state.agent_state);
        state.last_error = None;
        state.agent_state = AgentState::Loading;
        Ok(state)
    }

    /// Bind the history view to `stream` using the saved window.
    pub fn attach_history(&mut self, stream: Arc<crate::event_stream::EventStream>) {
        self.history.set_event_stream(stream);
        self.history.start_id = self.start_id;
        if self.end_id > -1 {
            self.history.end_id = self.end_id;
        }
    }

    /// The latest user message after the last finish — the request the agent
    /// is currently working on — or the earliest one when nothing finished
    /// yet.
    pub fn get_current_user_intent(&self) -> Option<String> {
        let mut last_user_message = None;
        for event in self.history.get_events(true) {
            match (&event.payload, event.source) {
                (EventPayload::Action(Action::Message(args)), EventSource::User) => {
                    last_user_message = Some(args.content.clone());
                }
                (EventPayload::Action(Action::Finish(_)), _) => {
                    if last_user_message.is_some() {
                        return last_user_message;
                    }
                }
                _ => {}
            }
        }
        last_user_message
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // history is a live view and deliberately excluded; its persisted
        // window is covered by start_id/end_id
        self.root_task == other.root_task
            && self.iteration == other.iteration
            && self.local_iteration == other.local_iteration
            && self.max_iterations == other.max_iterations
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.last_error == other.last_error
            && self.agent_state == other.agent_state
            && self.resume_state == other.resume_state
            && self.traffic_control_state == other.traffic_control_state
            && self.metrics == other.metrics
            && self.local_metrics == other.local_metrics
            && self.delegate_level == other.delegate_level
            && self.start_id == other.start_id
            && self.end_id == other.end_id
    }
}

fn state_path(sid: &str) -> String {
    format!("sessions/{sid}/agent_state.pkl")
}

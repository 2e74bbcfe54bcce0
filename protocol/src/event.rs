use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::action::Action;
use crate::observation::Observation;

/// Id of an event that has not been appended to a stream yet.
pub const UNASSIGNED_EVENT_ID: i64 = -1;

/// Component that put an event on the stream. Only the component a tag
/// belongs to may append events under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    User,
    Agent,
    Environment,
}

/// Either half of the action/observation split.
///
/// Untagged on the wire: the presence of an `"action"` or `"observation"`
/// key decides the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
}

/// The atomic unit of core-wide communication: an immutable record of
/// something commanded or something that happened.
///
/// Serializes to `{id, timestamp, source, cause?, action|observation, args}`.
/// Ids are assigned by the stream at append time and are contiguous from 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "unassigned")]
    pub id: i64,

    pub timestamp: DateTime<Utc>,

    pub source: EventSource,

    /// For observations: id of the action this event answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<i64>,

    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Raised when an event record cannot be decoded (unknown tag, missing
/// required fields, not JSON at all).
#[derive(Debug, Error)]
#[error("malformed event: {0}")]
pub struct MalformedEventError(pub String);

fn unassigned() -> i64 {
    UNASSIGNED_EVENT_ID
}

impl Event {
    /// A not-yet-appended action event. The stream stamps id, timestamp and
    /// source on append.
    pub fn action(action: Action) -> Self {
        Self {
            id: UNASSIGNED_EVENT_ID,
            timestamp: Utc::now(),
            source: EventSource::Agent,
            cause: None,
            payload: EventPayload::Action(action),
        }
    }

    /// A not-yet-appended observation event.
    pub fn observation(observation: Observation) -> Self {
        Self {
            id: UNASSIGNED_EVENT_ID,
            timestamp: Utc::now(),
            source: EventSource::Environment,
            cause: None,
            payload: EventPayload::Observation(observation),
        }
    }

    /// Name the action this observation answers.
    pub fn with_cause(mut self, cause: i64) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            EventPayload::Observation(_) => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Action(_) => None,
            EventPayload::Observation(observation) => Some(observation),
        }
    }

    /// The id of the action this event answers, reading the envelope `cause`
    /// first and falling back to an embedded `command_id` for producers that
    /// only fill one of the two.
    pub fn cause_id(&self) -> Option<i64> {
        if self.cause.is_some() {
            return self.cause;
        }
        if let EventPayload::Observation(Observation::CmdOutput(args)) = &self.payload
            && args.command_id >= 0
        {
            return Some(args.command_id);
        }
        None
    }

    pub fn to_json(&self) -> Result<String, MalformedEventError> {
        serde_json::to_string(self).map_err(|e| MalformedEventError(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, MalformedEventError> {
        serde_json::from_str(raw).map_err(|e| MalformedEventError(e.to_string()))
    }
}

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::action::NullArgs;
use crate::agent_state::AgentState;

/// Effect of an action, or a spontaneous environment signal.
///
/// Mirrors [`crate::Action`]'s adjacent tagging: the wire shape is
/// `{"observation": "<tag>", "args": {…}}`. An observation answering a
/// specific action names it through the event envelope's `cause` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "observation", content = "args")]
pub enum Observation {
    #[serde(rename = "run")]
    CmdOutput(CmdOutputArgs),

    #[serde(rename = "read")]
    FileRead(FileReadResultArgs),

    #[serde(rename = "write")]
    FileWrite(FileWriteResultArgs),

    #[serde(rename = "browse")]
    BrowserOutput(BrowserOutputArgs),

    #[serde(rename = "run_ipython")]
    IPythonOutput(IPythonOutputArgs),

    /// Result of a completed delegate, summarizing its outputs.
    #[serde(rename = "delegate")]
    Delegate(DelegateResultArgs),

    #[serde(rename = "agent_state_changed")]
    AgentStateChanged(AgentStateChangedArgs),

    #[serde(rename = "error")]
    Error(ErrorArgs),

    #[serde(rename = "null")]
    Null(NullArgs),
}

impl Observation {
    /// The stable serialization tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Observation::CmdOutput(_) => "run",
            Observation::FileRead(_) => "read",
            Observation::FileWrite(_) => "write",
            Observation::BrowserOutput(_) => "browse",
            Observation::IPythonOutput(_) => "run_ipython",
            Observation::Delegate(_) => "delegate",
            Observation::AgentStateChanged(_) => "agent_state_changed",
            Observation::Error(_) => "error",
            Observation::Null(_) => "null",
        }
    }

    /// Free-text payload carried by the observation.
    pub fn content(&self) -> &str {
        match self {
            Observation::CmdOutput(args) => &args.content,
            Observation::FileRead(args) => &args.content,
            Observation::FileWrite(args) => &args.content,
            Observation::BrowserOutput(args) => &args.content,
            Observation::IPythonOutput(args) => &args.content,
            Observation::Delegate(args) => &args.content,
            Observation::AgentStateChanged(args) => &args.content,
            Observation::Error(args) => &args.content,
            Observation::Null(_) => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdOutputArgs {
    pub content: String,

    #[serde(default)]
    pub command: String,

    /// Id of the originating `run` action. Kept alongside the envelope
    /// `cause` for older producers that only fill one of the two; -1 when
    /// absent.
    #[serde(default = "no_command")]
    pub command_id: i64,

    #[serde(default)]
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReadResultArgs {
    pub content: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWriteResultArgs {
    #[serde(default)]
    pub content: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserOutputArgs {
    pub content: String,
    pub url: String,

    #[serde(default)]
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IPythonOutputArgs {
    pub content: String,

    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateResultArgs {
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateChangedArgs {
    pub agent_state: AgentState,

    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorArgs {
    pub content: String,
}

fn no_command() -> i64 {
    -1
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn cmd_output_wire_shape() {
        let obs = Observation::CmdOutput(CmdOutputArgs {
            content: "foo\n".to_string(),
            command: "ls".to_string(),
            command_id: 7,
            exit_code: 0,
        });
        let value = serde_json::to_value(&obs).unwrap();
        assert_eq!(
            value,
            json!({
                "observation": "run",
                "args": {"content": "foo\n", "command": "ls", "command_id": 7, "exit_code": 0}
            })
        );
    }

    #[test]
    fn command_id_defaults_to_unset() {
        let obs: Observation = serde_json::from_value(json!({
            "observation": "run",
            "args": {"content": ""}
        }))
        .unwrap();
        let Observation::CmdOutput(args) = obs else {
            panic!("expected CmdOutput");
        };
        assert_eq!(args.command_id, -1);
    }

    #[test]
    fn agent_state_changed_round_trip() {
        let obs = Observation::AgentStateChanged(AgentStateChangedArgs {
            agent_state: AgentState::Running,
            content: String::new(),
        });
        let json = serde_json::to_string(&obs).unwrap();
        let back: Observation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, obs);
    }
}

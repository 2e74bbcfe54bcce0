use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::agent_state::AgentState;

/// Intent emitted by an agent or a user.
///
/// Adjacently tagged so the wire shape is `{"action": "<tag>", "args": {…}}`,
/// which is what external consumers of the event log expect. Unknown fields
/// inside `args` are ignored for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "args")]
pub enum Action {
    #[serde(rename = "message")]
    Message(MessageArgs),

    #[serde(rename = "run")]
    CmdRun(CmdRunArgs),

    #[serde(rename = "read")]
    FileRead(FileReadArgs),

    #[serde(rename = "write")]
    FileWrite(FileWriteArgs),

    #[serde(rename = "browse_interactive")]
    BrowseInteractive(BrowseInteractiveArgs),

    #[serde(rename = "run_ipython")]
    IPythonRunCell(IPythonRunCellArgs),

    /// Hand a sub-task to another agent; the controller spawns a delegate
    /// controller in response.
    #[serde(rename = "delegate")]
    Delegate(DelegateArgs),

    #[serde(rename = "finish")]
    Finish(FinishArgs),

    #[serde(rename = "reject")]
    Reject(RejectArgs),

    #[serde(rename = "add_task")]
    AddTask(AddTaskArgs),

    #[serde(rename = "modify_task")]
    ModifyTask(ModifyTaskArgs),

    #[serde(rename = "change_agent_state")]
    ChangeAgentState(ChangeAgentStateArgs),

    /// Injected by a condenser: replaces everything up to
    /// `last_summarized_event_id` in the history view.
    #[serde(rename = "summarize")]
    Summarize(SummarizeArgs),

    #[serde(rename = "null")]
    Null(NullArgs),
}

impl Action {
    /// Whether this action must be dispatched to a sandbox and awaited. The
    /// controller holds it as pending until an observation pairs with it.
    pub fn runnable(&self) -> bool {
        matches!(
            self,
            Action::CmdRun(_)
                | Action::FileRead(_)
                | Action::FileWrite(_)
                | Action::BrowseInteractive(_)
                | Action::IPythonRunCell(_)
        )
    }

    /// The stable serialization tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Action::Message(_) => "message",
            Action::CmdRun(_) => "run",
            Action::FileRead(_) => "read",
            Action::FileWrite(_) => "write",
            Action::BrowseInteractive(_) => "browse_interactive",
            Action::IPythonRunCell(_) => "run_ipython",
            Action::Delegate(_) => "delegate",
            Action::Finish(_) => "finish",
            Action::Reject(_) => "reject",
            Action::AddTask(_) => "add_task",
            Action::ModifyTask(_) => "modify_task",
            Action::ChangeAgentState(_) => "change_agent_state",
            Action::Summarize(_) => "summarize",
            Action::Null(_) => "null",
        }
    }

    /// One-line human description, used for logging.
    pub fn message(&self) -> String {
        match self {
            Action::Message(args) => args.content.clone(),
            Action::CmdRun(args) => format!("Running command: {}", args.command),
            Action::FileRead(args) => format!("Reading file: {}", args.path),
            Action::FileWrite(args) => format!("Writing file: {}", args.path),
            Action::BrowseInteractive(_) => "Interacting with the browser".to_string(),
            Action::IPythonRunCell(args) => format!("Running Python code: {}", args.code),
            Action::Delegate(args) => format!("Delegating to agent: {}", args.agent),
            Action::Finish(_) => "All done. What's next on the agenda?".to_string(),
            Action::Reject(_) => "Task rejected".to_string(),
            Action::AddTask(args) => format!("Added task: {}", args.goal),
            Action::ModifyTask(args) => {
                format!("Set task {} to {}", args.task_id, args.state)
            }
            Action::ChangeAgentState(args) => {
                format!("Agent state changed to {}", args.agent_state)
            }
            Action::Summarize(args) => args.summary.clone(),
            Action::Null(_) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageArgs {
    pub content: String,

    /// When set on an agent-sourced message, the controller parks in
    /// `AWAITING_USER_INPUT` until the user replies.
    #[serde(default)]
    pub wait_for_response: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdRunArgs {
    pub command: String,

    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReadArgs {
    pub path: String,

    /// Inclusive start line; 0 reads from the top.
    #[serde(default)]
    pub start: i64,

    /// Exclusive end line; -1 reads to the end.
    #[serde(default = "unbounded")]
    pub end: i64,

    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWriteArgs {
    pub path: String,
    pub content: String,

    #[serde(default)]
    pub start: i64,

    #[serde(default = "unbounded")]
    pub end: i64,

    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowseInteractiveArgs {
    /// A script in the browsing DSL understood by the browser sandbox.
    pub browser_actions: String,

    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IPythonRunCellArgs {
    pub code: String,

    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateArgs {
    /// Registered name of the agent to delegate to.
    pub agent: String,

    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishArgs {
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectArgs {
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub thought: String,
}

/// A goal nested under `AddTask`; may carry its own children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub goal: String,

    #[serde(default)]
    pub subtasks: Vec<TaskItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddTaskArgs {
    /// Dotted-path id of the parent task; empty string for the root.
    #[serde(default)]
    pub parent: String,

    pub goal: String,

    #[serde(default)]
    pub subtasks: Vec<TaskItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyTaskArgs {
    pub task_id: String,

    /// Task state as a string; validated by the task tree, not the codec, so
    /// that an unknown state surfaces as a task error rather than a decode
    /// failure.
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAgentStateArgs {
    pub agent_state: AgentState,

    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizeArgs {
    pub summary: String,

    /// Highest event id covered by the summary.
    pub last_summarized_event_id: i64,
}

/// Empty args carrier so `null` variants still serialize `"args": {}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullArgs {}

fn unbounded() -> i64 {
    -1
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn cmd_run_wire_shape() {
        let action = Action::CmdRun(CmdRunArgs {
            command: "ls -la".to_string(),
            thought: String::new(),
        });
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(
            value,
            json!({"action": "run", "args": {"command": "ls -la", "thought": ""}})
        );
    }

    #[test]
    fn null_serializes_with_empty_args() {
        let value = serde_json::to_value(Action::Null(NullArgs {})).unwrap();
        assert_eq!(value, json!({"action": "null", "args": {}}));
    }

    #[test]
    fn unknown_args_fields_are_ignored() {
        let action: Action = serde_json::from_value(json!({
            "action": "message",
            "args": {"content": "hi", "wait_for_response": true, "images": []}
        }))
        .unwrap();
        assert_eq!(
            action,
            Action::Message(MessageArgs {
                content: "hi".to_string(),
                wait_for_response: true,
            })
        );
    }

    #[test]
    fn runnable_split() {
        let runnable = Action::CmdRun(CmdRunArgs {
            command: "true".to_string(),
            thought: String::new(),
        });
        let not_runnable = Action::Finish(FinishArgs {
            outputs: BTreeMap::new(),
            thought: String::new(),
        });
        assert!(runnable.runnable());
        assert!(!not_runnable.runnable());
        assert!(!Action::Null(NullArgs {}).runnable());
    }
}

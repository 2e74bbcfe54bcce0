use std::fmt;
use std::str::FromStr;

use pilot_protocol::TaskItem;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::error::CoreErr;
use crate::error::Result;

/// Lifecycle of one goal in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    Open,
    InProgress,
    Completed,
    Abandoned,
    Verified,
}

impl FromStr for TaskState {
    type Err = CoreErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(TaskState::Open),
            "in_progress" => Ok(TaskState::InProgress),
            "completed" => Ok(TaskState::Completed),
            "abandoned" => Ok(TaskState::Abandoned),
            "verified" => Ok(TaskState::Verified),
            other => Err(CoreErr::TaskState(other.to_string())),
        }
    }
}

/// One node of the plan. Parent and children are arena indices into
/// [`RootTask::nodes`]; traversal never follows pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Dotted path: the root is `""`, its first child `"0"`, that child's
    /// first child `"0.0"`, and so on.
    pub id: String,
    pub goal: String,
    pub state: TaskState,
    parent: Option<usize>,
    subtasks: Vec<usize>,
}

/// Dotted-path addressable tree of goals with state propagation. Node 0 is
/// the invisible root holding the top-level tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootTask {
    nodes: Vec<Task>,
}

impl Default for RootTask {
    fn default() -> Self {
        Self {
            nodes: vec![Task {
                id: String::new(),
                goal: String::new(),
                state: TaskState::Open,
                parent: None,
                subtasks: Vec::new(),
            }],
        }
    }
}

impl RootTask {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, id: &str) -> Result<usize> {
        if id.is_empty() {
            return Ok(0);
        }
        let mut index = 0;
        for part in id.split('.') {
            let child: usize = part
                .parse()
                .map_err(|_| CoreErr::MalformedAction(format!("invalid task id: {id}")))?;
            index = *self.nodes[index]
                .subtasks
                .get(child)
                .ok_or_else(|| {
                    CoreErr::MalformedAction(format!("task does not exist: {id}"))
                })?;
        }
        Ok(index)
    }

    pub fn get_task_by_id(&self, id: &str) -> Result<&Task> {
        Ok(&self.nodes[self.resolve(id)?])
    }

    /// Append a child under `parent_id`. The new task's id extends the
    /// parent's path with the next child index; nested `subtasks` are added
    /// below it the same way.
    pub fn add_subtask(
        &mut self,
        parent_id: &str,
        goal: &str,
        subtasks: &[TaskItem],
    ) -> Result<()> {
        let parent = self.resolve(parent_id)?;
        let index = self.push_child(parent, goal);
        self.add_items(index, subtasks);
        Ok(())
    }

    fn push_child(&mut self, parent: usize, goal: &str) -> usize {
        let parent_path = self.nodes[parent].id.clone();
        let ordinal = self.nodes[parent].subtasks.len();
        let id = if parent_path.is_empty() {
            ordinal.to_string()
        } else {
            format!("{parent_path}.{ordinal}")
        };
        let index = self.nodes.len();
        self.nodes.push(Task {
            id,
            goal: goal.to_string(),
            state: TaskState::Open,
            parent: Some(parent),
            subtasks: Vec::new(),
        });
        self.nodes[parent].subtasks.push(index);
        index
    }

    fn add_items(&mut self, parent: usize, items: &[TaskItem]) {
        for item in items {
            let index = self.push_child(parent, &item.goal);
            self.add_items(index, &item.subtasks);
        }
    }

    /// Set the state of the task at `id`, propagating it through the tree:
    /// closing states flow down to every descendant that was not abandoned,
    /// `in_progress` bubbles up through the parent chain.
    pub fn set_subtask_state(&mut self, id: &str, state: &str) -> Result<()> {
        let target = self.resolve(id)?;
        let state = TaskState::from_str(state)?;
        self.set_state(target, state);
        Ok(())
    }

    fn set_state(&mut self, index: usize, state: TaskState) {
        self.nodes[index].state = state;
        match state {
            TaskState::Completed | TaskState::Abandoned | TaskState::Verified => {
                for child in self.nodes[index].subtasks.clone() {
                    if self.nodes[child].state != TaskState::Abandoned {
                        self.set_state(child, state);
                    }
                }
            }
            TaskState::InProgress => {
                if let Some(parent) = self.nodes[index].parent
                    && parent != 0
                {
                    self.set_state(parent, state);
                }
            }
            TaskState::Open => {}
        }
    }

    /// Depth-first search for the deepest `in_progress` task.
    pub fn get_current_task(&self) -> Option<&Task> {
        self.current_below(0)
    }

    fn current_below(&self, index: usize) -> Option<&Task> {
        for &child in &self.nodes[index].subtasks {
            if self.nodes[child].state == TaskState::InProgress {
                return self.current_below(child);
            }
        }
        if index != 0 && self.nodes[index].state == TaskState::InProgress {
            Some(&self.nodes[index])
        } else {
            None
        }
    }

    fn write_subtree(&self, index: usize, indent: &str, out: &mut String) {
        for &child in &self.nodes[index].subtasks {
            let task = &self.nodes[child];
            out.push_str(&format!(
                "{indent}[{}] {} {}\n",
                task.state, task.id, task.goal
            ));
            self.write_subtree(child, &format!("{indent}    "), out);
        }
    }
}

impl fmt::Display for RootTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_subtree(0, "", &mut out);
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> RootTask {
        let mut root = RootTask::new();
        root.add_subtask("", "ship the feature", &[]).unwrap();
        root.add_subtask("0", "write the code", &[]).unwrap();
        root.add_subtask("0", "write the tests", &[]).unwrap();
        root.add_subtask("0.1", "unit tests", &[]).unwrap();
        root
    }

    #[test]
    fn dotted_ids_follow_insertion_order() {
        let root = sample();
        assert_eq!(root.get_task_by_id("0").unwrap().goal, "ship the feature");
        assert_eq!(root.get_task_by_id("0.0").unwrap().goal, "write the code");
        assert_eq!(root.get_task_by_id("0.1.0").unwrap().goal, "unit tests");
    }

    #[test]
    fn nested_items_are_added_below_the_new_task() {
        let mut root = RootTask::new();
        root.add_subtask(
            "",
            "top",
            &[
                TaskItem {
                    goal: "first".to_string(),
                    subtasks: vec![TaskItem {
                        goal: "deep".to_string(),
                        subtasks: Vec::new(),
                    }],
                },
                TaskItem {
                    goal: "second".to_string(),
                    subtasks: Vec::new(),
                },
            ],
        )
        .unwrap();
        assert_eq!(root.get_task_by_id("0.0.0").unwrap().goal, "deep");
        assert_eq!(root.get_task_by_id("0.1").unwrap().goal, "second");
    }

    #[test]
    fn malformed_and_missing_ids_fail() {
        let root = sample();
        assert!(matches!(
            root.get_task_by_id("zero"),
            Err(CoreErr::MalformedAction(_))
        ));
        assert!(matches!(
            root.get_task_by_id("0.7"),
            Err(CoreErr::MalformedAction(_))
        ));
    }

    #[test]
    fn completion_flows_down_but_skips_abandoned() {
        let mut root = sample();
        root.set_subtask_state("0.1.0", "abandoned").unwrap();
        root.set_subtask_state("0", "completed").unwrap();
        assert_eq!(root.get_task_by_id("0").unwrap().state, TaskState::Completed);
        assert_eq!(
            root.get_task_by_id("0.0").unwrap().state,
            TaskState::Completed
        );
        assert_eq!(
            root.get_task_by_id("0.1").unwrap().state,
            TaskState::Completed
        );
        assert_eq!(
            root.get_task_by_id("0.1.0").unwrap().state,
            TaskState::Abandoned
        );
    }

    #[test]
    fn in_progress_bubbles_up() {
        let mut root = sample();
        root.set_subtask_state("0.1.0", "in_progress").unwrap();
        assert_eq!(
            root.get_task_by_id("0.1").unwrap().state,
            TaskState::InProgress
        );
        assert_eq!(root.get_task_by_id("0").unwrap().state, TaskState::InProgress);
        let current = root.get_current_task().unwrap();
        assert_eq!(current.id, "0.1.0");
    }

    #[test]
    fn invalid_state_string_is_rejected() {
        let mut root = sample();
        assert!(matches!(
            root.set_subtask_state("0", "paused"),
            Err(CoreErr::TaskState(_))
        ));
    }

    #[test]
    fn renders_indented_tree() {
        let mut root = sample();
        root.set_subtask_state("0.0", "completed").unwrap();
        let rendered = root.to_string();
        assert!(rendered.contains("[completed] 0.0 write the code"));
        assert!(rendered.starts_with("[open] 0 ship the feature"));
    }

    #[test]
    fn survives_serialization() {
        let root = sample();
        let json = serde_json::to_string(&root).unwrap();
        let back: RootTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, root);
    }
}

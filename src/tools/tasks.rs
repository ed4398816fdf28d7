//! Task tracker adapter (`br` beads or `bn` bones).
//!
//! The two trackers disagree on subcommand names and status vocabulary;
//! [`TaskStatus`] normalises both.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::{ToolCommand, ToolError, Toolbox};
use crate::config::TaskFlavor;

/// Normalised task lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// `open` / `ready`
    Open,
    /// `in_progress` / `doing`
    Active,
    /// `closed` / `done`
    Done,
    /// Missing or unrecognised.
    Unknown,
}

impl TaskStatus {
    /// Map either tracker's status string.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open" | "ready" | "todo" => Self::Open,
            "in_progress" | "doing" | "active" => Self::Active,
            "closed" | "done" => Self::Done,
            _ => Self::Unknown,
        }
    }

    /// Extract the status from `show --json` output.
    ///
    /// Reads `status` or `state` from the object, or from the first element
    /// when the tracker prints an array.
    pub fn from_json(value: &Value) -> Self {
        let obj = match value {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        obj.and_then(|o| o.get("status").or_else(|| o.get("state")))
            .and_then(Value::as_str)
            .map_or(Self::Unknown, Self::parse)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Active => write!(f, "active"),
            Self::Done => write!(f, "done"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Typed view over the task tracker.
pub struct Tasks<'a> {
    tools: &'a Toolbox<'a>,
}

impl<'a> Tasks<'a> {
    pub(crate) const fn new(tools: &'a Toolbox<'a>) -> Self {
        Self { tools }
    }

    const fn flavor(&self) -> TaskFlavor {
        self.tools.bins().task_flavor
    }

    fn cmd<I, S>(&self, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bins = self.tools.bins();
        let cmd = self.tools.command(&bins.tasks).args(args);
        if bins.via_maw {
            cmd.via_maw_exec(&bins.maw, "default")
        } else {
            cmd
        }
    }

    /// `init` the tracker in the project.
    pub fn init(&self) -> Result<(), ToolError> {
        self.tools.runner().run_ok(&self.cmd(["init"]))?;
        Ok(())
    }

    /// Create a task and return its id.
    pub fn create(&self, actor: &str, title: &str, description: &str) -> Result<String, ToolError> {
        let title = format!("--title={title}");
        let description = format!("--description={description}");
        let cmd = self.cmd([
            "create",
            "--actor",
            actor,
            "--owner",
            actor,
            title.as_str(),
            description.as_str(),
            "--type=task",
            "--priority=2",
            "--json",
        ]);
        let value = self.tools.runner().run_json(&cmd)?;
        let obj = match &value {
            Value::Array(items) => items.first().unwrap_or(&Value::Null),
            other => other,
        };
        obj.get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ToolError::Parse {
                command: cmd.to_string(),
                detail: "no id in create output".to_owned(),
            })
    }

    /// `show <id> --json`
    pub fn show_json(&self, id: &str) -> Result<Value, ToolError> {
        self.tools.runner().run_json(&self.cmd(["show", id, "--json"]))
    }

    /// `show <id>` as text.
    pub fn show_text(&self, id: &str) -> Result<String, ToolError> {
        Ok(self.tools.runner().run_ok(&self.cmd(["show", id]))?.stdout)
    }

    /// Current normalised status.
    pub fn status(&self, id: &str) -> Result<TaskStatus, ToolError> {
        Ok(TaskStatus::from_json(&self.show_json(id)?))
    }

    /// `close` (beads) or `done` (bones).
    pub fn close(&self, actor: &str, id: &str) -> Result<(), ToolError> {
        let verb = match self.flavor() {
            TaskFlavor::Beads => "close",
            TaskFlavor::Bones => "done",
        };
        self.tools
            .runner()
            .run_ok(&self.cmd([verb, "--actor", actor, id]))?;
        Ok(())
    }

    /// `comments add` (beads) or `comment add` (bones).
    pub fn comment(&self, actor: &str, id: &str, text: &str) -> Result<(), ToolError> {
        let noun = match self.flavor() {
            TaskFlavor::Beads => "comments",
            TaskFlavor::Bones => "comment",
        };
        self.tools
            .runner()
            .run_ok(&self.cmd([noun, "add", "--actor", actor, id, text]))?;
        Ok(())
    }
}

//! `botty` adapter: list and kill spawned agents.

use serde::Deserialize;
use serde_json::Value;

use super::{ToolCommand, ToolError, Toolbox};

/// One agent as reported by `botty list --format json`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BottyAgent {
    pub id: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Parse `botty list` output (`{"agents": [...]}` or a bare array).
pub fn parse_agents(value: Value) -> Result<Vec<BottyAgent>, serde_json::Error> {
    let list = match value {
        Value::Object(mut map) => map.remove("agents").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(list)
}

/// Typed view over the `botty` CLI.
pub struct Botty<'a> {
    tools: &'a Toolbox<'a>,
}

impl<'a> Botty<'a> {
    pub(crate) const fn new(tools: &'a Toolbox<'a>) -> Self {
        Self { tools }
    }

    fn cmd(&self) -> ToolCommand {
        self.tools.command(&self.tools.bins().botty)
    }

    /// Running agents.
    pub fn list(&self) -> Result<Vec<BottyAgent>, ToolError> {
        let cmd = self.cmd().args(["list", "--format", "json"]);
        let value = self.tools.runner().run_json(&cmd)?;
        parse_agents(value).map_err(|e| ToolError::Parse {
            command: cmd.to_string(),
            detail: e.to_string(),
        })
    }

    /// Whether an agent with this id is listed and not exited.
    pub fn is_alive(&self, id: &str) -> Result<bool, ToolError> {
        Ok(self.list()?.iter().any(|a| {
            a.id == id
                && !matches!(
                    a.status.as_deref(),
                    Some("exited" | "dead" | "stopped")
                )
        }))
    }

    /// `botty kill <id>`
    pub fn kill(&self, id: &str) -> Result<(), ToolError> {
        self.tools.runner().run_ok(&self.cmd().args(["kill", id]))?;
        Ok(())
    }
}

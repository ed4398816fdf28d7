//! `maw` adapter: workspace create/list/merge.

use serde_json::Value;

use super::{ToolCommand, ToolError, Toolbox};

/// Name of the persistent workspace every maw repo has.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Workspace names from `maw ws list --format json`.
///
/// Accepts `{"workspaces": [{"name": ..}]}`, a bare array of objects, or a
/// bare array of strings.
pub fn workspace_names(value: &Value) -> Vec<String> {
    let list = value
        .get("workspaces")
        .unwrap_or(value)
        .as_array()
        .cloned()
        .unwrap_or_default();
    list.iter()
        .filter_map(|w| match w {
            Value::String(s) => Some(s.clone()),
            other => other.get("name").and_then(Value::as_str).map(str::to_owned),
        })
        .collect()
}

/// Typed view over the `maw` CLI.
pub struct Maw<'a> {
    tools: &'a Toolbox<'a>,
}

impl<'a> Maw<'a> {
    pub(crate) const fn new(tools: &'a Toolbox<'a>) -> Self {
        Self { tools }
    }

    fn cmd(&self) -> ToolCommand {
        self.tools.command(&self.tools.bins().maw)
    }

    /// `maw init`
    pub fn init(&self) -> Result<(), ToolError> {
        self.tools.runner().run_ok(&self.cmd().arg("init"))?;
        Ok(())
    }

    /// `maw ws create <name>`
    pub fn ws_create(&self, name: &str) -> Result<(), ToolError> {
        self.tools
            .runner()
            .run_ok(&self.cmd().args(["ws", "create", name]))?;
        Ok(())
    }

    /// `maw ws list --format json`
    pub fn ws_list_json(&self) -> Result<Value, ToolError> {
        self.tools
            .runner()
            .run_json(&self.cmd().args(["ws", "list", "--format", "json"]))
    }

    /// Workspaces other than `default`.
    pub fn extra_workspaces(&self) -> Result<Vec<String>, ToolError> {
        Ok(workspace_names(&self.ws_list_json()?)
            .into_iter()
            .filter(|n| n != DEFAULT_WORKSPACE)
            .collect())
    }

    /// `maw ws merge <name> [--destroy]`
    pub fn ws_merge(&self, name: &str, destroy: bool) -> Result<(), ToolError> {
        let mut cmd = self.cmd().args(["ws", "merge", name]);
        if destroy {
            cmd = cmd.arg("--destroy");
        }
        self.tools.runner().run_ok(&cmd)?;
        Ok(())
    }

    /// Build `maw exec <workspace> -- <program> <args...>` for the caller to run.
    pub fn exec(&self, workspace: &str, program: &str, args: &[&str]) -> ToolCommand {
        self.tools
            .command(program)
            .args(args.iter().copied())
            .via_maw_exec(&self.tools.bins().maw, workspace)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::ToolsConfig;
    use crate::tools::ToolOutput;
    use crate::tools::fake::ScriptedRunner;

    #[test]
    fn workspace_names_accepts_all_shapes() {
        assert_eq!(
            workspace_names(&json!({"workspaces": [{"name": "default"}, {"name": "eval-dev"}]})),
            ["default", "eval-dev"]
        );
        assert_eq!(workspace_names(&json!([{"name": "a"}])), ["a"]);
        assert_eq!(workspace_names(&json!(["x", "y"])), ["x", "y"]);
        assert!(workspace_names(&json!({"other": 1})).is_empty());
    }

    #[test]
    fn extra_workspaces_excludes_default() {
        let runner = ScriptedRunner::new().on(
            "maw",
            &["ws", "list"],
            ToolOutput::ok(r#"{"workspaces":[{"name":"default"},{"name":"frost-castle"}]}"#),
        );
        let tools = Toolbox::new(&runner, ToolsConfig::default(), "/tmp/p");
        assert_eq!(tools.maw().extra_workspaces().unwrap(), ["frost-castle"]);
    }

    #[test]
    fn exec_wraps_command() {
        let runner = ScriptedRunner::new();
        let tools = Toolbox::new(&runner, ToolsConfig::default(), "/tmp/p");
        let cmd = tools.maw().exec("default", "cargo", &["test"]);
        assert_eq!(cmd.program, "maw");
        assert_eq!(cmd.args, ["exec", "default", "--", "cargo", "test"]);
    }
}

//! `bus` adapter: init, messaging, hooks and claims.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ToolCommand, ToolError, ToolOutput, Toolbox};

/// A bus hook: spawn a command when a channel condition fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub id: String,
    pub channel: String,
    pub condition: HookCondition,
    /// The command run when the hook fires (usually `botty spawn ...`).
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default)]
    pub release_on_exit: bool,
}

/// What makes a hook fire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookCondition {
    /// A claim matching `pattern` is free.
    ClaimAvailable { pattern: String },
    /// `agent` was @-mentioned on the channel.
    MentionReceived { agent: String },
    /// A condition type this harness does not know how to re-create.
    #[serde(other)]
    Unknown,
}

impl HookCondition {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ClaimAvailable { .. } => "claim_available",
            Self::MentionReceived { .. } => "mention_received",
            Self::Unknown => "unknown",
        }
    }
}

impl Hook {
    /// Arguments for `bus hooks add` that re-create this hook.
    ///
    /// Returns `None` for [`HookCondition::Unknown`].
    pub fn add_args(&self) -> Option<Vec<String>> {
        let mut args = vec![
            "hooks".to_owned(),
            "add".to_owned(),
            "--channel".to_owned(),
            self.channel.clone(),
        ];
        match &self.condition {
            HookCondition::ClaimAvailable { pattern } => {
                args.push("--claim".to_owned());
                args.push(pattern.clone());
                if self.release_on_exit {
                    args.push("--release-on-exit".to_owned());
                }
            }
            HookCondition::MentionReceived { agent } => {
                args.push("--mention".to_owned());
                args.push(agent.clone());
            }
            HookCondition::Unknown => return None,
        }
        if let Some(cwd) = &self.cwd {
            args.push("--cwd".to_owned());
            args.push(cwd.clone());
        }
        if let Some(cooldown) = &self.cooldown {
            args.push("--cooldown".to_owned());
            args.push(cooldown.clone());
        }
        if let Some(priority) = self.priority {
            args.push("--priority".to_owned());
            args.push(priority.to_string());
        }
        args.push("--".to_owned());
        args.extend(self.command.iter().cloned());
        Some(args)
    }
}

/// Parse `bus hooks list --format json`, accepting either a bare array or
/// an object with a `hooks` array.
pub fn parse_hooks(value: Value) -> Result<Vec<Hook>, serde_json::Error> {
    let list = match value {
        Value::Object(mut map) => map.remove("hooks").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(list)
}

/// Typed view over the `bus` CLI.
pub struct Bus<'a> {
    tools: &'a Toolbox<'a>,
}

impl<'a> Bus<'a> {
    pub(crate) const fn new(tools: &'a Toolbox<'a>) -> Self {
        Self { tools }
    }

    fn cmd(&self) -> ToolCommand {
        self.tools.command(&self.tools.bins().bus)
    }

    /// `bus init` in the eval's isolated data dir.
    pub fn init(&self) -> Result<(), ToolError> {
        self.tools.runner().run_ok(&self.cmd().arg("init"))?;
        Ok(())
    }

    /// `bus send --agent <agent> <channel> <message> [-L <label>]`
    pub fn send(
        &self,
        agent: &str,
        channel: &str,
        message: &str,
        label: Option<&str>,
    ) -> Result<(), ToolError> {
        let mut cmd = self
            .cmd()
            .args(["send", "--agent", agent, channel, message]);
        if let Some(label) = label {
            cmd = cmd.args(["-L", label]);
        }
        self.tools.runner().run_ok(&cmd)?;
        Ok(())
    }

    /// `bus history <channel> -n <limit>` as text.
    pub fn history(&self, channel: &str, limit: usize) -> Result<String, ToolError> {
        let cmd = self
            .cmd()
            .args(["history", channel, "-n", &limit.to_string()]);
        Ok(self.tools.runner().run_ok(&cmd)?.stdout)
    }

    /// `bus inbox --agent <agent> --all` as text.
    pub fn inbox(&self, agent: &str) -> Result<String, ToolError> {
        let cmd = self.cmd().args(["inbox", "--agent", agent, "--all"]);
        Ok(self.tools.runner().run_ok(&cmd)?.stdout)
    }

    /// `bus hooks list --format json`
    pub fn hooks_list(&self) -> Result<Vec<Hook>, ToolError> {
        let cmd = self.cmd().args(["hooks", "list", "--format", "json"]);
        let value = self.tools.runner().run_json(&cmd)?;
        parse_hooks(value).map_err(|e| ToolError::Parse {
            command: cmd.to_string(),
            detail: e.to_string(),
        })
    }

    /// `bus hooks add ...` re-creating `hook`. Returns the tool's output.
    pub fn hooks_add(&self, hook: &Hook) -> Result<ToolOutput, ToolError> {
        let Some(args) = hook.add_args() else {
            return Err(ToolError::Parse {
                command: "bus hooks add".to_owned(),
                detail: format!("hook {} has an unsupported condition type", hook.id),
            });
        };
        self.tools.runner().run_ok(&self.cmd().args(args))
    }

    /// `bus hooks remove <id>`
    pub fn hooks_remove(&self, id: &str) -> Result<(), ToolError> {
        self.tools
            .runner()
            .run_ok(&self.cmd().args(["hooks", "remove", id]))?;
        Ok(())
    }

    /// `bus claims list --format json`
    pub fn claims_list(&self) -> Result<Value, ToolError> {
        let cmd = self.cmd().args(["claims", "list", "--format", "json"]);
        self.tools.runner().run_json(&cmd)
    }

    /// `bus claims stake --agent <agent> <uri> -m <memo>`
    pub fn claims_stake(&self, agent: &str, uri: &str, memo: &str) -> Result<(), ToolError> {
        let cmd = self
            .cmd()
            .args(["claims", "stake", "--agent", agent, uri, "-m", memo]);
        self.tools.runner().run_ok(&cmd)?;
        Ok(())
    }

    /// `bus claims release --agent <agent> <uri>`
    pub fn claims_release(&self, agent: &str, uri: &str) -> Result<(), ToolError> {
        let cmd = self
            .cmd()
            .args(["claims", "release", "--agent", agent, uri]);
        self.tools.runner().run_ok(&cmd)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn claim_hook() -> Hook {
        Hook {
            id: "hk-1".to_owned(),
            channel: "evalproj".to_owned(),
            condition: HookCondition::ClaimAvailable {
                pattern: "agent://eval-dev".to_owned(),
            },
            command: vec![
                "botty".to_owned(),
                "spawn".to_owned(),
                "--name".to_owned(),
                "eval-dev".to_owned(),
            ],
            cwd: Some("/tmp/eval/proj".to_owned()),
            cooldown: Some("30s".to_owned()),
            priority: None,
            release_on_exit: true,
        }
    }

    #[test]
    fn parses_wrapped_and_bare_hook_lists() {
        let hook = json!({
            "id": "hk-2",
            "channel": "evalproj",
            "condition": {"type": "mention_received", "agent": "eval-reviewer"},
            "command": ["botty", "spawn"],
        });
        let wrapped = parse_hooks(json!({"hooks": [hook.clone()]})).unwrap();
        let bare = parse_hooks(json!([hook])).unwrap();
        assert_eq!(wrapped, bare);
        assert_eq!(
            wrapped[0].condition,
            HookCondition::MentionReceived {
                agent: "eval-reviewer".to_owned()
            }
        );
    }

    #[test]
    fn unknown_condition_type_parses() {
        let hooks = parse_hooks(json!([{
            "id": "hk-3",
            "channel": "c",
            "condition": {"type": "message_pattern", "regex": ".*"},
            "command": [],
        }]))
        .unwrap();
        assert_eq!(hooks[0].condition, HookCondition::Unknown);
        assert!(hooks[0].add_args().is_none());
    }

    #[test]
    fn claim_hook_add_args() {
        let args = claim_hook().add_args().unwrap();
        assert_eq!(
            args,
            [
                "hooks",
                "add",
                "--channel",
                "evalproj",
                "--claim",
                "agent://eval-dev",
                "--release-on-exit",
                "--cwd",
                "/tmp/eval/proj",
                "--cooldown",
                "30s",
                "--",
                "botty",
                "spawn",
                "--name",
                "eval-dev",
            ]
        );
    }

    #[test]
    fn mention_hook_add_args_skip_release_flag() {
        let mut hook = claim_hook();
        hook.condition = HookCondition::MentionReceived {
            agent: "eval-reviewer".to_owned(),
        };
        let args = hook.add_args().unwrap();
        assert!(args.contains(&"--mention".to_owned()));
        assert!(!args.contains(&"--release-on-exit".to_owned()));
        assert!(!args.contains(&"--claim".to_owned()));
    }
}

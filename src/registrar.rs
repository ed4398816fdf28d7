//! Environment and identity registration.
//!
//! Initialises the eval's isolated bus, names the agents, patches the
//! project's JSON config, and re-registers bus hooks so that spawned agents
//! inherit the isolated `BOTBUS_DATA_DIR`. `botty spawn` does not forward
//! the parent environment, so each hook's `--env-inherit` list must name
//! the variable explicitly.

use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use rand::seq::IndexedRandom as _;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{EvalError, Result};
use crate::tools::Toolbox;
use crate::tools::bus::{Hook, HookCondition};

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusky", "eager", "frosty", "gilded", "hollow", "ivory", "jade",
    "keen", "lunar", "misty", "noble", "opal", "quiet", "rustic", "silver", "tidal", "vivid",
];

const NOUNS: &[&str] = &[
    "anvil", "badger", "cedar", "delta", "ember", "falcon", "glacier", "harbor", "island",
    "juniper", "kestrel", "lantern", "meadow", "nebula", "orchid", "pike", "quarry", "raven",
    "summit", "thistle",
];

/// Generate an agent name like `eval-dev-amber-falcon`.
pub fn agent_name<R: Rng + ?Sized>(rng: &mut R, role: &str) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("plain");
    let noun = NOUNS.choose(rng).copied().unwrap_or("agent");
    format!("eval-{role}-{adjective}-{noun}")
}

/// Resolve a name for every role: configured names win, the rest are
/// generated. Generated names are unique within the eval.
pub fn resolve_agent_names<R: Rng + ?Sized>(
    rng: &mut R,
    roles: &[&str],
    configured: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut names = BTreeMap::new();
    for role in roles {
        let name = if let Some(fixed) = configured.get(*role) {
            fixed.clone()
        } else {
            loop {
                let candidate = agent_name(rng, role);
                if !names.values().any(|n| n == &candidate) {
                    break candidate;
                }
            }
        };
        names.insert((*role).to_owned(), name);
    }
    names
}

/// `bus init` against the eval's isolated data dir.
pub fn init_bus(tools: &Toolbox<'_>) -> Result<()> {
    tools.bus().init()?;
    Ok(())
}

/// Announce each identity on the project channel so it shows up in
/// `bus history` and can be @-mentioned.
pub fn register_agents<'n>(
    tools: &Toolbox<'_>,
    channel: &str,
    names: impl IntoIterator<Item = &'n str>,
) -> Result<()> {
    for name in names {
        tools
            .bus()
            .send(name, channel, &format!("{name} online"), Some("eval-setup"))?;
        tracing::info!(agent = name, channel, "agent registered");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JSON config patching
// ---------------------------------------------------------------------------

fn pointer_tokens(pointer: &str) -> std::result::Result<Vec<String>, String> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err("JSON pointer must start with '/'".to_owned());
    };
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Set `value` at `pointer` inside `doc`, creating intermediate objects.
pub fn set_pointer(doc: &mut Value, pointer: &str, value: Value) -> std::result::Result<(), String> {
    let tokens = pointer_tokens(pointer)?;
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    let mut cur = doc;
    for token in parents {
        let Value::Object(map) = cur else {
            return Err(format!("'{token}' is inside a non-object value"));
        };
        cur = map
            .entry(token.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx: usize = last
                .parse()
                .map_err(|_| format!("'{last}' is not an array index"))?;
            let slot = items
                .get_mut(idx)
                .ok_or_else(|| format!("index {idx} out of bounds"))?;
            *slot = value;
            Ok(())
        }
        _ => Err(format!("'{last}' is inside a non-container value")),
    }
}

/// Read a JSON config file, apply `(pointer, value)` patches, and replace
/// the file atomically.
pub fn patch_json_config(path: &Path, patches: &[(&str, Value)]) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    let mut doc: Value = serde_json::from_str(&text)?;
    for (pointer, value) in patches {
        set_pointer(&mut doc, pointer, value.clone()).map_err(|detail| EvalError::JsonPatch {
            path: path.to_owned(),
            pointer: (*pointer).to_owned(),
            detail,
        })?;
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, &doc)?;
    std::io::Write::write_all(&mut tmp, b"\n")?;
    tmp.persist(path).map_err(|e| EvalError::Io(e.error))?;
    tracing::debug!(path = %path.display(), patches = patches.len(), "config patched");
    Ok(doc)
}

// ---------------------------------------------------------------------------
// Hook re-registration
// ---------------------------------------------------------------------------

/// Return `command` with `var` added to its `--env-inherit` list.
///
/// Handles both `--env-inherit A,B` and `--env-inherit=A,B`. When the flag
/// is absent it is inserted right after `spawn`. Returns `None` when the
/// command already inherits `var` or has no place to put the flag.
pub fn with_inherited_env(command: &[String], var: &str) -> Option<Vec<String>> {
    let mut out = command.to_vec();

    for i in 0..out.len() {
        if out[i] == "--env-inherit" {
            let list = out.get_mut(i + 1)?;
            return append_var(list, var).then_some(out);
        }
        if let Some(list) = out[i].strip_prefix("--env-inherit=") {
            let mut list = list.to_owned();
            if !append_var(&mut list, var) {
                return None;
            }
            out[i] = format!("--env-inherit={list}");
            return Some(out);
        }
        if out[i] == "--" {
            break;
        }
    }

    let spawn = out.iter().position(|a| a == "spawn")?;
    out.insert(spawn + 1, var.to_owned());
    out.insert(spawn + 1, "--env-inherit".to_owned());
    Some(out)
}

fn append_var(list: &mut String, var: &str) -> bool {
    if list.split(',').any(|v| v.trim() == var) {
        return false;
    }
    if !list.is_empty() {
        list.push(',');
    }
    list.push_str(var);
    true
}

/// Outcome of [`refresh_hooks`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct HookRefresh {
    /// Hooks removed and re-added with the extra variable.
    pub recreated: Vec<Hook>,
    /// Hooks that already inherited the variable.
    pub unchanged: Vec<Hook>,
    /// Hooks left alone, with the reason.
    pub skipped: Vec<(Hook, String)>,
    /// Hooks that were removed but could not be re-added.
    pub failed: Vec<(Hook, String)>,
}

impl HookRefresh {
    /// Every hook that still exists after the refresh, as
    /// `(condition, channel)` pairs.
    pub fn surviving_keys(&self) -> Vec<(HookCondition, String)> {
        self.recreated
            .iter()
            .chain(&self.unchanged)
            .chain(self.skipped.iter().map(|(h, _)| h))
            .map(|h| (h.condition.clone(), h.channel.clone()))
            .collect()
    }
}

/// Re-register every hook so its spawn command inherits `inherit_var`.
///
/// For each hook: remove it, then add it back with the same condition
/// (`--claim` for `claim_available`, `--mention` for `mention_received`),
/// channel, cwd and cooldown. Hooks of unknown condition type are skipped.
/// Individual failures are recorded, not propagated.
pub fn refresh_hooks(tools: &Toolbox<'_>, inherit_var: &str) -> Result<HookRefresh> {
    let hooks = tools.bus().hooks_list()?;
    let mut report = HookRefresh::default();

    for hook in hooks {
        if matches!(hook.condition, HookCondition::Unknown) {
            tracing::warn!(hook = %hook.id, "skipping hook with unknown condition type");
            report
                .skipped
                .push((hook, "unknown condition type".to_owned()));
            continue;
        }
        let Some(command) = with_inherited_env(&hook.command, inherit_var) else {
            if hook.command.iter().any(|a| a.contains(inherit_var)) {
                report.unchanged.push(hook);
            } else {
                report
                    .skipped
                    .push((hook, "command has no spawn step".to_owned()));
            }
            continue;
        };

        if let Err(e) = tools.bus().hooks_remove(&hook.id) {
            report.skipped.push((hook, format!("remove failed: {e}")));
            continue;
        }
        let updated = Hook {
            command,
            ..hook.clone()
        };
        match tools.bus().hooks_add(&updated) {
            Ok(_) => {
                tracing::info!(
                    hook = %hook.id,
                    condition = hook.condition.kind(),
                    channel = %hook.channel,
                    "hook re-registered"
                );
                report.recreated.push(updated);
            }
            Err(e) => {
                tracing::error!(hook = %hook.id, error = %e, "hook removed but not re-added");
                report.failed.push((hook, e.to_string()));
            }
        }
    }
    Ok(report)
}

//! The `.eval-env` file: the hand-off between setup, run and verify.
//!
//! Setup writes one `export KEY='value'` line per variable. The parser also
//! accepts bare `KEY=value`, double-quoted values, blank lines and `#`
//! comments so that a hand-edited file still loads. The file is parsed
//! into [`EvalEnv`]; nothing is pushed into the process environment.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{EvalError, Result};

/// File name written into the eval directory.
pub const ENV_FILE: &str = ".eval-env";

pub const EVAL_SCENARIO: &str = "EVAL_SCENARIO";
pub const EVAL_DIR: &str = "EVAL_DIR";
pub const BOTBUS_DATA_DIR: &str = "BOTBUS_DATA_DIR";
pub const PROJECT_DIR: &str = "PROJECT_DIR";
pub const PROJECT_NAME: &str = "PROJECT_NAME";
pub const CHANNEL: &str = "CHANNEL";
pub const TASK_ID: &str = "TASK_ID";
/// Second project's channel, for scenarios with a peer project.
pub const PEER_CHANNEL: &str = "PEER_CHANNEL";
pub const PEER_PROJECT_DIR: &str = "PEER_PROJECT_DIR";

/// Variable holding the agent name for `role`, e.g. `AGENT_DEV`.
pub fn agent_var(role: &str) -> String {
    format!("AGENT_{}", role.to_ascii_uppercase().replace('-', "_"))
}

/// Parsed `.eval-env` contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvalEnv {
    path: PathBuf,
    vars: BTreeMap<String, String>,
}

impl EvalEnv {
    /// An empty env that will be saved to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            vars: BTreeMap::new(),
        }
    }

    /// Read and parse an env file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let vars = parse(&text).map_err(|(line, detail)| EvalError::EnvFileSyntax {
            path: path.to_owned(),
            line,
            detail,
        })?;
        Ok(Self {
            path: path.to_owned(),
            vars,
        })
    }

    /// Write all variables as `export KEY='value'` lines.
    pub fn save(&self) -> Result<()> {
        std::fs::write(&self.path, self.render())?;
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# generated by evals setup\n");
        for (k, v) in &self.vars {
            let _ = writeln!(out, "export {k}={}", single_quote(v));
        }
        out
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// A variable that must be present.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| EvalError::MissingVar {
            path: self.path.clone(),
            key: key.to_owned(),
        })
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn eval_dir(&self) -> Result<PathBuf> {
        self.require(EVAL_DIR).map(PathBuf::from)
    }

    pub fn project_dir(&self) -> Result<PathBuf> {
        self.require(PROJECT_DIR).map(PathBuf::from)
    }

    pub fn bus_dir(&self) -> Result<PathBuf> {
        self.require(BOTBUS_DATA_DIR).map(PathBuf::from)
    }

    pub fn artifacts_dir(&self) -> Result<PathBuf> {
        Ok(self.eval_dir()?.join("artifacts"))
    }

    /// Agent name for `role`.
    pub fn agent(&self, role: &str) -> Result<&str> {
        self.require(&agent_var(role))
    }
}

fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parse env-file text into a map. Errors carry the 1-based line number.
pub fn parse(text: &str) -> std::result::Result<BTreeMap<String, String>, (usize, String)> {
    let mut vars = BTreeMap::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map_or(line, str::trim_start);
        let Some((key, value)) = line.split_once('=') else {
            return Err((line_no, format!("expected KEY=value, got {raw:?}")));
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err((line_no, format!("invalid variable name {key:?}")));
        }
        let value = unquote(value.trim()).map_err(|e| (line_no, e))?;
        vars.insert(key.to_owned(), value);
    }
    Ok(vars)
}

/// Undo shell quoting: `'...'` segments (with `'\''` escapes) and `"..."`
/// with backslash escapes. Unquoted text is taken literally.
fn unquote(value: &str) -> std::result::Result<String, String> {
    let mut out = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(ch) => out.push(ch),
                    None => return Err("unterminated single quote".to_owned()),
                }
            },
            '"' => loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(ch) => out.push(ch),
                        None => return Err("dangling backslash".to_owned()),
                    },
                    Some(ch) => out.push(ch),
                    None => return Err("unterminated double quote".to_owned()),
                }
            },
            '\\' => {
                if let Some(ch) = chars.next() {
                    out.push(ch);
                }
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_export_and_bare_lines() {
        let vars = parse(
            "# comment\n\nexport EVAL_DIR=/tmp/eval-1\nPROJECT_NAME=\"evalproj\"\nexport AGENT_DEV='eval-dev'\n",
        )
        .unwrap();
        assert_eq!(vars["EVAL_DIR"], "/tmp/eval-1");
        assert_eq!(vars["PROJECT_NAME"], "evalproj");
        assert_eq!(vars["AGENT_DEV"], "eval-dev");
    }

    #[test]
    fn save_then_load_preserves_awkward_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ENV_FILE);
        let mut env = EvalEnv::new(&path);
        env.set("NOTE", "it's \"quoted\" $HOME");
        env.set(EVAL_DIR, dir.path().display().to_string());
        env.save().unwrap();

        let loaded = EvalEnv::load(&path).unwrap();
        assert_eq!(loaded.get("NOTE"), Some("it's \"quoted\" $HOME"));
        assert_eq!(loaded.eval_dir().unwrap(), dir.path());
        assert_eq!(loaded.artifacts_dir().unwrap(), dir.path().join("artifacts"));
    }

    #[test]
    fn missing_var_is_reported() {
        let env = EvalEnv::new("/tmp/.eval-env");
        let err = env.require(TASK_ID).unwrap_err();
        assert!(err.to_string().contains("TASK_ID"));
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let (line, detail) = parse("A=1\nnot a var\n").unwrap_err();
        assert_eq!(line, 2);
        assert!(detail.contains("KEY=value"));

        let (line, _) = parse("A='open\n").unwrap_err();
        assert_eq!(line, 1);
    }

    #[test]
    fn agent_var_names() {
        assert_eq!(agent_var("dev"), "AGENT_DEV");
        assert_eq!(agent_var("other-lead"), "AGENT_OTHER_LEAD");
    }
}

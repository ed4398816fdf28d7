//! Throwaway project fixtures.
//!
//! A fixture is a handful of literal files: a `Cargo.toml`, stub modules
//! with `todo!()` markers for the agent to fill in, and sample data. Setup
//! writes them under the eval directory, checks that the skeleton compiles,
//! and puts it under version control so agents can create workspaces.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::error::{EvalError, Result};
use crate::tools::Toolbox;
use crate::tools::maw::DEFAULT_WORKSPACE;

/// Placeholder replaced with the project name when a seed file is written.
pub const PROJECT_NAME_PLACEHOLDER: &str = "{{PROJECT_NAME}}";

/// A file to seed into the project before the agent starts.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct SeedFile {
    /// Path relative to the project root (e.g. `src/lib.rs`).
    pub path: &'static str,
    pub content: &'static str,
}

/// How the project is put under version control.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Vcs {
    /// `maw init`
    #[default]
    Maw,
    /// `jj git init`
    Jj,
    /// Leave the directory alone.
    None,
}

/// A complete seed project.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ProjectFixture {
    /// Directory name, also used as the bus channel.
    pub name: &'static str,
    pub files: &'static [SeedFile],
    /// Run `cargo check` after writing.
    pub build_check: bool,
    pub vcs: Vcs,
}

pub(crate) fn check_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    let plain = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if plain {
        Ok(())
    } else {
        Err(EvalError::FixturePath {
            path: path.to_owned(),
        })
    }
}

/// Write every file of `fixture` under `<root>/<fixture.name>/`.
///
/// Returns the project directory. Paths are validated before anything is
/// written, so a bad fixture leaves no partial tree behind.
pub fn write_fixture(root: &Path, fixture: &ProjectFixture) -> Result<PathBuf> {
    check_relative(fixture.name)?;
    for file in fixture.files {
        check_relative(file.path)?;
    }

    let project = root.join(fixture.name);
    std::fs::create_dir_all(&project)?;
    for file in fixture.files {
        let dest = project.join(file.path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = file.content.replace(PROJECT_NAME_PLACEHOLDER, fixture.name);
        std::fs::write(&dest, content)?;
    }
    tracing::debug!(project = %project.display(), files = fixture.files.len(), "fixture written");
    Ok(project)
}

/// Confirm the skeleton compiles and initialise version control.
///
/// Any non-zero exit is an error; setup treats it as fatal.
pub fn verify_builds(tools: &Toolbox<'_>, fixture: &ProjectFixture) -> Result<()> {
    let bins = tools.bins();
    if fixture.build_check {
        let cmd = tools.command(&bins.cargo).args(["check", "--quiet"]);
        tools.runner().run_ok(&cmd)?;
    }
    match fixture.vcs {
        Vcs::Maw => tools.maw().init()?,
        Vcs::Jj => {
            let cmd = tools.command(&bins.jj).args(["git", "init"]);
            tools.runner().run_ok(&cmd)?;
        }
        Vcs::None => {}
    }
    Ok(())
}

/// Directory holding the project's working files: `ws/default/` once maw
/// manages the repo, the project root otherwise.
pub fn checkout_dir(project: &Path) -> PathBuf {
    let ws = project.join("ws").join(DEFAULT_WORKSPACE);
    if ws.is_dir() {
        ws
    } else {
        project.to_owned()
    }
}

/// Count `todo!()` markers left in the project's Rust sources.
pub fn count_todos(project: &Path) -> Result<usize> {
    fn walk(dir: &Path, total: &mut usize) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            if name == "target" || name == "ws" || name.to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type()?.is_dir() {
                walk(&path, total)?;
            } else if path.extension().is_some_and(|e| e == "rs") {
                *total += std::fs::read_to_string(&path)?.matches("todo!(").count();
            }
        }
        Ok(())
    }

    let mut total = 0;
    walk(&checkout_dir(project), &mut total)?;
    Ok(total)
}

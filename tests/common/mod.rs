//! Shared test helpers for evals integration tests.
//!
//! Nothing here touches the real bus, task tracker or agents: the binary is
//! only run for commands that need no external tools, and the phase tests
//! drive the library through a [`ScriptedRunner`].

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use evals::env_file::{self, EvalEnv};
use evals::tools::ToolOutput;
use evals::tools::fake::ScriptedRunner;

/// Run the evals binary with the given args in the given directory.
pub fn evals_in(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_evals"))
        .args(args)
        .current_dir(dir)
        .env_remove("EVALS_CONFIG")
        .env_remove("EVALS_MODEL")
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT")
        .env_remove("TRACEPARENT")
        .output()
        .expect("failed to execute evals")
}

/// Run evals and assert it succeeds. Returns stdout as string.
pub fn evals_ok(dir: &Path, args: &[&str]) -> String {
    let out = evals_in(dir, args);
    let stderr = String::from_utf8_lossy(&out.stderr);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        out.status.success(),
        "evals {} failed:\nstdout: {stdout}\nstderr: {stderr}",
        args.join(" "),
    );
    stdout.to_string()
}

/// Write an `.eval-env` for `scenario` rooted at `dir`, plus the given
/// artifact files. Returns the env file path.
pub fn fabricate_eval(dir: &Path, scenario: &str, artifacts: &[(&str, &str)]) -> PathBuf {
    let mut env = EvalEnv::new(dir.join(env_file::ENV_FILE));
    env.set(env_file::EVAL_SCENARIO, scenario);
    env.set(env_file::EVAL_DIR, dir.display().to_string());
    env.set(env_file::BOTBUS_DATA_DIR, dir.join("bus").display().to_string());
    env.save().expect("failed to write env file");

    let root = env.artifacts_dir().unwrap();
    for (name, content) in artifacts {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    std::fs::create_dir_all(root).unwrap();
    env.path().to_owned()
}

/// A solved `csvstats/src/lib.rs` as a worker would leave it.
pub const SOLVED_CSVSTATS: &str = "\
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    #[test]
    fn mean_of_two() {
        assert_eq!(super::mean(&[1.0, 3.0]), Some(2.0));
    }
}
";

/// Artifacts of a worker-loop run that did everything right.
pub fn passing_worker_loop() -> Vec<(&'static str, &'static str)> {
    vec![
        ("task.json", r#"{"id":"bd-1","status":"closed"}"#),
        ("source/csvstats/src/lib.rs", SOLVED_CSVSTATS),
        ("test-output.txt", "running 3 tests\ntest result: ok. 3 passed; 0 failed\nexit: 0\n"),
        ("channel-history.txt", "eval-dev-x: Completed bd-1: mean and median\n"),
        ("workspaces.json", r#"[{"name": "default", "is_default": true}]"#),
        ("claims.json", "[]"),
    ]
}

/// A runner that answers every command setup and run issue.
///
/// Task status goes open, in progress, closed; tests pass.
pub fn scripted_tools() -> ScriptedRunner {
    let runner = ScriptedRunner::new()
        .on("cargo", &["check"], ToolOutput::ok(""))
        .on(
            "cargo",
            &["test"],
            ToolOutput::ok("test result: ok. 4 passed; 0 failed\n"),
        )
        .on("maw", &["init"], ToolOutput::ok(""))
        .on("jj", &["git", "init"], ToolOutput::ok(""))
        .on("maw", &["ws", "list"], ToolOutput::ok(r#"[{"name":"default","is_default":true}]"#))
        .on("bus", &["init"], ToolOutput::ok(""))
        .on("bus", &["send"], ToolOutput::ok(""))
        .on("bus", &["hooks", "list"], ToolOutput::ok("[]"))
        .on("bus", &["hooks", "add"], ToolOutput::ok(""))
        .on("bus", &["claims", "list"], ToolOutput::ok("[]"))
        .on(
            "bus",
            &["history"],
            ToolOutput::ok("eval-dev: Completed bd-1: implemented\n"),
        )
        .on("botty", &["list"], ToolOutput::ok("[]"))
        .on("maw", &["exec", "default", "--", "br", "init"], ToolOutput::ok(""))
        .on(
            "maw",
            &["exec", "default", "--", "br", "create"],
            ToolOutput::ok(r#"{"id":"bd-1","status":"open"}"#),
        );
    runner.respond(
        "maw",
        &["exec", "default", "--", "br", "show"],
        [
            ToolOutput::ok(r#"{"id":"bd-1","status":"open"}"#),
            ToolOutput::ok(r#"{"id":"bd-1","status":"in_progress"}"#),
            ToolOutput::ok(r#"{"id":"bd-1","status":"closed"}"#),
        ],
    );
    runner
}

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use evals::config::{EvalConfig, RunnerKind};
use evals::tools::{ToolCommand, ToolRunner};

use crate::format::OutputFormat;

#[derive(Serialize)]
struct DoctorEnvelope {
    checks: Vec<DoctorCheck>,
    all_ok: bool,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fix: Option<String>,
}

fn print_check(check: &DoctorCheck) {
    let prefix = match check.status.as_str() {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "fail" => "[FAIL]",
        _ => "[???]",
    };
    println!("{} {}", prefix, check.message);
    if let Some(fix) = &check.fix {
        println!("       {fix}");
    }
}

/// Check that every external tool an eval drives is installed.
pub fn run(
    runner: &dyn ToolRunner,
    config_path: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let checks = collect(runner, config_path);
    let all_ok = checks.iter().all(|c| c.status != "fail");

    match format {
        OutputFormat::Json => {
            println!("{}", OutputFormat::json(&DoctorEnvelope { checks, all_ok })?);
        }
        OutputFormat::Text => {
            println!("evals doctor");
            println!("============");
            println!();

            for check in &checks {
                print_check(check);
            }

            println!();
            if all_ok {
                println!("All checks passed!");
            } else {
                println!("Some checks failed. See above for details.");
            }
        }
    }

    Ok(())
}

fn collect(runner: &dyn ToolRunner, config_path: Option<&Path>) -> Vec<DoctorCheck> {
    let (config, mut checks) = match EvalConfig::resolve(config_path) {
        Ok(cfg) => (
            cfg,
            vec![DoctorCheck {
                name: "config".to_owned(),
                status: "ok".to_owned(),
                message: "config: loaded".to_owned(),
                fix: None,
            }],
        ),
        Err(e) => (
            EvalConfig::default(),
            vec![DoctorCheck {
                name: "config".to_owned(),
                status: "fail".to_owned(),
                message: format!("config: {e}"),
                fix: Some("Fix the file, or delete it to use defaults".to_owned()),
            }],
        ),
    };

    let tools = &config.tools;
    let mut required = vec![
        (tools.bus.as_str(), "https://github.com/bobisme/botbus"),
        (tools.tasks.as_str(), "https://github.com/Dicklesworthstone/beads_rust"),
        (tools.maw.as_str(), "https://github.com/bobisme/maw"),
        (tools.crit.as_str(), "https://github.com/bobisme/crit"),
        (tools.botty.as_str(), "https://github.com/bobisme/botty"),
        (tools.cargo.as_str(), "https://rustup.rs"),
    ];
    required.push(match config.agent.runner {
        RunnerKind::Botbox => (tools.botbox.as_str(), "https://github.com/bobisme/botbox"),
        RunnerKind::Claude => (
            tools.claude.as_str(),
            "https://docs.anthropic.com/en/docs/claude-code",
        ),
    });
    for (bin, url) in required {
        checks.push(check_tool(runner, bin, url, "fail"));
    }
    // Only needed for fixtures that opt out of maw.
    checks.push(check_tool(
        runner,
        &tools.jj,
        "https://martinvonz.github.io/jj/latest/install-and-setup/",
        "warn",
    ));
    checks
}

fn check_tool(
    runner: &dyn ToolRunner,
    name: &str,
    install_url: &str,
    missing: &str,
) -> DoctorCheck {
    match runner.run(&ToolCommand::new(name).arg("--version")) {
        Ok(output) if output.success() => {
            let version = output.stdout.lines().next().unwrap_or("unknown").trim();
            DoctorCheck {
                name: name.to_owned(),
                status: "ok".to_owned(),
                message: format!("{name}: {version}"),
                fix: None,
            }
        }
        Ok(_) => DoctorCheck {
            name: name.to_owned(),
            status: missing.to_owned(),
            message: format!("{name}: found but returned error"),
            fix: Some(format!("Install: {install_url}")),
        },
        Err(_) => DoctorCheck {
            name: name.to_owned(),
            status: missing.to_owned(),
            message: format!("{name}: not found"),
            fix: Some(format!("Install: {install_url}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use evals::tools::ToolOutput;
    use evals::tools::fake::ScriptedRunner;

    use super::*;

    #[test]
    fn reports_versions_and_failures() {
        let runner = ScriptedRunner::new()
            .on("bus", &["--version"], ToolOutput::ok("bus 0.9.1\n"))
            .on("maw", &["--version"], ToolOutput::ok("maw 0.47.0"))
            .on("crit", &["--version"], ToolOutput::failed(2, "boom"));
        let dir = tempfile::tempdir().unwrap();
        let checks = collect(&runner, Some(&dir.path().join("evals.toml")));

        let by_name = |n: &str| checks.iter().find(|c| c.name == n).unwrap();
        assert_eq!(by_name("config").status, "ok");
        assert_eq!(by_name("bus").message, "bus: 0.9.1");
        assert_eq!(by_name("maw").status, "ok");
        assert_eq!(by_name("crit").message, "crit: found but returned error");
        // Unscripted commands exit 127.
        assert_eq!(by_name("botbox").status, "fail");
        assert_eq!(by_name("jj").status, "warn");
    }

    #[test]
    fn bad_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evals.toml");
        std::fs::write(&path, "[poll]\nbogus = 1\n").unwrap();
        let checks = collect(&ScriptedRunner::new(), Some(&path));
        assert_eq!(checks[0].status, "fail");
    }
}

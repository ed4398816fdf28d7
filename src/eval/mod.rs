//! Eval orchestration.
//!
//! An eval goes through three phases, each reading the `.eval-env` the
//! previous one left behind:
//!
//! 1. [`setup`]: write fixtures, initialise the isolated bus, name the
//!    agents, seed the task. Fatal on any error.
//! 2. [`run()`]: spawn the agents, poll until done or timed out, capture
//!    artifacts. Phase failures are recorded, never fatal.
//! 3. [`verify`]: score the captured artifacts. Never fails on check
//!    outcomes.
//!
//! [`eval`] chains all three.

pub mod run;
pub mod scenarios;
pub mod setup;

use std::path::Path;

use rand::Rng;
use serde::Serialize;

pub use run::{RunReport, run};
pub use setup::setup;

use crate::artifacts::ArtifactSet;
use crate::config::EvalConfig;
use crate::env_file::{self, EvalEnv};
use crate::error::Result;
use crate::poll::Clock;
use crate::registrar::{self, HookRefresh};
use crate::tools::{ToolRunner, Toolbox};
use crate::verify::Scorecard;
use scenarios::Scenario;

/// Score the artifacts captured for `env` and write `scorecard.json`.
///
/// Only an unreadable artifacts directory (or a broken env) is an error.
pub fn verify(env: &EvalEnv, config: &EvalConfig) -> Result<Scorecard> {
    let scenario = scenarios::find(env.require(env_file::EVAL_SCENARIO)?)?;
    let dir = env.artifacts_dir()?;
    let artifacts = ArtifactSet::load(&dir)?;
    let card = Scorecard::evaluate(
        scenario.name,
        scenario.checks,
        scenario.criticals,
        &artifacts,
        config.scoring.pass_pct,
    );
    if let Err(e) = card.write(&dir) {
        tracing::warn!(error = %e, "could not write scorecard");
    }
    Ok(card)
}

/// Result of a full setup + run + verify.
#[derive(Debug, Serialize)]
pub struct EvalOutcome {
    pub env_file: std::path::PathBuf,
    pub run: RunReport,
    pub scorecard: Scorecard,
}

/// Setup, run and verify `scenario` in one go.
pub fn eval<R: Rng + ?Sized>(
    runner: &dyn ToolRunner,
    scenario: &Scenario,
    config: &EvalConfig,
    dir: Option<&Path>,
    rng: &mut R,
    clock: &mut dyn Clock,
) -> Result<EvalOutcome> {
    let env = setup(runner, scenario, config, dir, rng)?;
    let report = run(runner, &env, config, clock)?;
    let scorecard = verify(&env, config)?;
    Ok(EvalOutcome {
        env_file: env.path().to_owned(),
        run: report,
        scorecard,
    })
}

/// Re-register the eval's bus hooks so spawned agents inherit `inherit_var`.
pub fn refresh_hooks(
    runner: &dyn ToolRunner,
    env: &EvalEnv,
    config: &EvalConfig,
    inherit_var: &str,
) -> Result<HookRefresh> {
    let tools = Toolbox::new(runner, config.tools.clone(), env.project_dir()?)
        .with_env(env_file::BOTBUS_DATA_DIR, env.require(env_file::BOTBUS_DATA_DIR)?);
    registrar::refresh_hooks(&tools, inherit_var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{TASK_JSON, TEST_OUTPUT};
    use crate::verify::{SCORECARD_FILE, Verdict};

    fn env_for(dir: &Path, scenario: &str) -> EvalEnv {
        let mut env = EvalEnv::new(dir.join(env_file::ENV_FILE));
        env.set(env_file::EVAL_SCENARIO, scenario);
        env.set(env_file::EVAL_DIR, dir.display().to_string());
        env
    }

    #[test]
    fn verify_scores_and_writes_scorecard() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_for(dir.path(), "worker-loop");
        let artifacts = env.artifacts_dir().unwrap();
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(artifacts.join(TASK_JSON), r#"{"id":"bd-1","status":"closed"}"#).unwrap();
        std::fs::write(artifacts.join(TEST_OUTPUT), "test result: ok. 3 passed\nexit: 0\n").unwrap();

        let card = verify(&env, &EvalConfig::default()).unwrap();
        assert!(card.awarded > 0);
        assert!(card.awarded < card.total);
        assert!(artifacts.join(SCORECARD_FILE).is_file());

        let again = verify(&env, &EvalConfig::default()).unwrap();
        assert_eq!(again.verdict, card.verdict);
        assert_eq!(again.awarded, card.awarded);
    }

    #[test]
    fn verify_without_artifacts_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_for(dir.path(), "worker-loop");
        assert!(verify(&env, &EvalConfig::default()).is_err());
    }

    #[test]
    fn empty_artifacts_fail_without_critical() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_for(dir.path(), "worker-loop");
        std::fs::create_dir_all(env.artifacts_dir().unwrap()).unwrap();
        let card = verify(&env, &EvalConfig::default()).unwrap();
        assert_eq!(card.verdict, Verdict::Fail);
    }
}

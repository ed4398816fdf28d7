//! setup -> run -> verify through the library with scripted tools.

mod common;

use rand::SeedableRng as _;
use rand::rngs::StdRng;

use common::{SOLVED_CSVSTATS, scripted_tools};
use evals::config::EvalConfig;
use evals::env_file::{self, EvalEnv};
use evals::eval::{self, scenarios};
use evals::fixture;
use evals::poll::{ManualClock, PollState};
use evals::tools::ToolOutput;
use evals::tools::fake::FakeProcess;
use evals::verify::Verdict;

fn config() -> EvalConfig {
    let mut cfg = EvalConfig::default();
    cfg.poll.interval_secs = 30;
    cfg.poll.overall_timeout_secs = 600;
    cfg
}

#[test]
fn worker_loop_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let runner = scripted_tools();
    let scenario = scenarios::find("worker-loop").unwrap();
    let config = config();

    let env = eval::setup(
        &runner,
        &scenario,
        &config,
        Some(dir.path()),
        &mut StdRng::seed_from_u64(11),
    )
    .unwrap();
    assert_eq!(env.get(env_file::TASK_ID), Some("bd-1"));

    // What the agent would have done.
    let checkout = fixture::checkout_dir(&env.project_dir().unwrap());
    std::fs::write(checkout.join("src/lib.rs"), SOLVED_CSVSTATS).unwrap();
    runner.queue_spawn(FakeProcess::exits_after(100, 2));

    let env = EvalEnv::load(env.path()).unwrap();
    let report = eval::run(&runner, &env, &config, &mut ManualClock::new()).unwrap();
    assert!(report.failed_phases.is_empty(), "{:?}", report.failed_phases);
    assert_eq!(report.poll.as_ref().unwrap().state, PollState::Completed);
    assert_eq!(report.todos_remaining, Some(0));

    let spawned = runner.spawned();
    assert_eq!(spawned.len(), 1);
    let prompt = spawned[0]
        .args
        .iter()
        .find(|a| a.contains("Protocol:"))
        .expect("prompt passed to the runner");
    assert!(prompt.contains("bd-1"));
    assert!(!prompt.contains("{{"));

    let card = eval::verify(&env, &config).unwrap();
    assert_eq!(card.verdict, Verdict::Pass, "{}", card.render_text());
    assert_eq!(card.awarded, card.total);
}

#[test]
fn timeout_still_produces_a_scorecard() {
    let dir = tempfile::tempdir().unwrap();
    let runner = scripted_tools();
    let scenario = scenarios::find("worker-loop").unwrap();
    let config = config();
    let env = eval::setup(
        &runner,
        &scenario,
        &config,
        Some(dir.path()),
        &mut StdRng::seed_from_u64(2),
    )
    .unwrap();

    // Task never leaves in_progress; the agent never exits.
    runner.respond(
        "maw",
        &["exec", "default", "--", "br", "show"],
        [ToolOutput::ok(r#"{"id":"bd-1","status":"in_progress"}"#)],
    );
    let agent = FakeProcess::running(7);
    runner.queue_spawn(agent.clone());

    let report = eval::run(&runner, &env, &config, &mut ManualClock::new()).unwrap();
    let poll = report.poll.as_ref().unwrap();
    assert_eq!(poll.state, PollState::Timeout);
    assert!(agent.was_killed());

    let artifacts = env.artifacts_dir().unwrap();
    for name in ["task.json", "channel-history.txt", "claims.json", "capture.json", "run.json"] {
        assert!(artifacts.join(name).is_file(), "{name} not written");
    }

    let card = eval::verify(&env, &config).unwrap();
    assert_ne!(card.verdict, Verdict::Pass);
}

#[test]
fn untouched_api_is_a_critical_failure() {
    let dir = tempfile::tempdir().unwrap();
    let runner = scripted_tools();
    let scenario = scenarios::find("api-redaction").unwrap();
    let config = config();

    let outcome = eval::eval(
        &runner,
        &scenario,
        &config,
        Some(dir.path()),
        &mut StdRng::seed_from_u64(3),
        &mut ManualClock::new(),
    )
    .unwrap();

    assert_eq!(outcome.scorecard.verdict, Verdict::CriticalFail);
    assert!(outcome.scorecard.criticals.iter().any(|c| c.triggered));
    assert!(outcome.env_file.is_file());
}

#[test]
fn cross_project_captures_the_peer_channel() {
    let dir = tempfile::tempdir().unwrap();
    let runner = scripted_tools();
    runner.respond(
        "bus",
        &["history", "libcore"],
        [ToolOutput::ok(
            "eval-dev: @eval-peer-lead normalize_id only trims leading whitespace\n",
        )],
    );
    let scenario = scenarios::find("cross-project").unwrap();
    let config = config();

    let outcome = eval::eval(
        &runner,
        &scenario,
        &config,
        Some(dir.path()),
        &mut StdRng::seed_from_u64(4),
        &mut ManualClock::new(),
    )
    .unwrap();

    let artifacts = dir.path().join("artifacts");
    let peer = std::fs::read_to_string(artifacts.join("channel-libcore.txt")).unwrap();
    assert!(peer.contains("normalize_id"));
    let report = outcome
        .scorecard
        .criticals
        .iter()
        .find(|c| c.label == "no report sent to #libcore")
        .unwrap();
    assert!(!report.triggered);
}

//! The poll loop: wait for an agent run to finish.
//!
//! Each tick checks the wall-clock budget, then asks the [`Observer`] for
//! the task status and worker liveness:
//!
//! ```text
//!            elapsed >= timeout             status is terminal
//!  Timeout <--------------------- Running ----------------------> Completed
//!                                    |                               |
//!                                    | worker gone, task not done    | grace: wait for
//!                                    v                               v worker exit
//!                               WorkerExited
//! ```
//!
//! The timeout check comes first on every tick and sleeps are capped at the
//! remaining budget, so the loop always ends within
//! `overall_timeout + interval`. Idle time (no `Active` status seen) only
//! produces a warning.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::PollConfig;
use crate::error::Result;
use crate::spawner::AgentProcess;
use crate::tools::Toolbox;
use crate::tools::tasks::TaskStatus;

/// How often the grace period re-checks liveness.
const GRACE_STEP: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Source of time. Real runs sleep; tests advance a counter.
pub trait Clock {
    /// Time since the clock was created.
    fn elapsed(&self) -> Duration;
    fn sleep(&mut self, duration: Duration);
}

/// Wall clock.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time instantly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Duration,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            now: Duration::ZERO,
        }
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.now
    }

    fn sleep(&mut self, duration: Duration) {
        self.now += duration;
    }
}

/// What the loop polls.
pub trait Observer {
    /// Current status of the tracked work item.
    fn task_status(&mut self) -> Result<TaskStatus>;

    /// Whether the worker is still running.
    fn worker_alive(&mut self) -> bool;
}

// ---------------------------------------------------------------------------
// State / outcome
// ---------------------------------------------------------------------------

/// Poll loop state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollState {
    Running,
    Completed,
    WorkerExited,
    Timeout,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::WorkerExited => write!(f, "worker-exited"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Timing parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub overall_timeout: Duration,
    pub idle_warn: Duration,
    pub grace: Duration,
}

impl From<&PollConfig> for PollSettings {
    fn from(cfg: &PollConfig) -> Self {
        Self {
            interval: cfg.interval(),
            overall_timeout: cfg.overall_timeout(),
            idle_warn: cfg.idle_warn(),
            grace: cfg.grace(),
        }
    }
}

/// Result of a poll run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PollOutcome {
    /// Terminal state; never [`PollState::Running`].
    pub state: PollState,
    /// Time at which the state was decided.
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub ticks: u32,
    pub last_status: TaskStatus,
    /// After `Completed`: did the worker exit within the grace period?
    pub worker_exited_in_grace: Option<bool>,
    pub idle_warnings: u32,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Poll until completion, worker exit, or timeout.
pub fn poll_until_done(
    observer: &mut dyn Observer,
    clock: &mut dyn Clock,
    settings: &PollSettings,
) -> PollOutcome {
    let mut ticks = 0u32;
    let mut last_status = TaskStatus::Unknown;
    let mut last_active = clock.elapsed();
    let mut idle_warned = false;
    let mut idle_warnings = 0u32;

    let (state, elapsed) = loop {
        let now = clock.elapsed();
        if now >= settings.overall_timeout {
            tracing::warn!(elapsed = ?now, ticks, "overall timeout reached");
            break (PollState::Timeout, now);
        }
        ticks += 1;

        match observer.task_status() {
            Ok(status) => {
                if status != last_status {
                    tracing::info!(%status, elapsed = ?now, "task status changed");
                }
                last_status = status;
                if status == TaskStatus::Active {
                    last_active = now;
                    idle_warned = false;
                }
                if status.is_terminal() {
                    break (PollState::Completed, now);
                }
            }
            Err(e) => tracing::warn!(error = %e, "status query failed; treating as no change"),
        }

        if !observer.worker_alive() {
            tracing::warn!(%last_status, "worker exited before the task was done");
            break (PollState::WorkerExited, now);
        }

        let idle = now.saturating_sub(last_active);
        if idle > settings.idle_warn && !idle_warned {
            tracing::warn!(idle = ?idle, %last_status, "no activity observed; agent may be stuck");
            idle_warned = true;
            idle_warnings += 1;
        }

        let remaining = settings.overall_timeout.saturating_sub(now);
        clock.sleep(settings.interval.min(remaining));
    };

    let worker_exited_in_grace = (state == PollState::Completed)
        .then(|| await_exit(observer, clock, settings.grace));

    PollOutcome {
        state,
        elapsed,
        ticks,
        last_status,
        worker_exited_in_grace,
        idle_warnings,
    }
}

/// Wait up to `grace` for the worker to exit. Returns whether it did.
pub fn await_exit(observer: &mut dyn Observer, clock: &mut dyn Clock, grace: Duration) -> bool {
    let start = clock.elapsed();
    loop {
        if !observer.worker_alive() {
            return true;
        }
        let waited = clock.elapsed().saturating_sub(start);
        if waited >= grace {
            tracing::warn!(grace = ?grace, "worker still running after grace period");
            return false;
        }
        clock.sleep(GRACE_STEP.min(grace - waited));
    }
}

// ---------------------------------------------------------------------------
// Live observer
// ---------------------------------------------------------------------------

/// What counts as "the work is done".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollTarget {
    /// A task reaching closed/done.
    Task(String),
    /// A task reaching closed/done after the newest crit review has
    /// settled (merged or abandoned). The review alone never completes it.
    ReviewedTask(String),
}

/// Observer backed by the external tools and the spawned processes.
pub struct LiveObserver<'t, 'p> {
    tools: &'t Toolbox<'t>,
    target: PollTarget,
    processes: &'p mut [AgentProcess],
    /// botty ids (or id prefixes) that count as workers.
    botty_workers: Vec<String>,
}

impl<'t, 'p> LiveObserver<'t, 'p> {
    pub fn new(
        tools: &'t Toolbox<'t>,
        target: PollTarget,
        processes: &'p mut [AgentProcess],
        botty_workers: Vec<String>,
    ) -> Self {
        Self {
            tools,
            target,
            processes,
            botty_workers,
        }
    }
}

impl Observer for LiveObserver<'_, '_> {
    fn task_status(&mut self) -> Result<TaskStatus> {
        match &self.target {
            PollTarget::Task(id) => Ok(self.tools.tasks().status(id)?),
            PollTarget::ReviewedTask(id) => {
                let task = self.tools.tasks().status(id)?;
                if task != TaskStatus::Done {
                    return Ok(task);
                }
                Ok(match self.tools.crit().latest_status()? {
                    Some((_, review)) if review.is_terminal() => TaskStatus::Done,
                    // Closed before its review settled: still in progress.
                    _ => TaskStatus::Active,
                })
            }
        }
    }

    fn worker_alive(&mut self) -> bool {
        if self.processes.iter_mut().any(AgentProcess::is_alive) {
            return true;
        }
        if self.botty_workers.is_empty() {
            return false;
        }
        match self.tools.botty().list() {
            Ok(agents) => agents.iter().any(|a| {
                self.botty_workers
                    .iter()
                    .any(|w| a.id.starts_with(w.as_str()))
                    && !matches!(a.status.as_deref(), Some("exited" | "dead" | "stopped"))
            }),
            Err(e) => {
                tracing::debug!(error = %e, "botty list failed; assuming no hook-spawned workers");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::error::EvalError;

    /// Scripted observer: one status per tick (last repeats), worker alive
    /// for a fixed number of liveness checks.
    struct Script {
        statuses: VecDeque<Result<TaskStatus>>,
        alive_checks: Option<u32>,
        checks: u32,
    }

    impl Script {
        fn new(statuses: Vec<TaskStatus>, alive_checks: Option<u32>) -> Self {
            Self {
                statuses: statuses.into_iter().map(Ok).collect(),
                alive_checks,
                checks: 0,
            }
        }
    }

    impl Observer for Script {
        fn task_status(&mut self) -> Result<TaskStatus> {
            if self.statuses.len() > 1 {
                self.statuses.pop_front().unwrap_or(Ok(TaskStatus::Unknown))
            } else {
                match self.statuses.front() {
                    Some(Ok(s)) => Ok(*s),
                    _ => Err(EvalError::PromptVars { missing: vec![] }),
                }
            }
        }

        fn worker_alive(&mut self) -> bool {
            self.checks += 1;
            self.alive_checks.is_none_or(|n| self.checks <= n)
        }
    }

    fn settings() -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(300),
            idle_warn: Duration::from_secs(90),
            grace: Duration::from_secs(15),
        }
    }

    #[test]
    fn completes_when_task_is_done() {
        use TaskStatus::{Active, Done, Open};
        let mut obs = Script::new(vec![Open, Active, Active, Done], Some(5));
        let mut clock = ManualClock::new();
        let out = poll_until_done(&mut obs, &mut clock, &settings());
        assert_eq!(out.state, PollState::Completed);
        assert_eq!(out.ticks, 4);
        assert_eq!(out.elapsed, Duration::from_secs(90));
        assert_eq!(out.last_status, Done);
        assert_eq!(out.worker_exited_in_grace, Some(true));
    }

    #[test]
    fn grace_period_reports_lingering_worker() {
        let mut obs = Script::new(vec![TaskStatus::Done], None);
        let mut clock = ManualClock::new();
        let out = poll_until_done(&mut obs, &mut clock, &settings());
        assert_eq!(out.state, PollState::Completed);
        assert_eq!(out.worker_exited_in_grace, Some(false));
        assert_eq!(clock.elapsed(), Duration::from_secs(15));
    }

    #[test]
    fn worker_exit_without_completion() {
        let mut obs = Script::new(vec![TaskStatus::Active], Some(2));
        let mut clock = ManualClock::new();
        let out = poll_until_done(&mut obs, &mut clock, &settings());
        assert_eq!(out.state, PollState::WorkerExited);
        assert_eq!(out.ticks, 3);
        assert_eq!(out.worker_exited_in_grace, None);
    }

    #[test]
    fn times_out_when_never_terminal() {
        let mut obs = Script::new(vec![TaskStatus::Active], None);
        let mut clock = ManualClock::new();
        let out = poll_until_done(&mut obs, &mut clock, &settings());
        assert_eq!(out.state, PollState::Timeout);
        assert_eq!(out.elapsed, Duration::from_secs(300));
        assert_eq!(out.ticks, 10);
    }

    #[test]
    fn timeout_wins_over_late_completion() {
        let s = PollSettings {
            overall_timeout: Duration::from_secs(45),
            ..settings()
        };
        use TaskStatus::{Active, Done};
        let mut obs = Script::new(vec![Active, Active, Done], None);
        let mut clock = ManualClock::new();
        let out = poll_until_done(&mut obs, &mut clock, &s);
        assert_eq!(out.state, PollState::Timeout);
        assert_eq!(out.elapsed, Duration::from_secs(45));
    }

    #[test]
    fn idle_warning_fires_once_per_stretch() {
        use TaskStatus::{Active, Open};
        // Idle until 150s, active once, then idle until the timeout.
        let mut statuses = vec![Open; 5];
        statuses.push(Active);
        statuses.extend(vec![Open; 5]);
        let mut obs = Script::new(statuses, None);
        let mut clock = ManualClock::new();
        let out = poll_until_done(&mut obs, &mut clock, &settings());
        assert_eq!(out.state, PollState::Timeout);
        assert_eq!(out.idle_warnings, 2);
    }

    #[test]
    fn status_errors_are_not_fatal() {
        let mut obs = Script {
            statuses: VecDeque::from(vec![Err(EvalError::PromptVars { missing: vec![] })]),
            alive_checks: Some(1),
            checks: 0,
        };
        let mut clock = ManualClock::new();
        let out = poll_until_done(&mut obs, &mut clock, &settings());
        assert_eq!(out.state, PollState::WorkerExited);
        assert_eq!(out.last_status, TaskStatus::Unknown);
    }

    fn reviewed_task_status(task: &str, review: Option<&str>) -> TaskStatus {
        use crate::config::ToolsConfig;
        use crate::tools::ToolOutput;
        use crate::tools::fake::ScriptedRunner;

        let bins = ToolsConfig {
            via_maw: false,
            ..ToolsConfig::default()
        };
        let listing = if review.is_some() { r#"[{"review_id":"cr-1"}]"# } else { "[]" };
        let runner = ScriptedRunner::new()
            .on("br", &["show", "bd-1"], ToolOutput::ok(format!(r#"{{"status":"{task}"}}"#)))
            .on("crit", &["reviews", "list"], ToolOutput::ok(listing))
            .on(
                "crit",
                &["review", "cr-1"],
                ToolOutput::ok(format!(r#"{{"status":"{}"}}"#, review.unwrap_or_default())),
            );
        let tools = Toolbox::new(&runner, bins, "/tmp/p");
        let mut processes: [AgentProcess; 0] = [];
        let mut observer = LiveObserver::new(
            &tools,
            PollTarget::ReviewedTask("bd-1".to_owned()),
            &mut processes,
            vec![],
        );
        observer.task_status().unwrap()
    }

    #[test]
    fn merged_review_waits_for_task_close() {
        assert_eq!(reviewed_task_status("in_progress", Some("merged")), TaskStatus::Active);
        assert_eq!(reviewed_task_status("closed", Some("merged")), TaskStatus::Done);
    }

    #[test]
    fn abandoned_review_is_settled() {
        assert_eq!(reviewed_task_status("closed", Some("abandoned")), TaskStatus::Done);
    }

    #[test]
    fn closed_task_with_open_review_keeps_polling() {
        assert_eq!(reviewed_task_status("closed", Some("approved")), TaskStatus::Active);
        assert_eq!(reviewed_task_status("closed", None), TaskStatus::Active);
        assert_eq!(reviewed_task_status("open", None), TaskStatus::Open);
    }

    #[test]
    fn poll_state_display() {
        assert_eq!(PollState::WorkerExited.to_string(), "worker-exited");
        assert_eq!(
            serde_json::to_value(PollState::WorkerExited).unwrap(),
            "worker-exited"
        );
    }
}

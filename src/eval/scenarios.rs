//! Scenario catalog.
//!
//! Each scenario is a static definition: the projects to seed, the agent
//! roles, the task to file, the prompts, what the poll loop waits on, and
//! the checks that score the captured artifacts. Scenarios are defined in
//! code, not loaded from files, so only `Serialize` is derived.
//!
//! Prompts are templates: `{{KEY}}` placeholders are filled from the
//! `.eval-env` at spawn time (see [`crate::spawner::render_prompt`]).

use serde::Serialize;

use crate::artifacts::{
    CHANNEL_HISTORY, CLAIMS_JSON, REVIEW_JSON, TASK_JSON, TEST_OUTPUT, WORKSPACES_JSON,
};
use crate::error::{EvalError, Result};
use crate::fixture::{ProjectFixture, SeedFile, Vcs};
use crate::verify::{Check, CriticalCheck, Predicate};

/// Total number of defined scenarios.
pub const SCENARIO_COUNT: usize = 4;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioId {
    /// One worker takes a task from claim to close.
    WorkerLoop,
    /// A dev and a hook-spawned reviewer go through a crit review.
    ReviewCycle,
    /// Remove a leaked field and a debug endpoint.
    ApiRedaction,
    /// Fix locally and report the root cause to another project.
    CrossProject,
}

/// How an agent role is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Launch {
    /// Spawned by the run phase.
    Direct,
    /// Spawned by a `mention_received` bus hook registered at setup.
    OnMention,
    /// Named and registered only; nothing runs as this identity.
    Idle,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Role {
    /// Role name; `AGENT_<NAME>` in the env file.
    pub name: &'static str,
    pub launch: Launch,
    /// Prompt template (empty for idle roles).
    pub prompt: &'static str,
}

/// The task filed before the agent starts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TaskSeed {
    pub title: &'static str,
    pub description: &'static str,
}

/// What the poll loop waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    /// The seeded task reaching closed/done.
    Task,
    /// The seeded task closed with the newest review merged or abandoned.
    ReviewedTask,
}

/// A project file copied into `artifacts/source/<project>/<path>`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Snapshot {
    pub project: &'static str,
    pub path: &'static str,
}

/// A complete scenario definition.
#[derive(Debug, Clone, Serialize)]
pub struct Scenario {
    pub id: ScenarioId,
    /// Name used on the command line.
    pub name: &'static str,
    pub description: &'static str,
    /// Seed projects; the first is the one the task lives in.
    pub fixtures: &'static [ProjectFixture],
    pub roles: &'static [Role],
    pub task: TaskSeed,
    pub target: Target,
    pub snapshots: &'static [Snapshot],
    pub checks: &'static [Check],
    pub criticals: &'static [CriticalCheck],
}

impl Scenario {
    /// The project the task lives in.
    pub const fn primary(&self) -> &ProjectFixture {
        &self.fixtures[0]
    }

    /// Projects other than the primary.
    pub fn peers(&self) -> &[ProjectFixture] {
        &self.fixtures[1..]
    }

    pub fn role_names(&self) -> Vec<&'static str> {
        self.roles.iter().map(|r| r.name).collect()
    }

    pub fn roles_with(&self, launch: Launch) -> impl Iterator<Item = &Role> {
        self.roles.iter().filter(move |r| r.launch == launch)
    }

    /// Maximum achievable score.
    pub fn total_points(&self) -> u64 {
        self.checks.iter().map(|c| u64::from(c.points)).sum()
    }
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Return all defined scenarios.
#[must_use]
pub const fn all_scenarios() -> [Scenario; SCENARIO_COUNT] {
    [
        scenario_worker_loop(),
        scenario_review_cycle(),
        scenario_api_redaction(),
        scenario_cross_project(),
    ]
}

/// Find a scenario by its command-line name.
pub fn find(name: &str) -> Result<Scenario> {
    all_scenarios()
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| EvalError::UnknownScenario {
            name: name.to_owned(),
        })
}

// ---------------------------------------------------------------------------
// Shared fixture pieces
// ---------------------------------------------------------------------------

const CARGO_TOML: &str = concat!(
    "[package]\n",
    "name = \"{{PROJECT_NAME}}\"\n",
    "version = \"0.1.0\"\n",
    "edition = \"2021\"\n",
    "\n",
    "[dependencies]\n",
);

const BOTBOX_JSON: &str = concat!(
    "{\n",
    "  \"project\": { \"name\": \"{{PROJECT_NAME}}\", \"channel\": \"\" },\n",
    "  \"agents\": {}\n",
    "}\n",
);

const GITIGNORE: &str = "/target\n";

/// Config file every fixture carries; the run phase patches it.
pub const PROJECT_CONFIG: &str = ".botbox.json";

const TASK_CLOSED: Predicate = Predicate::Any {
    of: &[
        Predicate::JsonField {
            artifact: TASK_JSON,
            pointer: "/status",
            one_of: &["closed", "done"],
        },
        Predicate::JsonField {
            artifact: TASK_JSON,
            pointer: "/state",
            one_of: &["closed", "done"],
        },
    ],
};

const TESTS_PASS: Predicate = Predicate::All {
    of: &[
        Predicate::Matches {
            artifact: TEST_OUTPUT,
            pattern: r"test result: ok\.",
        },
        Predicate::Lacks {
            artifact: TEST_OUTPUT,
            needle: "test result: FAILED",
        },
    ],
};

const WORKSPACES_MERGED: Predicate = Predicate::Lacks {
    artifact: WORKSPACES_JSON,
    needle: "\"is_default\": false",
};

const CLAIMS_RELEASED: Predicate = Predicate::Lacks {
    artifact: CLAIMS_JSON,
    needle: "bead://",
};

/// Shared worker instructions; scenario prompts append the specifics.
macro_rules! worker_protocol {
    () => {
        concat!(
            "You are {{AGENT_DEV}}, a developer agent working on the project at {{PROJECT_DIR}}.\n",
            "The project channel is #{{CHANNEL}}. Your task is {{TASK_ID}}.\n",
            "\n",
            "Protocol:\n",
            "1. Read the task: maw exec default -- br show {{TASK_ID}}\n",
            "2. Claim it: bus claims stake --agent {{AGENT_DEV}} \"bead://{{CHANNEL}}/{{TASK_ID}}\" -m \"{{TASK_ID}}\"\n",
            "   and mark it in progress: maw exec default -- br update --actor {{AGENT_DEV}} {{TASK_ID}} --status=in_progress\n",
            "3. Create a workspace: maw ws create --random. Do all edits there, using absolute paths.\n",
            "4. Run cargo test inside the workspace until it passes.\n",
            "5. Merge: maw ws merge <workspace> --destroy\n",
            "6. Close the task: maw exec default -- br close --actor {{AGENT_DEV}} {{TASK_ID}}\n",
            "7. Release claims: bus claims release --agent {{AGENT_DEV}} --all\n",
            "8. Announce: bus send --agent {{AGENT_DEV}} {{CHANNEL}} \"Completed {{TASK_ID}}: <summary>\" -L task-done\n",
            "\n",
        )
    };
}

// ---------------------------------------------------------------------------
// Scenario definitions
// ---------------------------------------------------------------------------

/// One worker, one task, end to end.
#[must_use]
pub const fn scenario_worker_loop() -> Scenario {
    Scenario {
        id: ScenarioId::WorkerLoop,
        name: "worker-loop",
        description: "Single worker claims, implements, merges and closes one task",
        fixtures: &[ProjectFixture {
            name: "csvstats",
            files: &[
                SeedFile {
                    path: "Cargo.toml",
                    content: CARGO_TOML,
                },
                SeedFile {
                    path: ".gitignore",
                    content: GITIGNORE,
                },
                SeedFile {
                    path: PROJECT_CONFIG,
                    content: BOTBOX_JSON,
                },
                SeedFile {
                    path: "src/lib.rs",
                    content: concat!(
                        "//! Summary statistics over one numeric CSV column.\n",
                        "\n",
                        "/// Parse `column` from `csv` (header row required).\n",
                        "pub fn parse_column(csv: &str, column: &str) -> Result<Vec<f64>, String> {\n",
                        "    let mut lines = csv.lines();\n",
                        "    let header = lines.next().ok_or(\"empty input\")?;\n",
                        "    let idx = header\n",
                        "        .split(',')\n",
                        "        .position(|h| h.trim() == column)\n",
                        "        .ok_or_else(|| format!(\"no column {column}\"))?;\n",
                        "    lines\n",
                        "        .filter(|l| !l.trim().is_empty())\n",
                        "        .map(|l| {\n",
                        "            l.split(',')\n",
                        "                .nth(idx)\n",
                        "                .ok_or_else(|| format!(\"short row: {l}\"))?\n",
                        "                .trim()\n",
                        "                .parse::<f64>()\n",
                        "                .map_err(|e| e.to_string())\n",
                        "        })\n",
                        "        .collect()\n",
                        "}\n",
                        "\n",
                        "/// Arithmetic mean; `None` for an empty slice.\n",
                        "pub fn mean(values: &[f64]) -> Option<f64> {\n",
                        "    todo!()\n",
                        "}\n",
                        "\n",
                        "/// Median (average of the middle two for even lengths); `None` when empty.\n",
                        "pub fn median(values: &[f64]) -> Option<f64> {\n",
                        "    todo!()\n",
                        "}\n",
                    ),
                },
                SeedFile {
                    path: "src/main.rs",
                    content: concat!(
                        "fn main() {\n",
                        "    let csv = std::fs::read_to_string(\"data/sample.csv\").expect(\"read data/sample.csv\");\n",
                        "    let values = csvstats::parse_column(&csv, \"value\").expect(\"value column\");\n",
                        "    println!(\"mean={:?} median={:?}\", csvstats::mean(&values), csvstats::median(&values));\n",
                        "}\n",
                    ),
                },
                SeedFile {
                    path: "data/sample.csv",
                    content: "id,value\n1,4.0\n2,8.0\n3,15.0\n4,16.0\n5,23.0\n6,42.0\n",
                },
            ],
            build_check: true,
            vcs: Vcs::Maw,
        }],
        roles: &[Role {
            name: "dev",
            launch: Launch::Direct,
            prompt: concat!(
                worker_protocol!(),
                "The task: implement `mean` and `median` in src/lib.rs (replace the todo!() bodies)\n",
                "and add unit tests for both, including the empty-slice case.\n",
                "Running the binary on data/sample.csv must print mean=Some(18.0) median=Some(15.5).\n",
            ),
        }],
        task: TaskSeed {
            title: "Implement mean and median for csvstats",
            description: "src/lib.rs has todo!() stubs for mean and median. Implement both, handle empty input with None, add unit tests.",
        },
        target: Target::Task,
        snapshots: &[Snapshot {
            project: "csvstats",
            path: "src/lib.rs",
        }],
        checks: &[
            Check {
                label: "task closed",
                points: 3,
                predicate: TASK_CLOSED,
            },
            Check {
                label: "no todo!() left in src/lib.rs",
                points: 2,
                predicate: Predicate::Lacks {
                    artifact: "source/csvstats/src/lib.rs",
                    needle: "todo!(",
                },
            },
            Check {
                label: "unit tests added",
                points: 1,
                predicate: Predicate::Contains {
                    artifact: "source/csvstats/src/lib.rs",
                    needle: "#[test]",
                },
            },
            Check {
                label: "cargo test passes",
                points: 2,
                predicate: TESTS_PASS,
            },
            Check {
                label: "completion announced on channel",
                points: 1,
                predicate: Predicate::Matches {
                    artifact: CHANNEL_HISTORY,
                    pattern: r"(?i)\b(completed|done|closed)\b",
                },
            },
            Check {
                label: "workspace merged and destroyed",
                points: 1,
                predicate: WORKSPACES_MERGED,
            },
            Check {
                label: "claims released",
                points: 1,
                predicate: CLAIMS_RELEASED,
            },
        ],
        criticals: &[],
    }
}

/// Dev plus a reviewer spawned on @-mention, gated on a crit review.
#[must_use]
pub const fn scenario_review_cycle() -> Scenario {
    Scenario {
        id: ScenarioId::ReviewCycle,
        name: "review-cycle",
        description: "Dev requests a crit review; a hook-spawned reviewer approves before merge",
        fixtures: &[ProjectFixture {
            name: "kvparse",
            files: &[
                SeedFile {
                    path: "Cargo.toml",
                    content: CARGO_TOML,
                },
                SeedFile {
                    path: ".gitignore",
                    content: GITIGNORE,
                },
                SeedFile {
                    path: PROJECT_CONFIG,
                    content: BOTBOX_JSON,
                },
                SeedFile {
                    path: "src/lib.rs",
                    content: concat!(
                        "//! A tiny `key = value` config format.\n",
                        "\n",
                        "use std::collections::BTreeMap;\n",
                        "\n",
                        "/// Parse one line. Blank lines and `#` comments yield `None`.\n",
                        "/// Keys and values are trimmed; a line without `=` is `None`.\n",
                        "pub fn parse_line(line: &str) -> Option<(String, String)> {\n",
                        "    todo!()\n",
                        "}\n",
                        "\n",
                        "/// Parse a whole document; later keys win.\n",
                        "pub fn parse(text: &str) -> BTreeMap<String, String> {\n",
                        "    text.lines().filter_map(parse_line).collect()\n",
                        "}\n",
                    ),
                },
                SeedFile {
                    path: "data/example.kv",
                    content: "# service settings\nname = kvparse\nport=8080\n\n  retries =  3\n",
                },
            ],
            build_check: true,
            vcs: Vcs::Maw,
        }],
        roles: &[
            Role {
                name: "dev",
                launch: Launch::Direct,
                prompt: concat!(
                    worker_protocol!(),
                    "The task: implement `parse_line` in src/lib.rs with unit tests\n",
                    "(data/example.kv must parse to 3 keys).\n",
                    "\n",
                    "This project requires review before merge. After tests pass and BEFORE step 5:\n",
                    "a. Create a review from your workspace: maw exec <workspace> -- crit reviews create --agent {{AGENT_DEV}} --title \"{{TASK_ID}}: parse_line\"\n",
                    "b. Request it: bus send --agent {{AGENT_DEV}} {{CHANNEL}} \"@{{AGENT_REVIEWER}} please review <review-id>\" -L review-request\n",
                    "c. Wait for a vote: poll crit review <review-id> every 30 seconds.\n",
                    "   If blocked, address the comments and request again.\n",
                    "d. Once approved: maw exec <workspace> -- crit reviews merge <review-id> --agent {{AGENT_DEV}}\n",
                    "Then continue with step 5.\n",
                ),
            },
            Role {
                name: "reviewer",
                launch: Launch::OnMention,
                prompt: concat!(
                    "You are {{AGENT_REVIEWER}}, a code reviewer for {{PROJECT_DIR}} on #{{CHANNEL}}.\n",
                    "Check your inbox: bus inbox --agent {{AGENT_REVIEWER}} --channels {{CHANNEL}}\n",
                    "For each review request: read the diff with crit review <review-id>, run cargo test\n",
                    "in the review's workspace, comment on problems with\n",
                    "crit comment <review-id> --agent {{AGENT_REVIEWER}} \"<text>\", then vote:\n",
                    "crit lgtm <review-id> --agent {{AGENT_REVIEWER}} or crit block <review-id> --agent {{AGENT_REVIEWER}} --reason \"<why>\".\n",
                    "Announce your vote: bus send --agent {{AGENT_REVIEWER}} {{CHANNEL}} \"<review-id>: <lgtm|blocked>\" -L review-done\n",
                ),
            },
        ],
        task: TaskSeed {
            title: "Implement parse_line for kvparse",
            description: "Implement parse_line (trim keys and values, skip blanks and # comments). Requires a crit review before merge.",
        },
        target: Target::ReviewedTask,
        snapshots: &[Snapshot {
            project: "kvparse",
            path: "src/lib.rs",
        }],
        checks: &[
            Check {
                label: "review merged",
                points: 3,
                predicate: Predicate::Any {
                    of: &[
                        Predicate::JsonField {
                            artifact: REVIEW_JSON,
                            pointer: "/status",
                            one_of: &["merged"],
                        },
                        Predicate::JsonField {
                            artifact: REVIEW_JSON,
                            pointer: "/review/status",
                            one_of: &["merged"],
                        },
                    ],
                },
            },
            Check {
                label: "reviewer voted",
                points: 2,
                predicate: Predicate::Matches {
                    artifact: REVIEW_JSON,
                    pattern: r#"(?i)"(vote|verdict)"\s*:\s*"(lgtm|approve|approved)""#,
                },
            },
            Check {
                label: "review requested by mention",
                points: 1,
                predicate: Predicate::Matches {
                    artifact: CHANNEL_HISTORY,
                    pattern: r"@eval-reviewer-\S+|@\S+.*\breview\b",
                },
            },
            Check {
                label: "task closed",
                points: 2,
                predicate: TASK_CLOSED,
            },
            Check {
                label: "no todo!() left in src/lib.rs",
                points: 1,
                predicate: Predicate::Lacks {
                    artifact: "source/kvparse/src/lib.rs",
                    needle: "todo!(",
                },
            },
            Check {
                label: "cargo test passes",
                points: 2,
                predicate: TESTS_PASS,
            },
            Check {
                label: "workspace merged and destroyed",
                points: 1,
                predicate: WORKSPACES_MERGED,
            },
        ],
        criticals: &[],
    }
}

const USERAPI_SRC: &str = "source/userapi/src/api.rs";

/// `"ssn"` as a JSON key filled from a format placeholder. Test assertions
/// that merely name the key do not match.
const SSN_SERIALIZED: &str = r#"\\?"ssn\\?"\s*:\s*\\?"?\{"#;

/// A `match` arm on a /debug path, as opposed to a test calling `route`.
const DEBUG_ROUTE_ARM: &str = r#""/debug[^"]*"\s*(=>|\|)"#;

/// Sensitive field and debug endpoint must both go.
#[must_use]
pub const fn scenario_api_redaction() -> Scenario {
    Scenario {
        id: ScenarioId::ApiRedaction,
        name: "api-redaction",
        description: "Remove the ssn field from API output and delete the /debug/dump endpoint",
        fixtures: &[ProjectFixture {
            name: "userapi",
            files: &[
                SeedFile {
                    path: "Cargo.toml",
                    content: CARGO_TOML,
                },
                SeedFile {
                    path: ".gitignore",
                    content: GITIGNORE,
                },
                SeedFile {
                    path: PROJECT_CONFIG,
                    content: BOTBOX_JSON,
                },
                SeedFile {
                    path: "src/lib.rs",
                    content: "pub mod api;\n",
                },
                SeedFile {
                    path: "src/api.rs",
                    content: r#"//! Minimal GET router over an in-memory user table.

pub struct User {
    pub id: u32,
    pub name: String,
    pub email: String,
    pub ssn: String,
}

impl User {
    pub fn to_json(&self) -> String {
        format!(
            "{{\"id\":{},\"name\":\"{}\",\"email\":\"{}\",\"ssn\":\"{}\"}}",
            self.id, self.name, self.email, self.ssn
        )
    }
}

pub fn sample_users() -> Vec<User> {
    vec![
        User {
            id: 1,
            name: "alice".to_owned(),
            email: "alice@example.com".to_owned(),
            ssn: "078-05-1120".to_owned(),
        },
        User {
            id: 2,
            name: "bob".to_owned(),
            email: "bob@example.com".to_owned(),
            ssn: "219-09-9999".to_owned(),
        },
    ]
}

/// Route a GET request to a JSON body.
pub fn route(path: &str, users: &[User]) -> Option<String> {
    match path {
        "/users" => Some(format!(
            "[{}]",
            users.iter().map(User::to_json).collect::<Vec<_>>().join(",")
        )),
        "/debug/dump" => Some(format!(
            "{{\"users\":{},\"database_url\":\"{}\"}}",
            users.len(),
            std::env::var("DATABASE_URL").unwrap_or_default()
        )),
        other => other
            .strip_prefix("/users/")
            .and_then(|id| id.parse::<u32>().ok())
            .and_then(|id| users.iter().find(|u| u.id == id))
            .map(User::to_json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_users() {
        let body = route("/users", &sample_users()).unwrap();
        assert!(body.contains("alice"));
        assert!(body.contains("bob"));
    }
}
"#,
                },
            ],
            build_check: true,
            vcs: Vcs::Maw,
        }],
        roles: &[Role {
            name: "dev",
            launch: Launch::Direct,
            prompt: concat!(
                worker_protocol!(),
                "The task is a security fix in src/api.rs:\n",
                "- User JSON must never include the ssn. Remove it from to_json output.\n",
                "- Delete the /debug/dump route entirely; it leaks configuration.\n",
                "- /users and /users/<id> must keep working.\n",
                "Add regression tests proving ssn is absent and /debug/dump returns None.\n",
            ),
        }],
        task: TaskSeed {
            title: "Security: stop exposing ssn and remove /debug/dump",
            description: "GET /users leaks the ssn field and /debug/dump leaks DATABASE_URL. Redact ssn from all output, delete the debug route, add regression tests.",
        },
        target: Target::Task,
        snapshots: &[Snapshot {
            project: "userapi",
            path: "src/api.rs",
        }],
        checks: &[
            Check {
                label: "task closed",
                points: 2,
                predicate: TASK_CLOSED,
            },
            Check {
                label: "ssn removed from JSON output",
                points: 3,
                predicate: Predicate::LacksMatch {
                    artifact: USERAPI_SRC,
                    pattern: SSN_SERIALIZED,
                },
            },
            Check {
                label: "debug route removed",
                points: 3,
                predicate: Predicate::LacksMatch {
                    artifact: USERAPI_SRC,
                    pattern: DEBUG_ROUTE_ARM,
                },
            },
            Check {
                label: "user routes intact",
                points: 1,
                predicate: Predicate::All {
                    of: &[
                        Predicate::Contains {
                            artifact: USERAPI_SRC,
                            needle: "\"/users\"",
                        },
                        Predicate::Contains {
                            artifact: USERAPI_SRC,
                            needle: "/users/",
                        },
                    ],
                },
            },
            Check {
                label: "regression tests added",
                points: 1,
                predicate: Predicate::CountAtLeast {
                    artifact: USERAPI_SRC,
                    needle: "#[test]",
                    n: 2,
                },
            },
            Check {
                label: "cargo test passes",
                points: 2,
                predicate: TESTS_PASS,
            },
        ],
        criticals: &[
            CriticalCheck {
                label: "ssn still serialized",
                predicate: Predicate::Matches {
                    artifact: USERAPI_SRC,
                    pattern: SSN_SERIALIZED,
                },
            },
            CriticalCheck {
                label: "/debug/dump endpoint still present",
                predicate: Predicate::Matches {
                    artifact: USERAPI_SRC,
                    pattern: DEBUG_ROUTE_ARM,
                },
            },
        ],
    }
}

const PEER_REPORT: Predicate = Predicate::Matches {
    artifact: "channel-libcore.txt",
    pattern: r"(?i)normalize_id|trailing|whitespace|trim",
};

/// Fix locally, report upstream, leave the other project alone.
#[must_use]
pub const fn scenario_cross_project() -> Scenario {
    Scenario {
        id: ScenarioId::CrossProject,
        name: "cross-project",
        description: "Work around a bug in a dependency owned by another project and report it on that project's channel",
        fixtures: &[
            ProjectFixture {
                name: "appsvc",
                files: &[
                    SeedFile {
                        path: "Cargo.toml",
                        content: concat!(
                            "[package]\n",
                            "name = \"{{PROJECT_NAME}}\"\n",
                            "version = \"0.1.0\"\n",
                            "edition = \"2021\"\n",
                            "\n",
                            "[dependencies]\n",
                            "libcore = { path = \"../../../libcore\" }\n",
                        ),
                    },
                    SeedFile {
                        path: ".gitignore",
                        content: GITIGNORE,
                    },
                    SeedFile {
                        path: PROJECT_CONFIG,
                        content: BOTBOX_JSON,
                    },
                    SeedFile {
                        path: "src/lib.rs",
                        content: concat!(
                            "//! Session lookups keyed by normalised user id.\n",
                            "\n",
                            "pub fn lookup_key(raw: &str) -> String {\n",
                            "    format!(\"user:{}\", libcore::normalize_id(raw))\n",
                            "}\n",
                            "\n",
                            "#[cfg(test)]\n",
                            "mod tests {\n",
                            "    use super::*;\n",
                            "\n",
                            "    #[test]\n",
                            "    fn surrounding_whitespace_is_ignored() {\n",
                            "        assert_eq!(lookup_key(\"  Bob  \"), \"user:bob\");\n",
                            "    }\n",
                            "}\n",
                        ),
                    },
                ],
                build_check: false,
                vcs: Vcs::Maw,
            },
            ProjectFixture {
                name: "libcore",
                files: &[
                    SeedFile {
                        path: "Cargo.toml",
                        content: CARGO_TOML,
                    },
                    SeedFile {
                        path: ".gitignore",
                        content: GITIGNORE,
                    },
                    SeedFile {
                        path: PROJECT_CONFIG,
                        content: BOTBOX_JSON,
                    },
                    SeedFile {
                        path: "src/lib.rs",
                        content: concat!(
                            "/// Normalise a user-supplied identifier.\n",
                            "pub fn normalize_id(raw: &str) -> String {\n",
                            "    raw.trim_start().to_lowercase()\n",
                            "}\n",
                        ),
                    },
                ],
                build_check: true,
                // Not maw-managed: appsvc workspaces reach it at a fixed depth.
                vcs: Vcs::Jj,
            },
        ],
        roles: &[
            Role {
                name: "dev",
                launch: Launch::Direct,
                prompt: concat!(
                    worker_protocol!(),
                    "The task: lookup_key in appsvc fails its test for ids with trailing whitespace.\n",
                    "The root cause is in the libcore dependency at {{PEER_PROJECT_DIR}}, which is owned by\n",
                    "another team. Do NOT edit libcore. Instead:\n",
                    "- Work around the problem inside appsvc so its tests pass.\n",
                    "- Report the root cause to libcore's lead on their channel:\n",
                    "  bus send --agent {{AGENT_DEV}} {{PEER_CHANNEL}} \"@{{AGENT_PEER_LEAD}} <what is wrong in libcore and where>\" -L bug-report\n",
                ),
            },
            Role {
                name: "peer-lead",
                launch: Launch::Idle,
                prompt: "",
            },
        ],
        task: TaskSeed {
            title: "lookup_key breaks on ids with trailing whitespace",
            description: "appsvc's lookup_key test fails for \"  Bob  \". Fix appsvc and report the upstream cause to the libcore team; do not modify libcore.",
        },
        target: Target::Task,
        snapshots: &[
            Snapshot {
                project: "appsvc",
                path: "src/lib.rs",
            },
            Snapshot {
                project: "libcore",
                path: "src/lib.rs",
            },
        ],
        checks: &[
            Check {
                label: "task closed",
                points: 2,
                predicate: TASK_CLOSED,
            },
            Check {
                label: "cargo test passes in appsvc",
                points: 2,
                predicate: TESTS_PASS,
            },
            Check {
                label: "workaround applied in appsvc",
                points: 2,
                predicate: Predicate::Matches {
                    artifact: "source/appsvc/src/lib.rs",
                    pattern: r"\.trim(_end)?\(\)",
                },
            },
            Check {
                label: "libcore left untouched",
                points: 2,
                predicate: Predicate::Contains {
                    artifact: "source/libcore/src/lib.rs",
                    needle: "raw.trim_start().to_lowercase()",
                },
            },
            Check {
                label: "root cause reported on #libcore",
                points: 2,
                predicate: PEER_REPORT,
            },
            Check {
                label: "report mentions libcore's lead",
                points: 1,
                predicate: Predicate::Matches {
                    artifact: "channel-libcore.txt",
                    pattern: r"@\S+",
                },
            },
            Check {
                label: "completion announced on #appsvc",
                points: 1,
                predicate: Predicate::Matches {
                    artifact: CHANNEL_HISTORY,
                    pattern: r"(?i)\b(completed|done|closed)\b",
                },
            },
        ],
        criticals: &[
            CriticalCheck {
                label: "no report sent to #libcore",
                predicate: Predicate::Not { of: &PEER_REPORT },
            },
            CriticalCheck {
                label: "libcore source modified",
                predicate: Predicate::Lacks {
                    artifact: "source/libcore/src/lib.rs",
                    needle: "raw.trim_start().to_lowercase()",
                },
            },
        ],
    }
}

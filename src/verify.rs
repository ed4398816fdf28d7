//! Scored checks and critical-failure predicates.
//!
//! Verification is a flat list of independent [`Check`]s, each worth a
//! number of points, plus [`CriticalCheck`]s that fail the whole eval when
//! they trigger. Every check is evaluated; nothing short-circuits. All
//! inputs come from an [`ArtifactSet`], so re-running against the same
//! artifacts always yields the same [`Scorecard`].

use std::fmt::{self, Write as _};
use std::path::Path;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::artifacts::ArtifactSet;
use crate::error::Result;

/// File written next to the artifacts.
pub const SCORECARD_FILE: &str = "scorecard.json";

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// A boolean test over the captured artifacts.
///
/// Positive predicates are false when the artifact is missing; `Lacks` is
/// true only when the artifact exists and does not contain the needle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Artifact contains `needle`.
    Contains {
        artifact: &'static str,
        needle: &'static str,
    },
    /// Artifact matches a regular expression. An invalid pattern never
    /// matches.
    Matches {
        artifact: &'static str,
        pattern: &'static str,
    },
    /// Artifact exists and does not contain `needle`.
    Lacks {
        artifact: &'static str,
        needle: &'static str,
    },
    /// Artifact exists and does not match `pattern`. An invalid pattern
    /// never passes.
    LacksMatch {
        artifact: &'static str,
        pattern: &'static str,
    },
    /// JSON value at `pointer` (rendered as a string) is one of `one_of`.
    /// When the document is an array, the pointer is also tried against
    /// its first element.
    JsonField {
        artifact: &'static str,
        pointer: &'static str,
        one_of: &'static [&'static str],
    },
    /// `needle` occurs at least `n` times.
    CountAtLeast {
        artifact: &'static str,
        needle: &'static str,
        n: usize,
    },
    Any { of: &'static [Self] },
    All { of: &'static [Self] },
    /// Negation. Unlike `Lacks`, `Not(Contains)` is true for a missing
    /// artifact.
    Not { of: &'static Self },
}

impl Predicate {
    /// Evaluate against `artifacts`.
    pub fn eval(&self, artifacts: &ArtifactSet) -> bool {
        match *self {
            Self::Contains { artifact, needle } => {
                artifacts.get(artifact).is_some_and(|t| t.contains(needle))
            }
            Self::Matches { artifact, pattern } => artifacts
                .get(artifact)
                .and_then(|t| is_match(pattern, t))
                .unwrap_or(false),
            Self::Lacks { artifact, needle } => {
                artifacts.get(artifact).is_some_and(|t| !t.contains(needle))
            }
            Self::LacksMatch { artifact, pattern } => artifacts
                .get(artifact)
                .and_then(|t| is_match(pattern, t))
                .is_some_and(|m| !m),
            Self::JsonField {
                artifact,
                pointer,
                one_of,
            } => artifacts
                .json(artifact)
                .and_then(|doc| json_at(&doc, pointer))
                .is_some_and(|v| one_of.contains(&v.as_str())),
            Self::CountAtLeast {
                artifact,
                needle,
                n,
            } => artifacts
                .get(artifact)
                .is_some_and(|t| !needle.is_empty() && t.matches(needle).count() >= n),
            Self::Any { of } => of.iter().any(|p| p.eval(artifacts)),
            Self::All { of } => of.iter().all(|p| p.eval(artifacts)),
            Self::Not { of } => !of.eval(artifacts),
        }
    }
}

/// `None` for an invalid pattern.
fn is_match(pattern: &str, text: &str) -> Option<bool> {
    match Regex::new(pattern) {
        Ok(re) => Some(re.is_match(text)),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "invalid check pattern");
            None
        }
    }
}

fn json_at(doc: &Value, pointer: &str) -> Option<String> {
    let value = doc.pointer(pointer).or_else(|| {
        doc.as_array()
            .and_then(|items| items.first())
            .and_then(|first| first.pointer(pointer))
    })?;
    Some(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// A scored check.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Check {
    pub label: &'static str,
    pub points: u32,
    pub predicate: Predicate,
}

/// A predicate that, when true, fails the eval regardless of score.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CriticalCheck {
    pub label: &'static str,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub label: String,
    pub passed: bool,
    pub awarded: u32,
    pub possible: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalResult {
    pub label: String,
    pub triggered: bool,
}

/// Overall outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Pass,
    Fail,
    CriticalFail,
}

impl Verdict {
    /// `CriticalFail` beats everything; otherwise a pass needs
    /// `awarded / total >= pass_pct%`.
    pub fn decide(awarded: u64, total: u64, pass_pct: u8, critical: bool) -> Self {
        if critical {
            Self::CriticalFail
        } else if awarded * 100 >= total * u64::from(pass_pct) {
            Self::Pass
        } else {
            Self::Fail
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::CriticalFail => write!(f, "CRITICAL FAIL"),
        }
    }
}

/// Every check result plus the verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scorecard {
    pub scenario: String,
    pub checks: Vec<CheckResult>,
    pub criticals: Vec<CriticalResult>,
    pub awarded: u64,
    pub total: u64,
    pub pass_pct: u8,
    pub verdict: Verdict,
}

impl Scorecard {
    /// Evaluate every check and critical against `artifacts`.
    pub fn evaluate(
        scenario: &str,
        checks: &[Check],
        criticals: &[CriticalCheck],
        artifacts: &ArtifactSet,
        pass_pct: u8,
    ) -> Self {
        let checks: Vec<CheckResult> = checks
            .iter()
            .map(|c| {
                let passed = c.predicate.eval(artifacts);
                CheckResult {
                    label: c.label.to_owned(),
                    passed,
                    awarded: if passed { c.points } else { 0 },
                    possible: c.points,
                }
            })
            .collect();
        let criticals: Vec<CriticalResult> = criticals
            .iter()
            .map(|c| CriticalResult {
                label: c.label.to_owned(),
                triggered: c.predicate.eval(artifacts),
            })
            .collect();

        let awarded = checks.iter().map(|c| u64::from(c.awarded)).sum();
        let total = checks.iter().map(|c| u64::from(c.possible)).sum();
        let critical = criticals.iter().any(|c| c.triggered);
        let verdict = Verdict::decide(awarded, total, pass_pct, critical);
        tracing::info!(scenario, awarded, total, %verdict, "scored");

        Self {
            scenario: scenario.to_owned(),
            checks,
            criticals,
            awarded,
            total,
            pass_pct,
            verdict,
        }
    }

    /// Human-readable summary.
    pub fn render_text(&self) -> String {
        let mut out = format!("scenario: {}\n\n", self.scenario);
        for c in &self.checks {
            let mark = if c.passed { "PASS" } else { "FAIL" };
            let _ = writeln!(out, "[{mark}] {} ({}/{})", c.label, c.awarded, c.possible);
        }
        let triggered: Vec<&CriticalResult> =
            self.criticals.iter().filter(|c| c.triggered).collect();
        if !triggered.is_empty() {
            out.push('\n');
            for c in triggered {
                let _ = writeln!(out, "[CRITICAL] {}", c.label);
            }
        }
        let _ = writeln!(
            out,
            "\nscore: {}/{} (pass at {}%)\nverdict: {}",
            self.awarded, self.total, self.pass_pct, self.verdict
        );
        out
    }

    /// Write `scorecard.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::write(
            dir.join(SCORECARD_FILE),
            serde_json::to_string_pretty(self)? + "\n",
        )?;
        Ok(())
    }
}

//! `crit` adapter: code review records.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::{ToolCommand, ToolError, Toolbox};

/// Review lifecycle as reported by crit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Blocked,
    Merged,
    Abandoned,
    Unknown,
}

impl ReviewStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "open" => Self::Pending,
            "approved" | "lgtm" => Self::Approved,
            "blocked" | "changes_requested" => Self::Blocked,
            "merged" => Self::Merged,
            "abandoned" => Self::Abandoned,
            _ => Self::Unknown,
        }
    }

    /// Read `status` (or `state`) from a review object, unwrapping a
    /// top-level `review` key if present.
    pub fn from_json(value: &Value) -> Self {
        let review = value.get("review").unwrap_or(value);
        review
            .get("status")
            .or_else(|| review.get("state"))
            .and_then(Value::as_str)
            .map_or(Self::Unknown, Self::parse)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Abandoned)
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Blocked => "blocked",
            Self::Merged => "merged",
            Self::Abandoned => "abandoned",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Review ids from `crit reviews list --format json`.
pub fn review_ids(value: &Value) -> Vec<String> {
    value
        .get("reviews")
        .unwrap_or(value)
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|r| {
                    r.get("review_id")
                        .or_else(|| r.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Typed view over the `crit` CLI.
pub struct Crit<'a> {
    tools: &'a Toolbox<'a>,
}

impl<'a> Crit<'a> {
    pub(crate) const fn new(tools: &'a Toolbox<'a>) -> Self {
        Self { tools }
    }

    fn cmd(&self, args: &[&str]) -> ToolCommand {
        let bins = self.tools.bins();
        let cmd = self.tools.command(&bins.crit).args(args.iter().copied());
        if bins.via_maw {
            cmd.via_maw_exec(&bins.maw, "default")
        } else {
            cmd
        }
    }

    /// `crit reviews list --format json`
    pub fn reviews_json(&self) -> Result<Value, ToolError> {
        self.tools
            .runner()
            .run_json(&self.cmd(&["reviews", "list", "--format", "json"]))
    }

    /// `crit review <id> --format json`
    pub fn review_json(&self, id: &str) -> Result<Value, ToolError> {
        self.tools
            .runner()
            .run_json(&self.cmd(&["review", id, "--format", "json"]))
    }

    /// Status of the most recently listed review, if any.
    pub fn latest_status(&self) -> Result<Option<(String, ReviewStatus)>, ToolError> {
        let list = self.reviews_json()?;
        let Some(id) = review_ids(&list).pop() else {
            return Ok(None);
        };
        let status = ReviewStatus::from_json(&self.review_json(&id)?);
        Ok(Some((id, status)))
    }
}

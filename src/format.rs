use anyhow::{Context as _, Result};
use clap::ValueEnum;
use serde::Serialize;

/// Output format for command results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary
    #[default]
    Text,
    /// JSON - machine-parseable
    Json,
}

impl OutputFormat {
    /// Serialize data as pretty JSON.
    ///
    /// Text output is rendered by each command; only JSON goes through here.
    pub fn json<T: Serialize>(data: &T) -> Result<String> {
        serde_json::to_string_pretty(data).context("JSON serialization failed")
    }

    /// Print `data` as JSON, or `text()` for text output.
    pub fn emit<T: Serialize>(self, data: &T, text: impl FnOnce() -> String) -> Result<()> {
        match self {
            Self::Json => println!("{}", Self::json(data)?),
            Self::Text => print!("{}", text()),
        }
        Ok(())
    }
}

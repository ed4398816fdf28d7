//! Error types for the eval harness.
//!
//! [`EvalError`] is the unified error for setup, run and verify phases.
//! Messages follow the same convention as the external tools we drive:
//! say what went wrong, then say how to fix it.

use std::path::PathBuf;

use thiserror::Error;

use crate::tools::ToolError;

// ---------------------------------------------------------------------------
// EvalError
// ---------------------------------------------------------------------------

/// Unified error type for eval operations.
#[derive(Debug, Error)]
pub enum EvalError {
    /// No scenario with this name exists in the catalog.
    #[error("unknown scenario '{name}'.\n  To fix: list available scenarios:\n    evals list")]
    UnknownScenario {
        /// The name that was requested.
        name: String,
    },

    /// A required variable is missing from the `.eval-env` file.
    #[error(
        "{path}: missing variable {key}.\n  To fix: re-run setup to regenerate the env file:\n    evals setup <scenario>"
    )]
    MissingVar {
        /// The env file that was read.
        path: PathBuf,
        /// The variable that was not present.
        key: String,
    },

    /// The `.eval-env` file could not be parsed.
    #[error("{path}:{line}: {detail}")]
    EnvFileSyntax {
        /// The env file that was read.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong with the line.
        detail: String,
    },

    /// A configuration file could not be loaded or parsed.
    #[error("config error in {path}: {detail}\n  To fix: edit the file, or delete it to use defaults.")]
    Config {
        /// Path to the configuration file.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// A fixture file path escapes the project directory.
    #[error("fixture path '{path}' is not a plain relative path")]
    FixturePath {
        /// The offending path.
        path: String,
    },

    /// A prompt template references variables that are not defined.
    #[error("prompt template references undefined variables: {}", missing.join(", "))]
    PromptVars {
        /// Placeholder names that had no value.
        missing: Vec<String>,
    },

    /// A JSON document could not be patched.
    #[error("cannot patch {path} at {pointer}: {detail}")]
    JsonPatch {
        /// The JSON file being patched.
        path: PathBuf,
        /// JSON pointer of the failing patch.
        pointer: String,
        /// Why the patch failed.
        detail: String,
    },

    /// The seeded state is not what the run phase expects.
    #[error(
        "seed check failed: {detail}\n  To fix: set up a fresh eval:\n    evals setup <scenario>"
    )]
    SeedCheck {
        /// What was found instead.
        detail: String,
    },

    /// An external tool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T, E = EvalError> = std::result::Result<T, E>;

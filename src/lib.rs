//! evals library crate: the harness behind the `evals` binary.
//!
//! The binary is a thin clap layer. Everything it drives lives here so that
//! integration tests can run setup, run and verify against a scripted
//! [`tools::ToolRunner`] instead of the real external tools.

pub mod artifacts;
pub mod config;
pub mod env_file;
pub mod error;
pub mod eval;
pub mod fixture;
pub mod poll;
pub mod registrar;
pub mod spawner;
pub mod telemetry;
pub mod tools;
pub mod verify;

// Private modules only used by the binary: doctor, format

//! The command contract.
//!
//! A [`Command`] is an opaque unit of work supplied by an asset compiler. The
//! engine only relies on its declared inputs, its declared output and its
//! execution method; everything else about the command is its own business.
//!
//! # Submodules
//!
//! - [`context`] - Execution context handed to [`Command::execute`]
//! - [`import`] - Raw file import, the reference command implementation

pub mod context;
pub mod import;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::locator::Locator;

pub use context::CommandContext;
pub use import::ImportFile;

/// Status a command reports after executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
  Successful,
  Failed,
  Cancelled,
}

/// An unexpected fault while executing a command.
///
/// Expected failures (a missing source file, an invalid parameter) should be
/// logged through the context and reported as [`CommandStatus::Failed`]
/// instead.
#[derive(Debug, Error)]
pub enum CommandError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("{0}")]
  Other(String),
}

/// A unit of work with declared inputs and a single declared output.
///
/// Implementations must be deterministic: `inputs`, `output` and `parameters`
/// may only depend on the command's own configuration, and `execute` may only
/// write to the location identified by `output`.
#[async_trait]
pub trait Command: Send + Sync + fmt::Debug {
  /// Stable identifier of the command kind, part of the fingerprint.
  fn type_tag(&self) -> &str;

  /// Parameters that influence the produced output, part of the fingerprint.
  fn parameters(&self) -> Result<Value, serde_json::Error>;

  /// Ordered list of everything this command reads.
  fn inputs(&self) -> Vec<Locator> {
    Vec::new()
  }

  /// The single location this command produces.
  fn output(&self) -> Locator;

  /// Human-readable name used in logs and results.
  fn title(&self) -> String {
    format!("{} -> {}", self.type_tag(), self.output())
  }

  /// Produce the output.
  async fn execute(&self, ctx: &CommandContext) -> Result<CommandStatus, CommandError>;
}

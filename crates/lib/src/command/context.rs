//! Execution context for a single command.

use std::path::{Path, PathBuf};

use crate::execute::types::CancelHandle;
use crate::locator::Locator;
use crate::log::{CommandLog, Severity};

/// Everything a command may use while executing.
///
/// The context is created by the session for each execution and replaces any
/// process-wide service lookup: paths, logging and cancellation all flow
/// through it.
#[derive(Debug, Clone)]
pub struct CommandContext {
  output_dir: PathBuf,
  output: Locator,
  inputs: Vec<Locator>,
  log: CommandLog,
  cancel: CancelHandle,
}

impl CommandContext {
  pub fn new(
    output_dir: PathBuf,
    output: Locator,
    inputs: Vec<Locator>,
    log: CommandLog,
    cancel: CancelHandle,
  ) -> Self {
    Self {
      output_dir,
      output,
      inputs,
      log,
      cancel,
    }
  }

  /// Root directory that storage URLs are resolved against.
  pub fn output_dir(&self) -> &Path {
    &self.output_dir
  }

  /// Resolve any locator to a path on disk.
  pub fn resolve(&self, locator: &Locator) -> PathBuf {
    locator.resolve(&self.output_dir)
  }

  /// The declared output locator.
  pub fn output(&self) -> &Locator {
    &self.output
  }

  /// Path the command must write its output to.
  pub fn output_path(&self) -> PathBuf {
    self.resolve(&self.output)
  }

  /// Paths of the declared inputs, in declaration order.
  pub fn input_paths(&self) -> Vec<PathBuf> {
    self.inputs.iter().map(|i| self.resolve(i)).collect()
  }

  /// Returns true once the session has been cancelled.
  ///
  /// Long-running commands should poll this and return
  /// `CommandStatus::Cancelled` when it flips.
  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  pub fn log(&self, severity: Severity, text: impl Into<String>) {
    self.log.log(severity, text);
  }

  pub fn debug(&self, text: impl Into<String>) {
    self.log(Severity::Debug, text);
  }

  pub fn verbose(&self, text: impl Into<String>) {
    self.log(Severity::Verbose, text);
  }

  pub fn info(&self, text: impl Into<String>) {
    self.log(Severity::Info, text);
  }

  pub fn warning(&self, text: impl Into<String>) {
    self.log(Severity::Warning, text);
  }

  pub fn error(&self, text: impl Into<String>) {
    self.log(Severity::Error, text);
  }

  pub fn fatal(&self, text: impl Into<String>) {
    self.log(Severity::Fatal, text);
  }
}

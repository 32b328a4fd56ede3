//! Diagnostics emitted by commands and by the engine.
//!
//! Every message carries a [`Severity`] and the title of the command it
//! originates from. Messages are collected per command into a [`CommandLog`]
//! and mirrored to `tracing` at the matching level.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

/// Severity of a diagnostic message, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Debug,
  Verbose,
  Info,
  Warning,
  Error,
  Fatal,
}

impl Severity {
  /// Returns true for `Error` and `Fatal`.
  pub fn is_error(self) -> bool {
    self >= Severity::Error
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Severity::Debug => "debug",
      Severity::Verbose => "verbose",
      Severity::Info => "info",
      Severity::Warning => "warning",
      Severity::Error => "error",
      Severity::Fatal => "fatal",
    };
    f.write_str(s)
  }
}

/// A single diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
  pub severity: Severity,
  /// Title of the command that emitted the message.
  pub command: String,
  pub text: String,
}

impl fmt::Display for LogMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}] {}: {}", self.severity, self.command, self.text)
  }
}

/// Thread-safe collector for the messages of one command.
///
/// Cloning yields a handle to the same underlying buffer.
#[derive(Debug, Clone)]
pub struct CommandLog {
  command: String,
  messages: Arc<Mutex<Vec<LogMessage>>>,
}

impl CommandLog {
  pub fn new(command: impl Into<String>) -> Self {
    Self {
      command: command.into(),
      messages: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Record a message and forward it to `tracing`.
  pub fn log(&self, severity: Severity, text: impl Into<String>) {
    let text = text.into();
    match severity {
      Severity::Debug => trace!(command = %self.command, "{}", text),
      Severity::Verbose => debug!(command = %self.command, "{}", text),
      Severity::Info => info!(command = %self.command, "{}", text),
      Severity::Warning => warn!(command = %self.command, "{}", text),
      Severity::Error | Severity::Fatal => error!(command = %self.command, severity = %severity, "{}", text),
    }

    let message = LogMessage {
      severity,
      command: self.command.clone(),
      text,
    };
    self.messages.lock().unwrap_or_else(|e| e.into_inner()).push(message);
  }

  /// Append messages recorded earlier (e.g. replayed from a cache entry)
  /// without forwarding them to `tracing` again.
  pub fn extend(&self, messages: impl IntoIterator<Item = LogMessage>) {
    self
      .messages
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .extend(messages);
  }

  /// Snapshot of the messages recorded so far.
  pub fn messages(&self) -> Vec<LogMessage> {
    self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Returns true if any recorded message is an error.
  pub fn has_errors(&self) -> bool {
    self
      .messages
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .any(|m| m.severity.is_error())
  }
}

//! Types for command scheduling and build results.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::fingerprint::Fingerprint;
use crate::locator::Locator;
use crate::log::LogMessage;
use crate::util::hash::ContentHash;

/// Cooperative cancellation flag shared between a builder, its scheduler and
/// the commands it runs.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
  flag: Arc<AtomicBool>,
  notify: Arc<Notify>,
}

impl CancelHandle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.flag.store(true, Ordering::SeqCst);
    self.notify.notify_waiters();
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::SeqCst)
  }

  /// Resolves once [`cancel`](Self::cancel) has been called.
  pub async fn cancelled(&self) {
    loop {
      // Register before checking so a concurrent cancel() cannot be missed
      let notified = self.notify.notified();
      if self.is_cancelled() {
        return;
      }
      notified.await;
    }
  }
}

/// Lifecycle of a graph node during one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  /// Waiting for producers.
  Pending,
  /// All producers are done; waiting for a worker.
  Ready,
  Running,
  /// Executed and produced its output.
  Succeeded,
  /// Skipped because a valid cache entry matched its fingerprint.
  CacheHit,
  Failed,
  Cancelled,
}

impl NodeState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      NodeState::Succeeded | NodeState::CacheHit | NodeState::Failed | NodeState::Cancelled
    )
  }

  /// True for the states that unblock consumers.
  pub fn is_success(self) -> bool {
    matches!(self, NodeState::Succeeded | NodeState::CacheHit)
  }

  /// Status reported for a terminal state.
  pub fn status(self) -> ResultStatus {
    match self {
      NodeState::CacheHit => ResultStatus::NotTriggeredWasSuccessful,
      NodeState::Failed => ResultStatus::Failed,
      NodeState::Cancelled => ResultStatus::Cancelled,
      NodeState::Pending | NodeState::Ready | NodeState::Running | NodeState::Succeeded => ResultStatus::Successful,
    }
  }
}

/// Status vocabulary of commands and sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
  Successful,
  /// Not executed because a cached result was reused.
  NotTriggeredWasSuccessful,
  Failed,
  Cancelled,
}

impl fmt::Display for ResultStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ResultStatus::Successful => "successful",
      ResultStatus::NotTriggeredWasSuccessful => "up to date",
      ResultStatus::Failed => "failed",
      ResultStatus::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// Why a node was cancelled without running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
  /// An ancestor failed. Holds the title of the failed node.
  DependencyFailed { root: String },
  /// An ancestor was cancelled. Holds the title of the cancelled node.
  DependencyCancelled { node: String },
  /// The session was cancelled before this node started.
  SessionCancelled,
}

impl fmt::Display for CancelCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CancelCause::DependencyFailed { root } => write!(f, "dependency failed: {root}"),
      CancelCause::DependencyCancelled { node } => write!(f, "dependency cancelled: {node}"),
      CancelCause::SessionCancelled => f.write_str("session cancelled"),
    }
  }
}

/// Outcome of one command in a session.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
  pub title: String,
  pub asset: Option<String>,
  pub output: Locator,
  /// Terminal state of the node.
  pub state: NodeState,
  pub fingerprint: Option<Fingerprint>,
  pub output_hash: Option<ContentHash>,
  pub cause: Option<CancelCause>,
  /// Offset from session start at which the command began running.
  pub started: Option<Duration>,
  /// Offset from session start at which the command finished.
  pub finished: Option<Duration>,
  pub messages: Vec<LogMessage>,
}

impl CommandResult {
  /// Result of a node cancelled before it ran.
  pub fn cancelled(title: String, asset: Option<String>, output: Locator, cause: CancelCause) -> Self {
    Self {
      title,
      asset,
      output,
      state: NodeState::Cancelled,
      fingerprint: None,
      output_hash: None,
      cause: Some(cause),
      started: None,
      finished: None,
      messages: Vec::new(),
    }
  }

  pub fn status(&self) -> ResultStatus {
    self.state.status()
  }

  /// True when a failure upstream (or this command) is responsible for the state.
  pub fn is_failure(&self) -> bool {
    self.state == NodeState::Failed || matches!(self.cause, Some(CancelCause::DependencyFailed { .. }))
  }
}

/// Outcome of a whole build session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildResult {
  /// Per-command results in completion order.
  pub results: Vec<CommandResult>,
  /// Every message of the session, grouped by command in completion order.
  pub log: Vec<LogMessage>,
  /// The session was cancelled through its cancel handle.
  pub cancelled: bool,
  pub elapsed: Duration,
}

impl BuildResult {
  pub fn new(results: Vec<CommandResult>, cancelled: bool, elapsed: Duration) -> Self {
    let log = results.iter().flat_map(|r| r.messages.iter().cloned()).collect();
    Self {
      results,
      log,
      cancelled,
      elapsed,
    }
  }

  /// Returns true if nothing failed and the session was not cancelled.
  ///
  /// A command that chose to return `Cancelled` on its own does not fail the
  /// build; neither do its cancelled consumers.
  pub fn is_success(&self) -> bool {
    !self.cancelled && !self.results.iter().any(CommandResult::is_failure)
  }

  /// Returns true if any message has `Error` severity or above, regardless of
  /// command statuses.
  pub fn has_errors(&self) -> bool {
    self.log.iter().any(|m| m.severity.is_error())
  }

  /// Overall status of the session.
  pub fn status(&self) -> ResultStatus {
    if self.cancelled {
      ResultStatus::Cancelled
    } else if !self.is_success() {
      ResultStatus::Failed
    } else if !self.results.is_empty() && self.results.iter().all(|r| r.state == NodeState::CacheHit) {
      ResultStatus::NotTriggeredWasSuccessful
    } else {
      ResultStatus::Successful
    }
  }

  pub fn result_for(&self, output: &Locator) -> Option<&CommandResult> {
    self.results.iter().find(|r| &r.output == output)
  }

  pub fn count(&self, state: NodeState) -> usize {
    self.results.iter().filter(|r| r.state == state).count()
  }

  /// Number of commands that actually executed (successfully or not).
  pub fn executed(&self) -> usize {
    self.results.iter().filter(|r| r.started.is_some() && r.state != NodeState::CacheHit).count()
  }

  pub fn total(&self) -> usize {
    self.results.len()
  }
}

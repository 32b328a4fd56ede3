//! Execution of a single graph node.
//!
//! A worker takes the output lock, waits for a pool permit, fingerprints the
//! command, consults the cache and only executes on a miss. Everything that
//! can go wrong is folded into the returned [`WorkOutcome`]; workers never
//! return errors to the scheduler.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheError, ContentCache, OutputRecord};
use crate::command::{CommandContext, CommandStatus};
use crate::fingerprint::{Fingerprint, FingerprintCalculator, FingerprintError};
use crate::graph::{GraphNode, NodeId};
use crate::locator::Locator;
use crate::log::{CommandLog, LogMessage, Severity};
use crate::session::BuildEvent;
use crate::util::hash::{ContentHash, HashError, hash_path};

use super::locks::OutputLocks;
use super::types::{CancelCause, CancelHandle, NodeState};

/// State shared by all workers of one session.
#[derive(Debug)]
pub(crate) struct WorkerShared {
  pub cache: ContentCache,
  pub calculator: Arc<FingerprintCalculator>,
  pub locks: OutputLocks,
  pub permits: Arc<Semaphore>,
  pub output_dir: PathBuf,
  pub force: bool,
  pub cancel: CancelHandle,
  pub events: Option<UnboundedSender<BuildEvent>>,
  pub session_start: Instant,
}

impl WorkerShared {
  pub fn emit(&self, event: BuildEvent) {
    if let Some(events) = &self.events {
      // A dropped receiver only means nobody is listening
      let _ = events.send(event);
    }
  }
}

/// What the scheduler learns when a worker finishes.
#[derive(Debug)]
pub(crate) struct WorkOutcome {
  pub id: NodeId,
  pub state: NodeState,
  pub fingerprint: Option<Fingerprint>,
  pub output_hash: Option<ContentHash>,
  pub cause: Option<CancelCause>,
  pub started: Option<Duration>,
  pub finished: Option<Duration>,
  pub messages: Vec<LogMessage>,
}

impl WorkOutcome {
  /// A failed outcome with nothing recorded yet.
  pub fn failed(id: NodeId) -> Self {
    Self {
      id,
      state: NodeState::Failed,
      fingerprint: None,
      output_hash: None,
      cause: None,
      started: None,
      finished: None,
      messages: Vec::new(),
    }
  }
}

/// Result of consulting the cache for one fingerprint.
enum CacheCheck {
  Hit(CacheEntry),
  Miss,
}

/// Run one node to a terminal state.
///
/// `produced` holds the output hashes of every producer of this node that
/// completed in the current session.
pub(crate) async fn run(
  shared: Arc<WorkerShared>,
  id: NodeId,
  node: GraphNode,
  produced: HashMap<Locator, ContentHash>,
) -> WorkOutcome {
  let log = CommandLog::new(node.title.clone());
  let mut outcome = WorkOutcome::failed(id);

  let _output_guard = shared.locks.lock(&node.output).await;
  let _permit = match shared.permits.clone().acquire_owned().await {
    Ok(permit) => permit,
    Err(_) => {
      outcome.state = NodeState::Cancelled;
      outcome.cause = Some(CancelCause::SessionCancelled);
      return outcome;
    }
  };

  if shared.cancel.is_cancelled() {
    debug!(command = %node.title, "session cancelled before start");
    outcome.state = NodeState::Cancelled;
    outcome.cause = Some(CancelCause::SessionCancelled);
    return outcome;
  }

  outcome.started = Some(shared.session_start.elapsed());
  shared.emit(BuildEvent::CommandStarted {
    title: node.title.clone(),
  });

  let (state, fingerprint, output_hash) = process(&shared, &node, produced, &log).await;
  outcome.state = state;
  outcome.fingerprint = fingerprint;
  outcome.output_hash = output_hash;
  outcome.finished = Some(shared.session_start.elapsed());
  outcome.messages = log.messages();
  outcome
}

async fn process(
  shared: &Arc<WorkerShared>,
  node: &GraphNode,
  produced: HashMap<Locator, ContentHash>,
  log: &CommandLog,
) -> (NodeState, Option<Fingerprint>, Option<ContentHash>) {
  let fingerprint = match compute_fingerprint(shared, node, produced).await {
    Ok(fingerprint) => fingerprint,
    Err(message) => {
      log.log(Severity::Error, message);
      return (NodeState::Failed, None, None);
    }
  };

  let output_path = node.output.resolve(&shared.output_dir);

  if shared.force {
    let cache = shared.cache.clone();
    let fp = fingerprint.clone();
    if let Ok(Err(e)) = tokio::task::spawn_blocking(move || cache.invalidate(&fp)).await {
      warn!(command = %node.title, error = %e, "failed to invalidate cache entry");
    }
  } else if let CacheCheck::Hit(entry) = check_cache(shared, node, &fingerprint, output_path.clone()).await {
    info!(command = %node.title, fingerprint = %fingerprint, "up to date");
    log.extend(entry.messages);
    commit_output(shared, node, &fingerprint, &entry.output_hash, log).await;
    return (NodeState::CacheHit, Some(fingerprint), Some(entry.output_hash));
  }

  info!(command = %node.title, fingerprint = %fingerprint, "executing");
  let status = execute(shared, node, log).await;

  match status {
    CommandStatus::Successful => {}
    CommandStatus::Failed => {
      warn!(command = %node.title, "command failed");
      forget_output(shared, node).await;
      return (NodeState::Failed, Some(fingerprint), None);
    }
    CommandStatus::Cancelled => {
      info!(command = %node.title, "command cancelled");
      forget_output(shared, node).await;
      return (NodeState::Cancelled, Some(fingerprint), None);
    }
  }

  let output_hash = match tokio::task::spawn_blocking(move || hash_path(&output_path)).await {
    Ok(Ok(hash)) => hash,
    Ok(Err(HashError::NotFound { .. })) => {
      log.log(
        Severity::Error,
        format!("command reported success but did not produce its output {}", node.output),
      );
      forget_output(shared, node).await;
      return (NodeState::Failed, Some(fingerprint), None);
    }
    Ok(Err(e)) => {
      log.log(Severity::Error, format!("failed to hash output {}: {e}", node.output));
      forget_output(shared, node).await;
      return (NodeState::Failed, Some(fingerprint), None);
    }
    Err(e) => {
      log.log(Severity::Fatal, format!("output hashing task failed: {e}"));
      forget_output(shared, node).await;
      return (NodeState::Failed, Some(fingerprint), None);
    }
  };

  let entry = CacheEntry::successful(
    fingerprint.clone(),
    node.command.type_tag(),
    node.output.clone(),
    output_hash.clone(),
    unix_now(),
    log.messages(),
  );
  let cache = shared.cache.clone();
  match tokio::task::spawn_blocking(move || cache.store(&entry)).await {
    Ok(Ok(())) => {}
    Ok(Err(e)) => log.log(Severity::Warning, format!("failed to store cache entry: {e}")),
    Err(e) => log.log(Severity::Warning, format!("cache store task failed: {e}")),
  }
  commit_output(shared, node, &fingerprint, &output_hash, log).await;

  (NodeState::Succeeded, Some(fingerprint), Some(output_hash))
}

/// Make this node's output the last known build of its URL.
async fn commit_output(
  shared: &Arc<WorkerShared>,
  node: &GraphNode,
  fingerprint: &Fingerprint,
  output_hash: &ContentHash,
  log: &CommandLog,
) {
  let index = shared.cache.outputs();
  let record = OutputRecord::new(node.output.clone(), output_hash.clone(), fingerprint.clone());

  let committed = tokio::task::spawn_blocking(move || match index.get(&record.output) {
    Ok(Some(current)) if current == record => Ok(()),
    _ => index.commit(&record),
  })
  .await;

  match committed {
    Ok(Ok(())) => {}
    Ok(Err(e)) => log.log(Severity::Warning, format!("failed to record output: {e}")),
    Err(e) => log.log(Severity::Warning, format!("output record task failed: {e}")),
  }
}

/// A failed execution may have clobbered the output, so its last known build
/// no longer describes what is on disk.
async fn forget_output(shared: &Arc<WorkerShared>, node: &GraphNode) {
  let index = shared.cache.outputs();
  let output = node.output.clone();
  if let Ok(Err(e)) = tokio::task::spawn_blocking(move || index.remove(&output)).await {
    warn!(command = %node.title, error = %e, "failed to forget output record");
  }
}

/// Resolve input hashes and derive the fingerprint off the async runtime.
async fn compute_fingerprint(
  shared: &Arc<WorkerShared>,
  node: &GraphNode,
  produced: HashMap<Locator, ContentHash>,
) -> Result<Fingerprint, String> {
  let calculator = shared.calculator.clone();
  let command = node.command.clone();

  let result = tokio::task::spawn_blocking(move || calculator.compute(&*command, &produced))
    .await
    .map_err(|e| format!("fingerprint task failed: {e}"))?;

  match result {
    Ok((fingerprint, _)) => Ok(fingerprint),
    Err(FingerprintError::InputMissing { locator }) => Err(format!("unable to find input {locator}")),
    Err(e) => Err(e.to_string()),
  }
}

/// Look up `fingerprint` and verify that the recorded output is still intact.
async fn check_cache(
  shared: &Arc<WorkerShared>,
  node: &GraphNode,
  fingerprint: &Fingerprint,
  output_path: PathBuf,
) -> CacheCheck {
  let cache = shared.cache.clone();
  let fp = fingerprint.clone();
  let output = node.output.clone();
  let title = node.title.clone();

  let check = tokio::task::spawn_blocking(move || match cache.lookup(&fp) {
    Ok(Some(entry)) => {
      let intact = entry.output == output
        && hash_path(&output_path)
          .map(|hash| hash == entry.output_hash)
          .unwrap_or(false);
      if intact {
        CacheCheck::Hit(entry)
      } else {
        warn!(command = %title, "cached output missing or modified, will rebuild");
        CacheCheck::Miss
      }
    }
    Ok(None) => CacheCheck::Miss,
    Err(e @ CacheError::Corrupt { .. }) => {
      warn!(command = %title, error = %e, "corrupt cache entry, will rebuild");
      if let Err(e) = cache.invalidate(&fp) {
        warn!(command = %title, error = %e, "failed to remove corrupt cache entry");
      }
      CacheCheck::Miss
    }
    Err(e) => {
      warn!(command = %title, error = %e, "cache lookup failed, will rebuild");
      CacheCheck::Miss
    }
  })
  .await;

  check.unwrap_or(CacheCheck::Miss)
}

/// Call `execute` on its own task so that a panic is contained.
async fn execute(shared: &Arc<WorkerShared>, node: &GraphNode, log: &CommandLog) -> CommandStatus {
  let ctx = CommandContext::new(
    shared.output_dir.clone(),
    node.output.clone(),
    node.inputs.clone(),
    log.clone(),
    shared.cancel.clone(),
  );
  let command = node.command.clone();

  match tokio::spawn(async move { command.execute(&ctx).await }).await {
    Ok(Ok(status)) => status,
    Ok(Err(e)) => {
      log.log(Severity::Fatal, format!("command error: {e}"));
      CommandStatus::Failed
    }
    Err(e) if e.is_panic() => {
      log.log(Severity::Fatal, format!("command panicked: {}", panic_message(e.into_panic())));
      CommandStatus::Failed
    }
    Err(e) => {
      log.log(Severity::Fatal, format!("command task aborted: {e}"));
      CommandStatus::Failed
    }
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

fn unix_now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

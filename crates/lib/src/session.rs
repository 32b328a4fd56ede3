//! Build sessions.
//!
//! A [`Builder`] owns the configuration, the cache handle and the output lock
//! table. Each call to [`Builder::run`] is one session: the submitted steps are
//! turned into a graph, scheduled to completion and summarized in a
//! [`BuildResult`]. Sessions of the same builder may overlap; they never write
//! the same output at the same time.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::cache::{CacheError, CacheLock, CacheLockError, ContentCache, LockMode};
use crate::config::BuildConfig;
use crate::execute::worker::WorkerShared;
use crate::execute::{self, BuildResult, CancelHandle, OutputLocks, ResultStatus};
use crate::fingerprint::FingerprintCalculator;
use crate::graph::{BuildGraph, GraphError};
use crate::step::BuildStep;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Progress notifications of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
  SessionStarted { commands: usize },
  CommandStarted { title: String },
  CommandFinished { title: String, status: ResultStatus },
  SessionFinished { status: ResultStatus, elapsed: Duration },
}

/// Errors that prevent a session from running at all.
///
/// Failures of individual commands are not errors; they are reported in the
/// [`BuildResult`].
#[derive(Debug, Error)]
pub enum BuildError {
  /// The submitted steps do not form a valid graph. No command was executed.
  #[error("invalid build configuration: {0}")]
  Configuration(#[from] GraphError),

  #[error(transparent)]
  CacheLock(#[from] CacheLockError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("failed to create output directory {path}: {source}")]
  OutputDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Entry point for running builds.
#[derive(Debug)]
pub struct Builder {
  config: BuildConfig,
  cache: ContentCache,
  locks: OutputLocks,
  cancel: CancelHandle,
  events: Option<UnboundedSender<BuildEvent>>,
}

impl Builder {
  /// Create a builder, opening (and creating) its cache directory.
  pub fn new(config: BuildConfig) -> Result<Self, BuildError> {
    let cache = ContentCache::open(&config.cache_dir)?;
    Ok(Self {
      config,
      cache,
      locks: OutputLocks::new(),
      cancel: CancelHandle::new(),
      events: None,
    })
  }

  /// Stream [`BuildEvent`]s of every session to `sender`.
  pub fn with_events(mut self, sender: UnboundedSender<BuildEvent>) -> Self {
    self.events = Some(sender);
    self
  }

  pub fn config(&self) -> &BuildConfig {
    &self.config
  }

  pub fn cache(&self) -> &ContentCache {
    &self.cache
  }

  /// Handle that cancels every running and future session of this builder.
  pub fn cancel_handle(&self) -> CancelHandle {
    self.cancel.clone()
  }

  /// Run one build session.
  ///
  /// # Errors
  ///
  /// Returns `BuildError::Configuration` for duplicate outputs or dependency
  /// cycles (before anything executes) and `BuildError::CacheLock` when the
  /// cache is exclusively locked by a prune.
  pub async fn run(&self, steps: &[BuildStep]) -> Result<BuildResult, BuildError> {
    let session_start = Instant::now();
    let graph = BuildGraph::from_steps(steps)?;

    let session = format!("build-{}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
    let _lock = CacheLock::acquire(self.cache.dir(), LockMode::Shared, &session)?;
    tokio::fs::create_dir_all(&self.config.output_dir)
      .await
      .map_err(|source| BuildError::OutputDir {
        path: self.config.output_dir.clone(),
        source,
      })?;

    info!(
      session = %session,
      commands = graph.len(),
      parallelism = self.config.workers(),
      force = self.config.force,
      "starting build"
    );

    let shared = Arc::new(WorkerShared {
      cache: self.cache.clone(),
      calculator: Arc::new(FingerprintCalculator::new(&self.config.output_dir).with_index(self.cache.outputs())),
      locks: self.locks.clone(),
      permits: Arc::new(Semaphore::new(self.config.workers())),
      output_dir: self.config.output_dir.clone(),
      force: self.config.force,
      cancel: self.cancel.clone(),
      events: self.events.clone(),
      session_start,
    });
    shared.emit(BuildEvent::SessionStarted { commands: graph.len() });

    let (results, cancelled) = execute::run(&graph, shared.clone()).await;
    let result = BuildResult::new(results, cancelled, session_start.elapsed());

    info!(
      session = %session,
      status = %result.status(),
      total = result.total(),
      executed = result.executed(),
      elapsed_ms = result.elapsed.as_millis() as u64,
      "build complete"
    );
    shared.emit(BuildEvent::SessionFinished {
      status: result.status(),
      elapsed: result.elapsed,
    });

    Ok(result)
  }
}

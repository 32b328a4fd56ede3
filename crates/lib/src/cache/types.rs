use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::CACHE_ENTRY_VERSION;
use crate::fingerprint::Fingerprint;
use crate::locator::Locator;
use crate::log::LogMessage;
use crate::util::hash::ContentHash;

/// Status recorded in a cache entry.
///
/// Only successful executions are cached; failures always re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachedStatus {
  Successful,
}

/// Persisted result of a previous command execution, keyed by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub version: u32,
  pub fingerprint: Fingerprint,
  pub type_tag: String,
  pub status: CachedStatus,
  pub output: Locator,
  /// Hash of the output at the time it was produced.
  pub output_hash: ContentHash,
  pub completed_at_unix: u64,
  /// Messages logged by the execution, replayed on cache hits.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub messages: Vec<LogMessage>,
}

impl CacheEntry {
  pub fn successful(
    fingerprint: Fingerprint,
    type_tag: impl Into<String>,
    output: Locator,
    output_hash: ContentHash,
    completed_at_unix: u64,
    messages: Vec<LogMessage>,
  ) -> Self {
    Self {
      version: CACHE_ENTRY_VERSION,
      fingerprint,
      type_tag: type_tag.into(),
      status: CachedStatus::Successful,
      output,
      output_hash,
      completed_at_unix,
      messages,
    }
  }
}

/// Errors from the content-addressable cache.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("failed to create cache directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read cache file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// The entry exists but cannot be trusted. Treated as a miss by the scheduler.
  #[error("corrupt cache file {path}: {reason}")]
  Corrupt { path: PathBuf, reason: String },

  #[error("failed to serialize cache entry: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("failed to write cache file {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to delete cache entry {path}: {source}")]
  Delete {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid fingerprint '{0}'")]
  InvalidFingerprint(String),

  #[error("pruning requires an exclusive cache lock")]
  ExclusiveLockRequired,

  #[error("lock on {lock_dir} does not cover cache {cache_dir}")]
  ForeignLock { lock_dir: PathBuf, cache_dir: PathBuf },
}

/// Outcome of pruning the cache.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PruneStats {
  pub entries_scanned: usize,
  pub entries_deleted: usize,
  pub corrupt_deleted: usize,
  pub bytes_freed: u64,
}

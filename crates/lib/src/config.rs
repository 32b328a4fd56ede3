//! Build configuration.
//!
//! Defaults come from the environment (`KILN_CACHE_DIR`, `KILN_OUTPUT_DIR`,
//! `KILN_PARALLELISM`) and fall back to the platform directories.

use std::path::PathBuf;

use tracing::warn;

use crate::consts::{CACHE_DIR_ENV, OUTPUT_DIR_ENV, PARALLELISM_ENV};
use crate::platform::paths;

/// Configuration for a [`Builder`](crate::session::Builder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
  /// Maximum number of commands executing at once. Values below 1 are treated as 1.
  pub parallelism: usize,

  /// Directory holding cache entries and the cache lock.
  pub cache_dir: PathBuf,

  /// Directory that storage URLs resolve into.
  pub output_dir: PathBuf,

  /// Ignore cache hits and re-execute every command.
  pub force: bool,
}

impl BuildConfig {
  /// A configuration rooted at explicit directories, with default parallelism.
  pub fn new(cache_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
    Self {
      parallelism: num_cpus(),
      cache_dir: cache_dir.into(),
      output_dir: output_dir.into(),
      force: false,
    }
  }

  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism;
    self
  }

  pub fn with_force(mut self, force: bool) -> Self {
    self.force = force;
    self
  }

  /// Effective worker count, never zero.
  pub fn workers(&self) -> usize {
    self.parallelism.max(1)
  }
}

impl Default for BuildConfig {
  fn default() -> Self {
    let cache_dir = std::env::var(CACHE_DIR_ENV)
      .map(PathBuf::from)
      .unwrap_or_else(|_| paths::cache_dir());
    let output_dir = std::env::var(OUTPUT_DIR_ENV)
      .map(PathBuf::from)
      .unwrap_or_else(|_| paths::output_dir());

    Self {
      parallelism: parallelism_from_env().unwrap_or_else(num_cpus),
      cache_dir,
      output_dir,
      force: false,
    }
  }
}

fn parallelism_from_env() -> Option<usize> {
  let raw = std::env::var(PARALLELISM_ENV).ok()?;
  match raw.trim().parse::<usize>() {
    Ok(n) if n > 0 => Some(n),
    _ => {
      warn!(value = %raw, "ignoring invalid {}", PARALLELISM_ENV);
      None
    }
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

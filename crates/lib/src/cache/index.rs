//! Last known output of every storage URL.
//!
//! When a command succeeds, the hash of the bytes it wrote is committed under
//! its output URL. A later session that reads the URL without rebuilding its
//! producer resolves the input through this record instead of hashing the
//! file again. A failed execution drops the record, since the file on disk can
//! no longer be trusted to hold a known build.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CacheError, write_atomically};
use crate::fingerprint::Fingerprint;
use crate::locator::{Locator, StorageUrl};
use crate::util::hash::{ContentHash, hash_bytes};

pub(crate) const OUTPUTS_DIR: &str = "outputs";
const RECORD_VERSION: u32 = 1;

/// What the index remembers about one storage URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
  pub version: u32,
  pub output: Locator,
  pub output_hash: ContentHash,
  /// Fingerprint of the execution that produced the output.
  pub fingerprint: Fingerprint,
}

impl OutputRecord {
  pub fn new(output: Locator, output_hash: ContentHash, fingerprint: Fingerprint) -> Self {
    Self {
      version: RECORD_VERSION,
      output,
      output_hash,
      fingerprint,
    }
  }
}

/// Persistent map from storage URL to its last successfully built content.
///
/// Only `Url` locators are indexed; plain files belong to the user and are
/// always hashed where they are.
#[derive(Debug, Clone)]
pub struct OutputIndex {
  dir: PathBuf,
}

impl OutputIndex {
  pub(crate) fn new(dir: PathBuf) -> Self {
    Self { dir }
  }

  fn record_path(&self, url: &StorageUrl) -> PathBuf {
    let key = hash_bytes(url.as_str().as_bytes()).0;
    self.dir.join(&key[..2]).join(format!("{key}.json"))
  }

  /// The record for `output`, if one was committed.
  ///
  /// Returns `CacheError::Corrupt` for an unreadable record or one filed under
  /// another URL.
  pub fn get(&self, output: &Locator) -> Result<Option<OutputRecord>, CacheError> {
    let Locator::Url(url) = output else {
      return Ok(None);
    };
    let path = self.record_path(url);

    let bytes = match fs::read(&path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(CacheError::Read { path, source }),
    };

    let record: OutputRecord = serde_json::from_slice(&bytes).map_err(|e| corrupt(&path, e.to_string()))?;
    if record.version != RECORD_VERSION {
      return Err(corrupt(&path, format!("unsupported record version {}", record.version)));
    }
    if record.output != *output {
      return Err(corrupt(&path, format!("record for {} filed under {}", record.output, output)));
    }
    Ok(Some(record))
  }

  /// Make `record` the last known output of its URL. Plain file outputs are
  /// ignored.
  pub fn commit(&self, record: &OutputRecord) -> Result<(), CacheError> {
    let Locator::Url(url) = &record.output else {
      return Ok(());
    };
    write_atomically(&self.record_path(url), &serde_json::to_vec_pretty(record)?)?;
    debug!(output = %record.output, hash = %record.output_hash, "committed output record");
    Ok(())
  }

  /// Forget `output`. Returns true if a record existed.
  pub fn remove(&self, output: &Locator) -> Result<bool, CacheError> {
    let Locator::Url(url) = output else {
      return Ok(false);
    };
    let path = self.record_path(url);
    match fs::remove_file(&path) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(source) => Err(CacheError::Delete { path, source }),
    }
  }
}

fn corrupt(path: &Path, reason: String) -> CacheError {
  CacheError::Corrupt {
    path: path.to_path_buf(),
    reason,
  }
}

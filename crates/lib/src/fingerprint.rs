//! Cache key derivation.
//!
//! A [`Fingerprint`] identifies the work a command would do: its type tag, its
//! canonical parameters, its output locator and the content hash of every
//! input. Two commands with equal fingerprints are assumed to produce
//! equivalent output.
//!
//! Inputs produced by other commands of the same session are hashed through
//! the producer's recorded output hash. Storage URLs built by an earlier
//! session resolve through the cache's output index; everything else is
//! hashed on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{trace, warn};

use crate::cache::OutputIndex;
use crate::command::Command;
use crate::consts::FINGERPRINT_VERSION;
use crate::locator::Locator;
use crate::util::hash::{ContentHash, HashError, canonical_json, hash_path};

/// Deterministic cache key of a command execution.
///
/// # Format
///
/// A lowercase hexadecimal SHA256 digest (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Error)]
pub enum FingerprintError {
  /// A declared input is neither produced by the session nor present on disk.
  #[error("input not found: {locator}")]
  InputMissing { locator: Locator },

  /// A declared input exists but could not be hashed.
  #[error("failed to hash input {locator}: {source}")]
  InputHash {
    locator: Locator,
    #[source]
    source: HashError,
  },

  #[error("failed to serialize parameters: {0}")]
  Parameters(#[from] serde_json::Error),
}

/// An input locator together with the hash of its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedInput {
  pub locator: Locator,
  pub hash: ContentHash,
}

/// The value whose serialization is hashed into a fingerprint.
#[derive(Serialize)]
struct FingerprintPayload<'a> {
  version: u32,
  type_tag: &'a str,
  parameters: String,
  output: &'a Locator,
  inputs: &'a [ResolvedInput],
}

/// Computes fingerprints for the commands of one session.
///
/// Hashes of external inputs are memoized, so a source file shared by many
/// commands is only read once per session.
#[derive(Debug)]
pub struct FingerprintCalculator {
  output_dir: PathBuf,
  index: Option<OutputIndex>,
  external: Mutex<HashMap<PathBuf, ContentHash>>,
}

impl FingerprintCalculator {
  pub fn new(output_dir: impl Into<PathBuf>) -> Self {
    Self {
      output_dir: output_dir.into(),
      index: None,
      external: Mutex::new(HashMap::new()),
    }
  }

  /// Resolve storage URLs through `index` before hashing them on disk.
  pub fn with_index(mut self, index: OutputIndex) -> Self {
    self.index = Some(index);
    self
  }

  pub fn output_dir(&self) -> &Path {
    &self.output_dir
  }

  /// Hash every declared input of a command.
  ///
  /// `produced` holds the output hashes of producers that already completed in
  /// this session; those take precedence over whatever is on disk.
  pub fn resolve_inputs(
    &self,
    inputs: &[Locator],
    produced: &HashMap<Locator, ContentHash>,
  ) -> Result<Vec<ResolvedInput>, FingerprintError> {
    inputs
      .iter()
      .map(|locator| {
        let hash = match produced.get(locator) {
          Some(hash) => hash.clone(),
          None => self.hash_external(locator)?,
        };
        Ok(ResolvedInput {
          locator: locator.clone(),
          hash,
        })
      })
      .collect()
  }

  /// Hash an input that no command of this session produces.
  pub fn hash_external(&self, locator: &Locator) -> Result<ContentHash, FingerprintError> {
    let path = locator.resolve(&self.output_dir);

    if let Some(hash) = self.indexed_hash(locator, &path) {
      return Ok(hash);
    }

    if let Some(hash) = self.external.lock().unwrap_or_else(|e| e.into_inner()).get(&path) {
      return Ok(hash.clone());
    }

    let hash = hash_path(&path).map_err(|e| match e {
      HashError::NotFound { .. } => FingerprintError::InputMissing {
        locator: locator.clone(),
      },
      source => FingerprintError::InputHash {
        locator: locator.clone(),
        source,
      },
    })?;

    trace!(input = %locator, hash = %hash, "hashed external input");
    self
      .external
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(path, hash.clone());

    Ok(hash)
  }

  /// The last committed hash of a storage URL whose file is still present.
  fn indexed_hash(&self, locator: &Locator, path: &Path) -> Option<ContentHash> {
    let index = self.index.as_ref()?;
    match index.get(locator) {
      Ok(Some(record)) if path.exists() => {
        trace!(input = %locator, hash = %record.output_hash, "resolved input through output index");
        Some(record.output_hash)
      }
      Ok(_) => None,
      Err(e) => {
        warn!(input = %locator, error = %e, "ignoring unreadable output record");
        None
      }
    }
  }

  /// Resolve the inputs of `command` and compute its fingerprint.
  pub fn compute(
    &self,
    command: &dyn Command,
    produced: &HashMap<Locator, ContentHash>,
  ) -> Result<(Fingerprint, Vec<ResolvedInput>), FingerprintError> {
    let inputs = self.resolve_inputs(&command.inputs(), produced)?;
    let fingerprint = fingerprint(command, &inputs)?;
    Ok((fingerprint, inputs))
  }
}

/// Compute the fingerprint of a command from already resolved inputs.
pub fn fingerprint(command: &dyn Command, inputs: &[ResolvedInput]) -> Result<Fingerprint, FingerprintError> {
  let parameters = command.parameters()?;
  let output = command.output();

  let payload = FingerprintPayload {
    version: FINGERPRINT_VERSION,
    type_tag: command.type_tag(),
    parameters: canonical_json(&parameters),
    output: &output,
    inputs,
  };

  let serialized = serde_json::to_string(&payload)?;
  let mut hasher = Sha256::new();
  hasher.update(serialized.as_bytes());
  Ok(Fingerprint(hex::encode(hasher.finalize())))
}

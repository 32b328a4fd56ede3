//! Content hashing for inputs, outputs and parameters.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

/// Lowercase hex SHA256 of some content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Error)]
pub enum HashError {
  #[error("nothing exists at {path}")]
  NotFound { path: PathBuf },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Hash whatever lives at `path`.
///
/// A file hashes to the digest of its bytes. A directory hashes to the digest
/// of a manifest listing every entry below it by relative path, so renames and
/// moves change the hash while timestamps and permissions do not.
pub fn hash_path(path: &Path) -> Result<ContentHash, HashError> {
  let metadata = match fs::metadata(path) {
    Ok(metadata) => metadata,
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      return Err(HashError::NotFound {
        path: path.to_path_buf(),
      });
    }
    Err(source) => {
      return Err(HashError::Read {
        path: path.to_path_buf(),
        source,
      });
    }
  };

  if metadata.is_dir() {
    hash_tree(path)
  } else {
    hash_file(path)
  }
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

/// Render `value` with object keys sorted at every depth, so equal values
/// always produce equal text regardless of insertion order.
pub fn canonical_json(value: &Value) -> String {
  match value {
    Value::Array(items) => {
      let items: Vec<String> = items.iter().map(canonical_json).collect();
      format!("[{}]", items.join(","))
    }
    Value::Object(map) => {
      let mut fields: Vec<(&String, &Value)> = map.iter().collect();
      fields.sort_by_key(|(key, _)| *key);
      let fields: Vec<String> = fields
        .into_iter()
        .map(|(key, value)| format!("{}:{}", Value::from(key.as_str()), canonical_json(value)))
        .collect();
      format!("{{{}}}", fields.join(","))
    }
    scalar => scalar.to_string(),
  }
}

fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let read_error = |source| HashError::Read {
    path: path.to_path_buf(),
    source,
  };
  let mut file = File::open(path).map_err(read_error)?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher).map_err(read_error)?;
  Ok(ContentHash(hex::encode(hasher.finalize())))
}

fn hash_tree(root: &Path) -> Result<ContentHash, HashError> {
  let mut manifest = Sha256::new();

  for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|e| {
      let path = e.path().unwrap_or(root).to_path_buf();
      HashError::Read {
        path,
        source: e.into(),
      }
    })?;

    // Forward slashes keep the manifest identical across platforms
    let relative = entry
      .path()
      .strip_prefix(root)
      .unwrap_or(entry.path())
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/");

    let kind = entry.file_type();
    let line = if kind.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|source| HashError::Read {
        path: entry.path().to_path_buf(),
        source,
      })?;
      format!("link {relative} {}\n", target.to_string_lossy())
    } else if kind.is_dir() {
      format!("dir {relative}\n")
    } else if kind.is_file() {
      format!("file {relative} {}\n", hash_file(entry.path())?)
    } else {
      continue;
    };
    manifest.update(line.as_bytes());
  }

  Ok(ContentHash(hex::encode(manifest.finalize())))
}

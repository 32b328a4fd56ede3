//! Content-addressable result cache.
//!
//! Maps a [`Fingerprint`] to the [`CacheEntry`] describing the last successful
//! execution of a command with that fingerprint.
//!
//! # Layout
//!
//! ```text
//! <cache_dir>/
//! ├── .lock
//! ├── holders/
//! │   └── <pid>-<n>.json
//! ├── outputs/
//! │   └── 7c/
//! │       └── 7c01...4d.json
//! └── entries/
//!     └── ab/
//!         └── ab3f...e9.json
//! ```
//!
//! Entries are sharded by the first two hex characters of the fingerprint and
//! published atomically (staging file in the shard directory, then rename), so
//! a reader never observes a half-written entry.

pub mod index;
pub mod lock;
mod types;

pub use index::{OutputIndex, OutputRecord};
pub use lock::{CacheLock, CacheLockError, LockHolder, LockMode};
pub use types::*;

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::consts::{CACHE_ENTRY_VERSION, HASH_HEX_LEN};
use crate::fingerprint::Fingerprint;

const ENTRIES_DIR: &str = "entries";
const ENTRY_EXTENSION: &str = "json";

/// Handle to an on-disk cache directory.
///
/// All operations are synchronous file I/O; async callers run them through
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct ContentCache {
  dir: PathBuf,
}

impl ContentCache {
  /// Open (and create if needed) the cache rooted at `dir`.
  pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
    let dir = dir.into();
    let entries = dir.join(ENTRIES_DIR);
    fs::create_dir_all(&entries).map_err(|source| CacheError::CreateDir { path: entries, source })?;
    Ok(Self { dir })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// The index of last known outputs kept alongside the entries.
  pub fn outputs(&self) -> OutputIndex {
    OutputIndex::new(self.dir.join(index::OUTPUTS_DIR))
  }

  /// Path of the entry file for `fingerprint`.
  ///
  /// Fails for anything that is not a full lowercase hex digest, so a
  /// fingerprint can never address a file outside the entries directory.
  pub fn entry_path(&self, fingerprint: &Fingerprint) -> Result<PathBuf, CacheError> {
    let fp = &fingerprint.0;
    let valid = fp.len() == HASH_HEX_LEN && fp.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !valid {
      return Err(CacheError::InvalidFingerprint(fp.clone()));
    }

    Ok(
      self
        .dir
        .join(ENTRIES_DIR)
        .join(&fp[..2])
        .join(format!("{fp}.{ENTRY_EXTENSION}")),
    )
  }

  /// Look up the entry for `fingerprint`.
  ///
  /// Returns `Ok(None)` on a miss and `CacheError::Corrupt` when an entry
  /// exists but is malformed, has an unsupported version or is filed under the
  /// wrong fingerprint.
  pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
    let path = self.entry_path(fingerprint)?;

    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(CacheError::Read { path, source }),
    };

    let entry = parse_entry(&path, &content)?;
    if entry.fingerprint != *fingerprint {
      return Err(CacheError::Corrupt {
        path,
        reason: format!("entry is filed under {} but records {}", fingerprint, entry.fingerprint),
      });
    }

    debug!(fingerprint = %fingerprint, "cache hit");
    Ok(Some(entry))
  }

  /// Publish `entry`, replacing any previous entry with the same fingerprint.
  pub fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
    let path = self.entry_path(&entry.fingerprint)?;
    write_atomically(&path, &serde_json::to_vec_pretty(entry)?)?;
    debug!(fingerprint = %entry.fingerprint, path = %path.display(), "stored cache entry");
    Ok(())
  }

  /// Remove the entry for `fingerprint`. Returns true if an entry existed.
  pub fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
    let path = self.entry_path(fingerprint)?;
    match fs::remove_file(&path) {
      Ok(()) => {
        debug!(fingerprint = %fingerprint, "invalidated cache entry");
        Ok(true)
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(source) => Err(CacheError::Delete { path, source }),
    }
  }

  /// List every readable entry. Corrupt entries are skipped with a warning.
  pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
    let mut entries = Vec::new();
    for path in self.entry_files()? {
      match read_entry(&path) {
        Ok(entry) => entries.push(entry),
        Err(e) => warn!(error = %e, "skipping unreadable cache entry"),
      }
    }
    entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    Ok(entries)
  }

  /// Delete every entry whose fingerprint is not in `keep`.
  ///
  /// Corrupt entries and leftover staging files are always deleted. Requires
  /// an exclusive [`CacheLock`] on this cache so no session can be reading
  /// entries while they disappear.
  pub fn prune(&self, keep: &HashSet<Fingerprint>, lock: &CacheLock) -> Result<PruneStats, CacheError> {
    if lock.cache_dir() != self.dir {
      return Err(CacheError::ForeignLock {
        lock_dir: lock.cache_dir().to_path_buf(),
        cache_dir: self.dir.clone(),
      });
    }
    if lock.mode() != LockMode::Exclusive {
      return Err(CacheError::ExclusiveLockRequired);
    }

    let mut stats = PruneStats::default();

    for path in self.entry_files()? {
      stats.entries_scanned += 1;
      let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

      let corrupt = match read_entry(&path) {
        Ok(entry) if keep.contains(&entry.fingerprint) => continue,
        Ok(_) => false,
        Err(e) => {
          warn!(error = %e, "deleting corrupt cache entry");
          true
        }
      };

      fs::remove_file(&path).map_err(|source| CacheError::Delete {
        path: path.clone(),
        source,
      })?;
      stats.bytes_freed += size;
      if corrupt {
        stats.corrupt_deleted += 1;
      } else {
        stats.entries_deleted += 1;
      }
    }

    for path in self.staging_files()? {
      let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
      if fs::remove_file(&path).is_ok() {
        stats.bytes_freed += size;
      }
    }

    self.remove_empty_shards();

    info!(
      scanned = stats.entries_scanned,
      deleted = stats.entries_deleted,
      corrupt = stats.corrupt_deleted,
      bytes = stats.bytes_freed,
      "pruned cache"
    );
    Ok(stats)
  }

  fn entries_dir(&self) -> PathBuf {
    self.dir.join(ENTRIES_DIR)
  }

  /// All `*.json` files under the entries directory, sorted by path.
  fn entry_files(&self) -> Result<Vec<PathBuf>, CacheError> {
    self.walk_files(|path| path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
  }

  /// Staging files abandoned by an interrupted `store`.
  fn staging_files(&self) -> Result<Vec<PathBuf>, CacheError> {
    self.walk_files(|path| {
      path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(".tmp"))
    })
  }

  fn walk_files(&self, filter: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>, CacheError> {
    let root = self.entries_dir();
    if !root.exists() {
      return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&root).min_depth(2).max_depth(2).sort_by_file_name() {
      let entry = entry.map_err(|e| CacheError::Read {
        path: root.clone(),
        source: io::Error::other(e),
      })?;
      if entry.file_type().is_file() && filter(entry.path()) {
        files.push(entry.into_path());
      }
    }
    Ok(files)
  }

  fn remove_empty_shards(&self) {
    let Ok(shards) = fs::read_dir(self.entries_dir()) else {
      return;
    };
    for shard in shards.flatten() {
      // remove_dir only succeeds on empty directories
      let _ = fs::remove_dir(shard.path());
    }
  }
}

/// Write `content` to `path` through a staging file in the same directory, so
/// readers see either the old file or the complete new one.
pub(crate) fn write_atomically(path: &Path, content: &[u8]) -> Result<(), CacheError> {
  let parent = path.parent().unwrap_or(Path::new("."));
  fs::create_dir_all(parent).map_err(|source| CacheError::CreateDir {
    path: parent.to_path_buf(),
    source,
  })?;

  let write_err = |source| CacheError::Write {
    path: path.to_path_buf(),
    source,
  };
  let mut staging = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
  staging.write_all(content).map_err(write_err)?;
  staging.as_file().sync_all().map_err(write_err)?;
  staging.persist(path).map_err(|e| write_err(e.error))?;
  Ok(())
}

fn read_entry(path: &Path) -> Result<CacheEntry, CacheError> {
  let content = fs::read_to_string(path).map_err(|source| CacheError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  parse_entry(path, &content)
}

fn parse_entry(path: &Path, content: &str) -> Result<CacheEntry, CacheError> {
  let entry: CacheEntry = serde_json::from_str(content).map_err(|e| CacheError::Corrupt {
    path: path.to_path_buf(),
    reason: e.to_string(),
  })?;

  if entry.version != CACHE_ENTRY_VERSION {
    return Err(CacheError::Corrupt {
      path: path.to_path_buf(),
      reason: format!("unsupported entry version {}", entry.version),
    });
  }

  Ok(entry)
}

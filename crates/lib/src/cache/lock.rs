//! Advisory locking of a cache directory.
//!
//! Every build session holds a shared lock while it runs and pruning needs the
//! exclusive one, so entries never disappear underneath a running session.
//! The OS-level lock lives on `<cache>/.lock`. Each holder also leaves a
//! record under `<cache>/holders/` naming its process and session, which is
//! what a refused caller gets to see.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const LOCK_FILE: &str = ".lock";
const HOLDERS_DIR: &str = "holders";

static NEXT_RECORD: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
  /// Held by build sessions; any number may coexist.
  Shared,
  /// Held by maintenance such as pruning; excludes everyone else.
  Exclusive,
}

impl fmt::Display for LockMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LockMode::Shared => f.write_str("shared"),
      LockMode::Exclusive => f.write_str("exclusive"),
    }
  }
}

/// One party holding a lock on the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  /// Session or maintenance task that took the lock, e.g. `build-3`.
  pub session: String,
  pub mode: LockMode,
  pub acquired_at_unix: u64,
}

impl fmt::Display for LockHolder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({} lock, pid {})", self.session, self.mode, self.pid)
  }
}

#[derive(Debug, Error)]
pub enum CacheLockError {
  /// The lock is held in a conflicting mode.
  #[error("cache {cache} is in use by {}", describe_holders(.holders))]
  Busy { cache: PathBuf, holders: Vec<LockHolder> },

  #[error("cache lock I/O failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn describe_holders(holders: &[LockHolder]) -> String {
  if holders.is_empty() {
    return "a process that left no holder record".to_string();
  }
  holders.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// A held lock on a cache directory. Dropping it releases the lock and
/// removes this holder's record.
#[derive(Debug)]
pub struct CacheLock {
  _file: File,
  cache_dir: PathBuf,
  record: PathBuf,
  holder: LockHolder,
}

impl CacheLock {
  /// Lock `cache_dir` in `mode` on behalf of `session`, without waiting.
  ///
  /// # Errors
  ///
  /// `CacheLockError::Busy` lists the recorded holders when the lock is taken
  /// in a conflicting mode.
  pub fn acquire(cache_dir: &Path, mode: LockMode, session: &str) -> Result<Self, CacheLockError> {
    let holders_dir = cache_dir.join(HOLDERS_DIR);
    fs::create_dir_all(&holders_dir).map_err(|source| CacheLockError::Io {
      path: holders_dir.clone(),
      source,
    })?;

    let lock_path = cache_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|source| CacheLockError::Io {
        path: lock_path.clone(),
        source,
      })?;

    match try_lock(&file, mode) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        return Err(CacheLockError::Busy {
          cache: cache_dir.to_path_buf(),
          holders: read_holders(&holders_dir),
        });
      }
      Err(source) => return Err(CacheLockError::Io { path: lock_path, source }),
    }

    if mode == LockMode::Exclusive {
      // Nobody else can hold the lock, so every remaining record is stale
      for stale in record_files(&holders_dir) {
        let _ = fs::remove_file(stale);
      }
    }

    let holder = LockHolder {
      pid: std::process::id(),
      session: session.to_string(),
      mode,
      acquired_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };
    let record = holders_dir.join(format!(
      "{}-{}.json",
      holder.pid,
      NEXT_RECORD.fetch_add(1, Ordering::Relaxed)
    ));
    let json = serde_json::to_vec(&holder).map_err(|e| CacheLockError::Io {
      path: record.clone(),
      source: io::Error::other(e),
    })?;
    fs::write(&record, json).map_err(|source| CacheLockError::Io {
      path: record.clone(),
      source,
    })?;

    debug!(cache = %cache_dir.display(), session, mode = %mode, "acquired cache lock");
    Ok(Self {
      _file: file,
      cache_dir: cache_dir.to_path_buf(),
      record,
      holder,
    })
  }

  /// The cache directory this lock was taken on.
  pub fn cache_dir(&self) -> &Path {
    &self.cache_dir
  }

  pub fn mode(&self) -> LockMode {
    self.holder.mode
  }

  pub fn holder(&self) -> &LockHolder {
    &self.holder
  }

  /// Every holder currently recorded for the cache, this one included.
  pub fn holders(&self) -> Vec<LockHolder> {
    read_holders(&self.cache_dir.join(HOLDERS_DIR))
  }
}

impl Drop for CacheLock {
  fn drop(&mut self) {
    if let Err(e) = fs::remove_file(&self.record)
      && e.kind() != io::ErrorKind::NotFound
    {
      warn!(record = %self.record.display(), error = %e, "failed to remove cache lock record");
    }
  }
}

fn record_files(holders_dir: &Path) -> Vec<PathBuf> {
  let Ok(dir) = fs::read_dir(holders_dir) else {
    return Vec::new();
  };
  dir
    .flatten()
    .map(|entry| entry.path())
    .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
    .collect()
}

/// Parse every readable holder record. Records being written concurrently
/// may not parse yet and are skipped.
fn read_holders(holders_dir: &Path) -> Vec<LockHolder> {
  let mut holders: Vec<LockHolder> = record_files(holders_dir)
    .iter()
    .filter_map(|path| fs::read(path).ok())
    .filter_map(|bytes| serde_json::from_slice(&bytes).ok())
    .collect();
  holders.sort_by(|a, b| (a.acquired_at_unix, &a.session).cmp(&(b.acquired_at_unix, &b.session)));
  holders
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  flock(file, operation).map_err(io::Error::from)
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};
  use windows_sys::Win32::System::IO::OVERLAPPED;

  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: the handle stays open for the duration of the call and a zeroed
  // OVERLAPPED requests a lock starting at offset 0.
  let locked = unsafe {
    let mut overlapped: OVERLAPPED = std::mem::zeroed();
    LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped)
  };

  if locked != 0 {
    return Ok(());
  }
  let err = io::Error::last_os_error();
  if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
    Err(io::ErrorKind::WouldBlock.into())
  } else {
    Err(err)
  }
}

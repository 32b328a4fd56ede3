//! Per-output mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::locator::Locator;

type LockTable = Arc<Mutex<HashMap<Locator, Arc<AsyncMutex<()>>>>>;

/// Table of async locks keyed by output locator.
///
/// Shared by every session of a builder so that two overlapping sessions never
/// write the same output at the same time. An entry lives only while someone
/// holds or waits for it.
#[derive(Debug, Clone, Default)]
pub struct OutputLocks {
  table: LockTable,
}

impl OutputLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `output`. Released when the guard drops.
  pub async fn lock(&self, output: &Locator) -> OutputGuard {
    let mutex = {
      let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
      table.entry(output.clone()).or_default().clone()
    };
    OutputGuard {
      guard: Some(mutex.lock_owned().await),
      output: output.clone(),
      table: self.table.clone(),
    }
  }

  /// Number of outputs currently held or waited for.
  pub fn len(&self) -> usize {
    self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Exclusive access to one output.
#[derive(Debug)]
pub struct OutputGuard {
  guard: Option<OwnedMutexGuard<()>>,
  output: Locator,
  table: LockTable,
}

impl Drop for OutputGuard {
  fn drop(&mut self) {
    // Waiters clone the mutex under the table lock, so a count of one seen
    // under the same lock means nobody else can reach the entry.
    let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
    self.guard.take();
    if table.get(&self.output).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
      table.remove(&self.output);
    }
  }
}

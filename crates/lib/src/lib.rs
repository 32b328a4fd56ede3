//! kiln-lib: incremental asset build engine
//!
//! This crate schedules, caches and executes opaque asset commands:
//! - `Command`: a unit of work with declared inputs and one declared output
//! - `BuildGraph`: the producer/consumer DAG of a session
//! - `ContentCache`: fingerprint-addressed results of earlier executions
//! - `Builder`: runs sessions and reports a `BuildResult`

pub mod cache;
pub mod command;
pub mod config;
pub mod consts;
pub mod execute;
pub mod fingerprint;
pub mod graph;
pub mod locator;
pub mod log;
pub mod platform;
pub mod session;
pub mod step;
pub mod util;

pub use cache::{
  CacheEntry, CacheError, CacheLock, CacheLockError, ContentCache, LockHolder, LockMode, OutputIndex, OutputRecord,
  PruneStats,
};
pub use command::{Command, CommandContext, CommandError, CommandStatus, ImportFile};
pub use config::BuildConfig;
pub use execute::{BuildResult, CancelCause, CancelHandle, CommandResult, NodeState, ResultStatus};
pub use fingerprint::{Fingerprint, FingerprintCalculator, FingerprintError};
pub use graph::{BuildGraph, GraphError};
pub use locator::{Locator, StorageUrl};
pub use log::{LogMessage, Severity};
pub use session::{BuildError, BuildEvent, Builder};
pub use step::{BuildStep, StepOrder};

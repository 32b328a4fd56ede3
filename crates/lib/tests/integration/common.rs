//! Shared test helpers for engine integration tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kiln_lib::{BuildConfig, Builder, Command, CommandContext, CommandError, CommandStatus, ContentCache, Locator};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own temporary directory with separate source, cache and
/// output directories.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn config(&self) -> BuildConfig {
    BuildConfig::new(self.cache_dir(), self.output_dir()).with_parallelism(4)
  }

  pub fn builder(&self) -> Builder {
    Builder::new(self.config()).unwrap()
  }

  pub fn cache_dir(&self) -> PathBuf {
    self.temp.path().join("cache")
  }

  pub fn output_dir(&self) -> PathBuf {
    self.temp.path().join("out")
  }

  pub fn cache(&self) -> ContentCache {
    ContentCache::open(self.cache_dir()).unwrap()
  }

  /// Write a source file relative to the `src` directory.
  pub fn write_source(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join("src").join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Path an output URL resolves to.
  pub fn output_path(&self, url: &str) -> PathBuf {
    Locator::url(url).resolve(&self.output_dir())
  }

  pub fn read_output(&self, url: &str) -> String {
    std::fs::read_to_string(self.output_path(url)).unwrap()
  }
}

/// Tracks how many executions overlap.
#[derive(Debug, Default)]
pub struct OverlapGauge {
  current: AtomicUsize,
  max: AtomicUsize,
}

impl OverlapGauge {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn enter(&self) {
    let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.max.fetch_max(now, Ordering::SeqCst);
  }

  fn exit(&self) {
    self.current.fetch_sub(1, Ordering::SeqCst);
  }

  pub fn max(&self) -> usize {
    self.max.load(Ordering::SeqCst)
  }
}

/// Writes a prefix followed by the bytes of every input.
#[derive(Debug)]
pub struct Concat {
  pub output: String,
  pub inputs: Vec<Locator>,
  pub prefix: String,
  pub delay: Duration,
  pub fail: bool,
  pub gauge: Option<Arc<OverlapGauge>>,
  runs: Arc<AtomicUsize>,
}

impl Concat {
  pub fn new(output: &str, prefix: &str) -> Self {
    Self {
      output: output.to_string(),
      inputs: Vec::new(),
      prefix: prefix.to_string(),
      delay: Duration::ZERO,
      fail: false,
      gauge: None,
      runs: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn reads(mut self, url: &str) -> Self {
    self.inputs.push(Locator::url(url));
    self
  }

  pub fn reads_file(mut self, path: impl Into<PathBuf>) -> Self {
    self.inputs.push(Locator::file(path));
    self
  }

  pub fn failing(mut self) -> Self {
    self.fail = true;
    self
  }

  pub fn slow(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn gauged(mut self, gauge: &Arc<OverlapGauge>) -> Self {
    self.gauge = Some(gauge.clone());
    self
  }

  pub fn counter(&self) -> Arc<AtomicUsize> {
    self.runs.clone()
  }
}

#[async_trait]
impl Command for Concat {
  fn type_tag(&self) -> &str {
    "concat"
  }

  fn parameters(&self) -> Result<Value, serde_json::Error> {
    Ok(json!({ "prefix": self.prefix, "fail": self.fail }))
  }

  fn inputs(&self) -> Vec<Locator> {
    self.inputs.clone()
  }

  fn output(&self) -> Locator {
    Locator::url(&self.output)
  }

  async fn execute(&self, ctx: &CommandContext) -> Result<CommandStatus, CommandError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    if let Some(gauge) = &self.gauge {
      gauge.enter();
    }
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if let Some(gauge) = &self.gauge {
      gauge.exit();
    }

    if self.fail {
      ctx.error(format!("cannot build {}", self.output));
      return Ok(CommandStatus::Failed);
    }

    let mut bytes = self.prefix.clone().into_bytes();
    for input in ctx.input_paths() {
      bytes.extend(tokio::fs::read(&input).await?);
    }

    let path = ctx.output_path();
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, bytes).await?;
    ctx.verbose(format!("wrote {}", self.output));

    if ctx.is_cancelled() {
      ctx.warning("finished after the session was cancelled");
    }
    Ok(CommandStatus::Successful)
  }
}

pub fn runs(counter: &Arc<AtomicUsize>) -> usize {
  counter.load(Ordering::SeqCst)
}

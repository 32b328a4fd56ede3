//! Test utilities for kiln-lib.
//!
//! Provides a configurable stub command for exercising the graph builder and
//! the scheduler without a real asset compiler.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::command::{Command, CommandContext, CommandError, CommandStatus};
use crate::locator::Locator;

/// What a [`StubCommand`] does when executed.
#[derive(Debug, Clone)]
pub enum Behavior {
  /// Write the given content followed by the bytes of every input.
  Write(String),
  /// Log an error and report `Failed`.
  Fail,
  /// Return `Err(CommandError)`.
  Error,
  /// Panic inside `execute`.
  Panic,
  /// Report success without writing the output.
  NoOutput,
  /// Report `Cancelled` without writing anything.
  Cancel,
}

#[derive(Debug)]
pub struct StubCommand {
  pub output: Locator,
  pub inputs: Vec<Locator>,
  pub behavior: Behavior,
  pub delay: Duration,
  runs: Arc<AtomicUsize>,
}

impl StubCommand {
  /// A command writing `content` to the storage URL `output`.
  pub fn writes(output: &str, content: &str) -> Self {
    Self {
      output: Locator::url(output),
      inputs: Vec::new(),
      behavior: Behavior::Write(content.to_string()),
      delay: Duration::ZERO,
      runs: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn failing(output: &str) -> Self {
    Self::writes(output, "").with_behavior(Behavior::Fail)
  }

  /// Add storage URL inputs.
  pub fn reads(mut self, urls: &[&str]) -> Self {
    self.inputs.extend(urls.iter().map(|u| Locator::url(*u)));
    self
  }

  pub fn with_input(mut self, input: Locator) -> Self {
    self.inputs.push(input);
    self
  }

  pub fn with_behavior(mut self, behavior: Behavior) -> Self {
    self.behavior = behavior;
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  /// Shared execution counter.
  pub fn counter(&self) -> Arc<AtomicUsize> {
    self.runs.clone()
  }
}

#[async_trait]
impl Command for StubCommand {
  fn type_tag(&self) -> &str {
    "stub"
  }

  fn parameters(&self) -> Result<Value, serde_json::Error> {
    let content = match &self.behavior {
      Behavior::Write(content) => content.clone(),
      other => format!("{other:?}"),
    };
    Ok(json!({ "content": content }))
  }

  fn inputs(&self) -> Vec<Locator> {
    self.inputs.clone()
  }

  fn output(&self) -> Locator {
    self.output.clone()
  }

  async fn execute(&self, ctx: &CommandContext) -> Result<CommandStatus, CommandError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }

    match &self.behavior {
      Behavior::Write(content) => {
        let mut bytes = content.clone().into_bytes();
        for input in ctx.input_paths() {
          bytes.extend(tokio::fs::read(&input).await?);
        }
        let path = ctx.output_path();
        if let Some(parent) = path.parent() {
          tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        ctx.info("wrote output");
        Ok(CommandStatus::Successful)
      }
      Behavior::Fail => {
        ctx.error("stub failure");
        Ok(CommandStatus::Failed)
      }
      Behavior::Error => Err(CommandError::Other("stub error".to_string())),
      Behavior::Panic => panic!("stub panic"),
      Behavior::NoOutput => Ok(CommandStatus::Successful),
      Behavior::Cancel => Ok(CommandStatus::Cancelled),
    }
  }
}

//! Raw file import.
//!
//! Copies a source file verbatim into a storage URL. This is the simplest
//! possible asset command and doubles as an example for command authors.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;

use super::{Command, CommandContext, CommandError, CommandStatus};
use crate::locator::Locator;

pub const IMPORT_FILE_TAG: &str = "import-file";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFile {
  /// Source file on disk.
  pub source: PathBuf,
  /// Storage URL the file is imported to.
  pub target: String,
}

impl ImportFile {
  pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
    Self {
      source: source.into(),
      target: target.into(),
    }
  }
}

#[async_trait]
impl Command for ImportFile {
  fn type_tag(&self) -> &str {
    IMPORT_FILE_TAG
  }

  fn parameters(&self) -> Result<Value, serde_json::Error> {
    serde_json::to_value(self)
  }

  fn inputs(&self) -> Vec<Locator> {
    vec![Locator::File(self.source.clone())]
  }

  fn output(&self) -> Locator {
    Locator::url(&self.target)
  }

  async fn execute(&self, ctx: &CommandContext) -> Result<CommandStatus, CommandError> {
    if fs::metadata(&self.source).await.is_err() {
      ctx.error(format!("unable to find the source file '{}'", self.source.display()));
      return Ok(CommandStatus::Failed);
    }

    let destination = ctx.output_path();
    if let Some(parent) = destination.parent() {
      fs::create_dir_all(parent).await?;
    }

    let bytes = fs::copy(&self.source, &destination).await?;
    ctx.verbose(format!("imported {} bytes to {}", bytes, destination.display()));

    Ok(CommandStatus::Successful)
  }
}

//! Build step trees submitted to a session.

use std::sync::Arc;

use crate::command::Command;

/// How the children of a [`BuildStep::Group`] relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepOrder {
  /// Children only depend on each other through declared inputs and outputs.
  #[default]
  Unordered,
  /// Every command of child `i` reaches a terminal state before any command
  /// of child `i + 1` starts.
  Sequential,
}

/// A node of the build step tree.
#[derive(Debug, Clone)]
pub enum BuildStep {
  Command(Arc<dyn Command>),
  Group {
    /// Asset the commands of this group belong to, inherited by nested groups
    /// that don't name their own.
    asset: Option<String>,
    order: StepOrder,
    steps: Vec<BuildStep>,
  },
}

impl BuildStep {
  pub fn command(command: impl Command + 'static) -> Self {
    BuildStep::Command(Arc::new(command))
  }

  /// An unordered, unnamed group.
  pub fn group(steps: Vec<BuildStep>) -> Self {
    BuildStep::Group {
      asset: None,
      order: StepOrder::Unordered,
      steps,
    }
  }

  /// A group whose children run one after another.
  pub fn sequence(steps: Vec<BuildStep>) -> Self {
    BuildStep::Group {
      asset: None,
      order: StepOrder::Sequential,
      steps,
    }
  }

  /// An unordered group of the commands building one asset.
  pub fn asset(name: impl Into<String>, steps: Vec<BuildStep>) -> Self {
    BuildStep::Group {
      asset: Some(name.into()),
      order: StepOrder::Unordered,
      steps,
    }
  }

  /// Number of commands in this subtree.
  pub fn command_count(&self) -> usize {
    match self {
      BuildStep::Command(_) => 1,
      BuildStep::Group { steps, .. } => steps.iter().map(BuildStep::command_count).sum(),
    }
  }
}

impl<C: Command + 'static> From<C> for BuildStep {
  fn from(command: C) -> Self {
    BuildStep::command(command)
  }
}

//! Command scheduling.
//!
//! The scheduler walks a [`BuildGraph`] event by event: every node whose
//! producers all succeeded is handed to a worker task, and each worker
//! completion updates the ready set. It handles:
//! - Bounded parallelism (the permit is acquired inside the worker)
//! - Failure and cancellation propagation to every transitive consumer
//! - Session cancellation (no new dispatch, running commands finish)

pub mod locks;
pub mod types;
pub(crate) mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::graph::{BuildGraph, NodeId};
use crate::locator::Locator;
use crate::log::{LogMessage, Severity};
use crate::session::BuildEvent;
use crate::util::hash::ContentHash;

pub use locks::{OutputGuard, OutputLocks};
pub use types::{BuildResult, CancelCause, CancelHandle, CommandResult, NodeState, ResultStatus};

use worker::{WorkOutcome, WorkerShared};

/// Mutable per-session bookkeeping, owned by the scheduler loop.
struct Scheduler<'a> {
  graph: &'a BuildGraph,
  shared: Arc<WorkerShared>,
  states: Vec<NodeState>,
  /// Producers of each node that have not reached a successful state yet.
  remaining: Vec<usize>,
  produced: HashMap<Locator, ContentHash>,
  ready: VecDeque<NodeId>,
  /// Node of every worker task still in the join set.
  running: HashMap<task::Id, NodeId>,
  results: Vec<CommandResult>,
}

/// Run every node of `graph` to a terminal state.
///
/// # Returns
///
/// The per-command results in completion order and whether the session was
/// cancelled while running.
pub(crate) async fn run(graph: &BuildGraph, shared: Arc<WorkerShared>) -> (Vec<CommandResult>, bool) {
  let mut scheduler = Scheduler::new(graph, shared);
  let cancelled = scheduler.drive().await;
  (scheduler.results, cancelled)
}

impl<'a> Scheduler<'a> {
  fn new(graph: &'a BuildGraph, shared: Arc<WorkerShared>) -> Self {
    let mut states = vec![NodeState::Pending; graph.len()];
    let mut remaining = vec![0; graph.len()];
    let mut ready = VecDeque::new();

    for id in graph.node_ids() {
      remaining[id.index()] = graph.producers(id).len();
    }
    for id in graph.roots() {
      states[id.index()] = NodeState::Ready;
      ready.push_back(id);
    }

    Self {
      graph,
      shared,
      states,
      remaining,
      produced: HashMap::new(),
      ready,
      running: HashMap::new(),
      results: Vec::with_capacity(graph.len()),
    }
  }

  async fn drive(&mut self) -> bool {
    let mut join_set: JoinSet<WorkOutcome> = JoinSet::new();
    let cancel = self.shared.cancel.clone();
    let mut cancelled = false;

    loop {
      if !cancelled && cancel.is_cancelled() {
        warn!("build cancelled, not starting further commands");
        cancelled = true;
        self.cancel_waiting();
      }

      if !cancelled {
        while let Some(id) = self.ready.pop_front() {
          self.dispatch(&mut join_set, id);
        }
      }

      if join_set.is_empty() {
        break;
      }

      tokio::select! {
        joined = join_set.join_next_with_id() => match joined {
          Some(joined) => self.joined(joined),
          None => break,
        },
        _ = cancel.cancelled(), if !cancelled => {}
      }
    }

    // Unreachable nodes only remain after a cancellation
    self.cancel_waiting();
    cancelled
  }

  fn dispatch(&mut self, join_set: &mut JoinSet<WorkOutcome>, id: NodeId) {
    let node = self.graph.node(id).clone();
    let produced: HashMap<Locator, ContentHash> = node
      .inputs
      .iter()
      .filter_map(|input| self.produced.get(input).map(|hash| (input.clone(), hash.clone())))
      .collect();

    debug!(command = %node.title, "dispatching");
    self.states[id.index()] = NodeState::Running;
    let task = join_set.spawn(worker::run(self.shared.clone(), id, node, produced));
    self.running.insert(task.id(), id);
  }

  /// Settle the node of a worker task that left the join set. A task that
  /// panicked or was aborted still fails its node, so nothing stays `Running`.
  fn joined(&mut self, joined: Result<(task::Id, WorkOutcome), JoinError>) {
    match joined {
      Ok((task, outcome)) => {
        self.running.remove(&task);
        self.complete(outcome);
      }
      Err(e) => {
        error!(error = %e, "worker task failed");
        if let Some(id) = self.running.remove(&e.id()) {
          let mut outcome = WorkOutcome::failed(id);
          outcome.messages.push(LogMessage {
            severity: Severity::Fatal,
            command: self.graph.node(id).title.clone(),
            text: format!("worker task failed: {e}"),
          });
          self.complete(outcome);
        }
      }
    }
  }

  fn complete(&mut self, outcome: WorkOutcome) {
    let graph = self.graph;
    let id = outcome.id;
    let node = graph.node(id);
    self.states[id.index()] = outcome.state;

    if outcome.state.is_success()
      && let Some(hash) = &outcome.output_hash
    {
      self.produced.insert(node.output.clone(), hash.clone());
    }

    let result = CommandResult {
      title: node.title.clone(),
      asset: node.asset.clone(),
      output: node.output.clone(),
      state: outcome.state,
      fingerprint: outcome.fingerprint,
      output_hash: outcome.output_hash,
      cause: outcome.cause,
      started: outcome.started,
      finished: outcome.finished,
      messages: outcome.messages,
    };
    self.record(result);

    match outcome.state {
      NodeState::Succeeded | NodeState::CacheHit => {
        for consumer in self.graph.consumers(id) {
          let remaining = &mut self.remaining[consumer.index()];
          *remaining = remaining.saturating_sub(1);
          if *remaining == 0 && self.states[consumer.index()] == NodeState::Pending {
            self.states[consumer.index()] = NodeState::Ready;
            self.ready.push_back(consumer);
          }
        }
      }
      NodeState::Failed => {
        let root = node.title.clone();
        self.cancel_descendants(id, CancelCause::DependencyFailed { root });
      }
      NodeState::Cancelled => {
        let cancelled = node.title.clone();
        self.cancel_descendants(id, CancelCause::DependencyCancelled { node: cancelled });
      }
      NodeState::Pending | NodeState::Ready | NodeState::Running => {}
    }
  }

  /// Cancel every transitive consumer of `id` that has not started.
  fn cancel_descendants(&mut self, id: NodeId, cause: CancelCause) {
    for descendant in self.graph.descendants(id) {
      if self.states[descendant.index()] == NodeState::Pending {
        self.cancel_node(descendant, cause.clone());
      }
    }
  }

  /// Cancel every node that is still waiting to be dispatched.
  fn cancel_waiting(&mut self) {
    self.ready.clear();
    let waiting: Vec<NodeId> = self
      .graph
      .node_ids()
      .filter(|id| matches!(self.states[id.index()], NodeState::Pending | NodeState::Ready))
      .collect();
    for id in waiting {
      self.cancel_node(id, CancelCause::SessionCancelled);
    }
  }

  fn cancel_node(&mut self, id: NodeId, cause: CancelCause) {
    let graph = self.graph;
    let node = graph.node(id);
    debug!(command = %node.title, cause = %cause, "cancelled");
    self.states[id.index()] = NodeState::Cancelled;
    let result = CommandResult::cancelled(node.title.clone(), node.asset.clone(), node.output.clone(), cause);
    self.record(result);
  }

  fn record(&mut self, result: CommandResult) {
    match result.state {
      NodeState::Failed => warn!(command = %result.title, "failed"),
      NodeState::Cancelled => debug!(command = %result.title, "cancelled"),
      _ => info!(command = %result.title, status = %result.status(), "finished"),
    }
    self.shared.emit(BuildEvent::CommandFinished {
      title: result.title.clone(),
      status: result.status(),
    });
    self.results.push(result);
  }
}

//! Dependency graph of a build session.
//!
//! Flattens a [`BuildStep`] tree into a DAG. A data edge runs from the command
//! producing a locator to every command declaring that locator as an input;
//! sequential groups add ordering edges between consecutive children. Both
//! kinds gate readiness the same way.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::command::Command;
use crate::locator::Locator;
use crate::step::{BuildStep, StepOrder};

/// Identifier of a node, stable for the lifetime of its graph.
pub type NodeId = NodeIndex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("output {output} is declared by both '{first}' and '{second}'")]
  DuplicateOutput {
    output: Locator,
    first: String,
    second: String,
  },

  #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
  CycleDetected { cycle: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
  /// The consumer reads the producer's output.
  Data,
  /// The consumer belongs to a later child of a sequential group.
  Order,
}

/// One command of the session together with its declared locators.
#[derive(Debug, Clone)]
pub struct GraphNode {
  pub command: Arc<dyn Command>,
  pub title: String,
  pub asset: Option<String>,
  pub inputs: Vec<Locator>,
  pub output: Locator,
}

#[derive(Debug)]
pub struct BuildGraph {
  graph: DiGraph<GraphNode, EdgeKind>,
  producers_by_output: HashMap<Locator, NodeId>,
}

impl BuildGraph {
  /// Build the graph for a list of top-level steps.
  ///
  /// # Errors
  ///
  /// Returns `DuplicateOutput` if two commands declare the same output and
  /// `CycleDetected` if the edges do not form a DAG.
  pub fn from_steps(steps: &[BuildStep]) -> Result<Self, GraphError> {
    let mut builder = Self {
      graph: DiGraph::new(),
      producers_by_output: HashMap::new(),
    };

    for step in steps {
      builder.add_step(step, None)?;
    }
    builder.add_data_edges();

    if let Some(cycle) = builder.find_cycle() {
      return Err(GraphError::CycleDetected {
        cycle: cycle.into_iter().map(|id| builder.graph[id].title.clone()).collect(),
      });
    }

    debug!(
      nodes = builder.graph.node_count(),
      edges = builder.graph.edge_count(),
      "built dependency graph"
    );
    Ok(builder)
  }

  /// Add the commands of `step`, returning the nodes created for it.
  fn add_step(&mut self, step: &BuildStep, asset: Option<&str>) -> Result<Vec<NodeId>, GraphError> {
    match step {
      BuildStep::Command(command) => {
        let node = GraphNode {
          command: command.clone(),
          title: command.title(),
          asset: asset.map(str::to_string),
          inputs: command.inputs(),
          output: command.output(),
        };

        if let Some(&existing) = self.producers_by_output.get(&node.output) {
          return Err(GraphError::DuplicateOutput {
            output: node.output.clone(),
            first: self.graph[existing].title.clone(),
            second: node.title,
          });
        }

        let output = node.output.clone();
        let id = self.graph.add_node(node);
        self.producers_by_output.insert(output, id);
        Ok(vec![id])
      }
      BuildStep::Group {
        asset: group_asset,
        order,
        steps,
      } => {
        let asset = group_asset.as_deref().or(asset);
        let mut all = Vec::new();
        let mut previous: Vec<NodeId> = Vec::new();

        for child in steps {
          let nodes = self.add_step(child, asset)?;
          if *order == StepOrder::Sequential && !nodes.is_empty() {
            for &before in &previous {
              for &after in &nodes {
                self.graph.update_edge(before, after, EdgeKind::Order);
              }
            }
            previous = nodes.clone();
          }
          all.extend(nodes);
        }

        Ok(all)
      }
    }
  }

  fn add_data_edges(&mut self) {
    let consumers: Vec<NodeId> = self.graph.node_indices().collect();
    for consumer in consumers {
      for input in self.graph[consumer].inputs.clone() {
        // Inputs nobody produces are external and read from disk
        if let Some(&producer) = self.producers_by_output.get(&input) {
          self.graph.update_edge(producer, consumer, EdgeKind::Data);
        }
      }
    }
  }

  /// Depth-first search with on-stack marking. Returns the nodes along the
  /// first cycle found, with the entry node repeated at the end.
  fn find_cycle(&self) -> Option<Vec<NodeId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      Unvisited,
      OnStack,
      Done,
    }

    let mut marks = vec![Mark::Unvisited; self.graph.node_count()];

    for start in self.graph.node_indices() {
      if marks[start.index()] != Mark::Unvisited {
        continue;
      }

      marks[start.index()] = Mark::OnStack;
      let mut path = vec![start];
      let mut pending = vec![self.consumers(start)];

      loop {
        let Some(children) = pending.last_mut() else {
          break;
        };

        match children.pop() {
          Some(next) => match marks[next.index()] {
            Mark::OnStack => {
              let entry = path.iter().position(|&n| n == next).unwrap_or(0);
              let mut cycle = path[entry..].to_vec();
              cycle.push(next);
              return Some(cycle);
            }
            Mark::Unvisited => {
              marks[next.index()] = Mark::OnStack;
              path.push(next);
              pending.push(self.consumers(next));
            }
            Mark::Done => {}
          },
          None => {
            pending.pop();
            if let Some(done) = path.pop() {
              marks[done.index()] = Mark::Done;
            }
          }
        }
      }
    }

    None
  }

  pub fn node(&self, id: NodeId) -> &GraphNode {
    &self.graph[id]
  }

  pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
    self.graph.node_indices()
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  /// The node declaring `output`, if any.
  pub fn producer_of(&self, output: &Locator) -> Option<NodeId> {
    self.producers_by_output.get(output).copied()
  }

  /// Direct predecessors (data and ordering).
  pub fn producers(&self, id: NodeId) -> Vec<NodeId> {
    self.graph.neighbors_directed(id, Direction::Incoming).collect()
  }

  /// Direct successors (data and ordering).
  pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
    self.graph.neighbors_directed(id, Direction::Outgoing).collect()
  }

  pub fn edge_kind(&self, from: NodeId, to: NodeId) -> Option<EdgeKind> {
    self.graph.find_edge(from, to).map(|e| self.graph[e])
  }

  /// All transitive successors of `id`, excluding `id` itself.
  pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<NodeId> = self.consumers(id).into();
    let mut result = Vec::new();

    while let Some(next) = queue.pop_front() {
      if seen.insert(next) {
        result.push(next);
        queue.extend(self.consumers(next));
      }
    }

    result
  }

  /// Nodes without predecessors.
  pub fn roots(&self) -> Vec<NodeId> {
    self
      .graph
      .node_indices()
      .filter(|&id| self.graph.neighbors_directed(id, Direction::Incoming).next().is_none())
      .collect()
  }

  /// Nodes ordered so that every producer precedes its consumers.
  pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
    toposort(&self.graph, None).map_err(|cycle| GraphError::CycleDetected {
      cycle: vec![self.graph[cycle.node_id()].title.clone()],
    })
  }
}

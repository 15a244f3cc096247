//! Pose graph with flat parameter storage.
//!
//! Node poses live in one contiguous `Vec<f64>` laid out as `[x, y, θ]` per node, in insertion
//! order. The node-id → offset lookup is kept separately, so residual terms can address the
//! parameters by index while the solver mutates them in place.
//!
//! Nodes are append-only: once a node is added its offset never changes. A problem built from the
//! graph records how many parameters it expects, and the solver rejects a parameter slice of a
//! different length, so adding nodes after building a problem is detected rather than silently
//! misaddressed.

use crate::core::pose::{Constraint, NodeId, Pose};
use crate::error::{SpaError, SpaResult};
use std::collections::BTreeMap;
use std::fmt;

/// Number of scalar parameters per pose: `x`, `y`, `θ`.
pub const POSE_PARAMETERS: usize = 3;

/// Statistics about a pose graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoseGraphStatistics {
    pub num_nodes: usize,
    pub num_constraints: usize,
    pub num_parameters: usize,
    pub num_residuals: usize,
}

impl fmt::Display for PoseGraphStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoseGraph Statistics:\n\
             Nodes: {}\n\
             Constraints: {}\n\
             Parameters: {}\n\
             Residuals: {}",
            self.num_nodes, self.num_constraints, self.num_parameters, self.num_residuals
        )
    }
}

/// Nodes (poses) and constraints (relative-pose measurements) of a 2D pose graph.
#[derive(Debug, Clone, Default)]
pub struct PoseGraph {
    parameters: Vec<f64>,
    offsets: BTreeMap<NodeId, usize>,
    constraints: Vec<Constraint>,
}

impl PoseGraph {
    /// Creates a new, empty pose graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with its initial pose estimate.
    ///
    /// # Errors
    ///
    /// [`SpaError::Configuration`] if the id is already present.
    pub fn add_node(&mut self, id: NodeId, initial: Pose) -> SpaResult<()> {
        if self.offsets.contains_key(&id) {
            return Err(SpaError::Configuration(format!(
                "node {id} is already in the graph"
            )));
        }
        self.offsets.insert(id, self.parameters.len());
        self.parameters.extend_from_slice(&initial.to_array());
        Ok(())
    }

    /// Overwrite the stored estimate of an existing node.
    pub fn set_pose(&mut self, id: NodeId, pose: Pose) -> SpaResult<()> {
        let offset = self.require_offset(id)?;
        self.parameters[offset..offset + POSE_PARAMETERS].copy_from_slice(&pose.to_array());
        Ok(())
    }

    /// Append a constraint. Node references are validated when a problem is built.
    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    /// Current estimate of a node, if present.
    pub fn pose(&self, id: NodeId) -> Option<Pose> {
        let offset = *self.offsets.get(&id)?;
        let p = &self.parameters[offset..offset + POSE_PARAMETERS];
        Some(Pose::new(p[0], p[1], p[2]))
    }

    /// All node estimates in ascending id order.
    pub fn poses(&self) -> Vec<(NodeId, Pose)> {
        self.offsets
            .keys()
            .filter_map(|&id| self.pose(id).map(|pose| (id, pose)))
            .collect()
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.offsets.contains_key(&id)
    }

    /// Node ids in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.offsets.keys().copied()
    }

    /// Lowest node id, the default gauge reference.
    pub fn first_node_id(&self) -> Option<NodeId> {
        self.offsets.keys().next().copied()
    }

    /// Index of a node's `x` parameter in the flat store; `y` and `θ` follow it.
    pub fn parameter_offset(&self, id: NodeId) -> Option<usize> {
        self.offsets.get(&id).copied()
    }

    pub(crate) fn require_offset(&self, id: NodeId) -> SpaResult<usize> {
        self.parameter_offset(id)
            .ok_or_else(|| SpaError::Configuration(format!("node {id} is not in the graph")))
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Flat parameter store, `[x, y, θ]` per node in insertion order.
    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    /// Mutable flat parameter store, written in place by the solver.
    pub fn parameters_mut(&mut self) -> &mut [f64] {
        &mut self.parameters
    }

    pub fn num_nodes(&self) -> usize {
        self.offsets.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    /// Check that every constraint refers to nodes present in the graph.
    pub fn validate(&self) -> SpaResult<()> {
        for (index, constraint) in self.constraints.iter().enumerate() {
            for id in [constraint.source, constraint.target] {
                if !self.contains_node(id) {
                    return Err(SpaError::Configuration(format!(
                        "constraint {index} ({}->{}) references node {id}, which is not in the graph",
                        constraint.source, constraint.target
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn statistics(&self) -> PoseGraphStatistics {
        PoseGraphStatistics {
            num_nodes: self.num_nodes(),
            num_constraints: self.num_constraints(),
            num_parameters: self.parameters.len(),
            num_residuals: 3 * self.num_constraints(),
        }
    }
}

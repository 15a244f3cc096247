//! Assembles a least-squares [`Problem`] from a [`PoseGraph`].
//!
//! One SPA residual term is registered per constraint, bound to the six scalar parameters of its
//! source and target node in the graph's flat store. Every term gets the configured robust loss,
//! and the three parameters of one reference node are held constant to remove the gauge freedom
//! (a pose graph only constrains relative poses).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::core::graph::{POSE_PARAMETERS, PoseGraph};
use crate::core::loss_functions::{CauchyLoss, HuberLoss, Loss};
use crate::core::pose::{Constraint, NodeId};
use crate::core::problem::Problem;
use crate::error::{SpaError, SpaResult};
use crate::factors::{AnalyticSpaFactor, AutoDiffSpaFactor, CostFunction, EvaluationCounter};

/// How residual Jacobians are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JacobianStrategy {
    /// Forward-mode dual numbers over the generic residual
    AutoDiff,
    /// Hand-derived closed-form columns
    #[default]
    Analytic,
}

impl JacobianStrategy {
    pub const ALL: [JacobianStrategy; 2] = [JacobianStrategy::AutoDiff, JacobianStrategy::Analytic];

    /// Build the residual term for one constraint.
    pub fn create_factor(
        self,
        constraint: &Constraint,
        counter: Option<Arc<EvaluationCounter>>,
    ) -> Box<dyn CostFunction> {
        match (self, counter) {
            (JacobianStrategy::AutoDiff, Some(counter)) => {
                Box::new(AutoDiffSpaFactor::new(constraint).with_counter(counter))
            }
            (JacobianStrategy::AutoDiff, None) => Box::new(AutoDiffSpaFactor::new(constraint)),
            (JacobianStrategy::Analytic, Some(counter)) => {
                Box::new(AnalyticSpaFactor::new(constraint).with_counter(counter))
            }
            (JacobianStrategy::Analytic, None) => Box::new(AnalyticSpaFactor::new(constraint)),
        }
    }
}

impl fmt::Display for JacobianStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JacobianStrategy::AutoDiff => write!(f, "autodiff"),
            JacobianStrategy::Analytic => write!(f, "analytic"),
        }
    }
}

impl FromStr for JacobianStrategy {
    type Err = SpaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "autodiff" | "auto" => Ok(JacobianStrategy::AutoDiff),
            "analytic" | "anal" => Ok(JacobianStrategy::Analytic),
            _ => Err(SpaError::InvalidInput(format!(
                "Unknown Jacobian strategy: {s}. Valid options: autodiff, analytic"
            ))),
        }
    }
}

/// Robust loss attached to every residual term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossFunctionKind {
    /// Huber loss with the given threshold
    Huber(f64),
    /// Cauchy loss with the given scale
    Cauchy(f64),
    /// Plain least squares
    None,
}

impl Default for LossFunctionKind {
    fn default() -> Self {
        LossFunctionKind::Huber(1.0)
    }
}

impl LossFunctionKind {
    /// Create a loss function instance, `None` for plain least squares.
    pub fn create(&self) -> SpaResult<Option<Box<dyn Loss>>> {
        let loss: Box<dyn Loss> = match *self {
            LossFunctionKind::Huber(scale) => Box::new(HuberLoss::new(scale)?),
            LossFunctionKind::Cauchy(scale) => Box::new(CauchyLoss::new(scale)?),
            LossFunctionKind::None => return Ok(None),
        };
        Ok(Some(loss))
    }
}

impl fmt::Display for LossFunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossFunctionKind::Huber(scale) => write!(f, "huber({scale})"),
            LossFunctionKind::Cauchy(scale) => write!(f, "cauchy({scale})"),
            LossFunctionKind::None => write!(f, "l2"),
        }
    }
}

/// Which node anchors the gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceNode {
    /// The node with the lowest id
    #[default]
    First,
    /// A specific node
    Node(NodeId),
    /// Hold nothing constant. The normal equations are then rank deficient; only useful for
    /// diagnostics.
    Disabled,
}

/// Configuration for [`ProblemBuilder`].
#[derive(Debug, Clone, Default)]
pub struct ProblemBuilderConfig {
    pub strategy: JacobianStrategy,
    pub loss: LossFunctionKind,
    pub reference_node: ReferenceNode,
    /// Attached to every residual term when set
    pub counter: Option<Arc<EvaluationCounter>>,
}

impl ProblemBuilderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: JacobianStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_loss(mut self, loss: LossFunctionKind) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_reference_node(mut self, reference_node: ReferenceNode) -> Self {
        self.reference_node = reference_node;
        self
    }

    pub fn with_counter(mut self, counter: Arc<EvaluationCounter>) -> Self {
        self.counter = Some(counter);
        self
    }
}

/// Builds one [`Problem`] per pose graph.
#[derive(Debug, Clone, Default)]
pub struct ProblemBuilder {
    config: ProblemBuilderConfig,
}

impl ProblemBuilder {
    pub fn new(config: ProblemBuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProblemBuilderConfig {
        &self.config
    }

    /// Resolve the configured reference node against `graph`.
    ///
    /// # Errors
    ///
    /// [`SpaError::Configuration`] if the named node does not exist, or if the graph is empty
    /// and a reference is required.
    pub fn reference_node_id(&self, graph: &PoseGraph) -> SpaResult<Option<NodeId>> {
        match self.config.reference_node {
            ReferenceNode::First => graph.first_node_id().map(Some).ok_or_else(|| {
                SpaError::Configuration("graph has no nodes to use as reference".to_string())
            }),
            ReferenceNode::Node(id) if graph.contains_node(id) => Ok(Some(id)),
            ReferenceNode::Node(id) => Err(SpaError::Configuration(format!(
                "reference node {id} is not in the graph"
            ))),
            ReferenceNode::Disabled => Ok(None),
        }
    }

    /// Register one residual term per constraint and fix the reference node.
    ///
    /// # Errors
    ///
    /// [`SpaError::Configuration`] for a constraint referencing a missing node or a missing
    /// reference node; [`SpaError::InvalidInput`] for an invalid loss scale.
    pub fn build(&self, graph: &PoseGraph) -> SpaResult<Problem> {
        graph.validate()?;
        let reference = self.reference_node_id(graph)?;

        let mut problem = Problem::new(graph.parameters().len());
        for constraint in graph.constraints() {
            let source = graph.require_offset(constraint.source)?;
            let target = graph.require_offset(constraint.target)?;
            let indices = [
                source,
                source + 1,
                source + 2,
                target,
                target + 1,
                target + 2,
            ];
            let factor = self
                .config
                .strategy
                .create_factor(constraint, self.config.counter.clone());
            problem.add_residual_block(indices, factor, self.config.loss.create()?)?;
        }

        if let Some(id) = reference {
            let offset = graph.require_offset(id)?;
            for index in offset..offset + POSE_PARAMETERS {
                problem.set_parameter_constant(index)?;
            }
        }

        debug!(
            "Built problem: {} residual blocks, {} parameters ({} effective), {} Jacobians, loss {}, reference {:?}",
            problem.num_residual_blocks(),
            problem.num_parameters(),
            problem.num_effective_parameters(),
            self.config.strategy,
            self.config.loss,
            reference
        );
        Ok(problem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pose::Pose;

    fn chain_graph() -> PoseGraph {
        let mut graph = PoseGraph::new();
        graph.add_node(3, Pose::new(0.0, 0.0, 0.0)).unwrap();
        graph.add_node(1, Pose::new(1.0, 0.0, 0.0)).unwrap();
        graph.add_node(2, Pose::new(2.0, 0.0, 0.0)).unwrap();
        graph.add_constraint(Constraint::with_identity_information(
            3,
            1,
            Pose::new(1.0, 0.0, 0.0),
        ));
        graph.add_constraint(Constraint::with_identity_information(
            1,
            2,
            Pose::new(1.0, 0.0, 0.0),
        ));
        graph
    }

    #[test]
    fn test_build_fixes_lowest_id() {
        let graph = chain_graph();
        let problem = ProblemBuilder::default().build(&graph).unwrap();

        assert_eq!(problem.num_residual_blocks(), 2);
        assert_eq!(problem.num_residuals(), 6);
        assert_eq!(problem.num_parameters(), 9);
        assert_eq!(problem.num_effective_parameters(), 6);

        // node 1 was inserted second, so its parameters start at 3
        let offset = graph.parameter_offset(1).unwrap();
        assert_eq!(offset, 3);
        for index in offset..offset + 3 {
            assert!(problem.is_parameter_constant(index));
        }
        assert!(!problem.is_parameter_constant(0));
    }

    #[test]
    fn test_residual_blocks_address_graph_offsets() {
        let graph = chain_graph();
        let problem = ProblemBuilder::default().build(&graph).unwrap();
        assert_eq!(
            problem.residual_blocks()[0].parameter_indices,
            [0, 1, 2, 3, 4, 5]
        );
        assert_eq!(
            problem.residual_blocks()[1].parameter_indices,
            [3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_named_reference_node() {
        let graph = chain_graph();
        let config = ProblemBuilderConfig::new().with_reference_node(ReferenceNode::Node(2));
        let problem = ProblemBuilder::new(config).build(&graph).unwrap();
        assert!(problem.is_parameter_constant(6));
        assert!(!problem.is_parameter_constant(3));

        let config = ProblemBuilderConfig::new().with_reference_node(ReferenceNode::Node(42));
        let err = ProblemBuilder::new(config).build(&graph).unwrap_err();
        assert!(matches!(err, SpaError::Configuration(_)));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_disabled_reference_keeps_all_parameters_free() {
        let graph = chain_graph();
        let config = ProblemBuilderConfig::new().with_reference_node(ReferenceNode::Disabled);
        let problem = ProblemBuilder::new(config).build(&graph).unwrap();
        assert_eq!(problem.num_effective_parameters(), 9);
    }

    #[test]
    fn test_dangling_constraint_is_configuration_error() {
        let mut graph = chain_graph();
        graph.add_constraint(Constraint::with_identity_information(
            2,
            9,
            Pose::identity(),
        ));
        let err = ProblemBuilder::default().build(&graph).unwrap_err();
        assert!(matches!(err, SpaError::Configuration(_)));
    }

    #[test]
    fn test_empty_graph_needs_no_reference_only_when_disabled() {
        let graph = PoseGraph::new();
        assert!(ProblemBuilder::default().build(&graph).is_err());

        let config = ProblemBuilderConfig::new().with_reference_node(ReferenceNode::Disabled);
        let problem = ProblemBuilder::new(config).build(&graph).unwrap();
        assert_eq!(problem.num_residual_blocks(), 0);
    }

    #[test]
    fn test_invalid_loss_scale() {
        let graph = chain_graph();
        let config = ProblemBuilderConfig::new().with_loss(LossFunctionKind::Huber(-1.0));
        let err = ProblemBuilder::new(config).build(&graph).unwrap_err();
        assert!(matches!(err, SpaError::InvalidInput(_)));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "AutoDiff".parse::<JacobianStrategy>().unwrap(),
            JacobianStrategy::AutoDiff
        );
        assert_eq!(
            "analytic".parse::<JacobianStrategy>().unwrap(),
            JacobianStrategy::Analytic
        );
        assert!("numeric".parse::<JacobianStrategy>().is_err());
        assert_eq!(JacobianStrategy::Analytic.to_string(), "analytic");
    }

    #[test]
    fn test_counter_is_attached() {
        let graph = chain_graph();
        let counter = Arc::new(EvaluationCounter::new());
        let config = ProblemBuilderConfig::new().with_counter(counter.clone());
        let problem = ProblemBuilder::new(config).build(&graph).unwrap();

        problem.cost(graph.parameters()).unwrap();
        assert_eq!(counter.residual_evaluations(), 2);
        assert_eq!(counter.jacobian_columns(), 0);
    }
}

//! End-to-end tests on the three-node triangle graph
//!
//! Covers convergence to the known solution, agreement between the analytic and autodiff
//! Jacobians, the gauge freedom left when no reference node is fixed, and which Jacobian
//! columns are requested once the reference node is constant.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;

use spa2d::builder::{
    JacobianStrategy, LossFunctionKind, ProblemBuilder, ProblemBuilderConfig, ReferenceNode,
};
use spa2d::core::graph::PoseGraph;
use spa2d::core::pose::{Constraint, Pose};
use spa2d::factors::EvaluationCounter;
use spa2d::harness::triangle_graph;
use spa2d::spa::{SpaOptimizer, SpaOptimizerConfig};
use spa2d::{OptimizationStatus, SolverSummary, SpaError};

fn ground_truth() -> [Pose; 3] {
    [
        Pose::identity(),
        Pose::new(4.0, 0.0, FRAC_PI_2),
        Pose::new(0.0, 4.0, -FRAC_PI_2),
    ]
}

fn solve(strategy: JacobianStrategy) -> (PoseGraph, SolverSummary) {
    let mut graph = triangle_graph().unwrap();
    let summary = SpaOptimizer::new(SpaOptimizerConfig::new().with_strategy(strategy))
        .optimize(&mut graph)
        .unwrap();
    (graph, summary)
}

fn assert_ground_truth(graph: &PoseGraph) {
    for (id, expected) in ground_truth().iter().enumerate() {
        let pose = graph.pose(id as u32).unwrap();
        assert!(
            pose.approx_eq(expected, 1e-6),
            "node {id}: got {pose}, expected {expected}"
        );
    }
}

#[test]
fn test_triangle_converges_to_ground_truth() {
    for strategy in JacobianStrategy::ALL {
        let (graph, summary) = solve(strategy);

        assert!(summary.converged, "{strategy}: {}", summary.status);
        assert_eq!(summary.num_residuals, 9);
        assert_eq!(summary.num_parameters, 9);
        assert_eq!(summary.num_effective_parameters, 6);
        assert!(summary.successful_steps > 0);
        assert!(summary.final_cost < 1e-3 * summary.initial_cost);
        assert!(summary.final_cost < 1e-12);
        assert_ground_truth(&graph);
    }
}

#[test]
fn test_strategies_agree() {
    let (auto_graph, auto_summary) = solve(JacobianStrategy::AutoDiff);
    let (analytic_graph, analytic_summary) = solve(JacobianStrategy::Analytic);

    assert!((auto_summary.initial_cost - analytic_summary.initial_cost).abs() < 1e-12);
    assert!((auto_summary.final_cost - analytic_summary.final_cost).abs() < 1e-9);
    for ((id, auto_pose), (_, analytic_pose)) in
        auto_graph.poses().iter().zip(analytic_graph.poses().iter())
    {
        assert!(
            auto_pose.approx_eq(analytic_pose, 1e-6),
            "node {id}: {auto_pose} vs {analytic_pose}"
        );
    }
}

#[test]
fn test_reference_node_keeps_its_pose() {
    let mut graph = triangle_graph().unwrap();
    let before = graph.pose(1).unwrap();
    let config = SpaOptimizerConfig::new().with_builder(
        ProblemBuilderConfig::new().with_reference_node(ReferenceNode::Node(1)),
    );

    let summary = SpaOptimizer::new(config).optimize(&mut graph).unwrap();
    assert!(summary.converged, "{}", summary.status);
    assert_eq!(graph.pose(1), Some(before));

    // the solution is the ground truth moved rigidly so that node 1 stays put
    let truth = ground_truth();
    let transform = before.compose(&truth[1].inverse());
    for (id, expected) in truth.iter().enumerate() {
        let expected = transform.compose(expected);
        assert!(graph.pose(id as u32).unwrap().approx_eq(&expected, 1e-6));
    }
}

#[test]
fn test_gauge_freedom_without_reference_node() {
    let graph = triangle_graph().unwrap();
    let config = ProblemBuilderConfig::new()
        .with_loss(LossFunctionKind::None)
        .with_reference_node(ReferenceNode::Disabled);
    let problem = ProblemBuilder::new(config.clone()).build(&graph).unwrap();
    assert_eq!(problem.num_effective_parameters(), 9);

    let normal = problem
        .linearize(graph.parameters())
        .unwrap()
        .dense_normal_matrix();
    assert_eq!(normal.ncols(), 9);
    assert_eq!(normal.rank(1e-9), 6);

    // a rigid motion of every node leaves the cost unchanged
    let transform = Pose::new(-2.5, 7.0, 0.8);
    let mut moved = triangle_graph().unwrap();
    for (id, pose) in graph.poses() {
        moved.set_pose(id, transform.compose(&pose)).unwrap();
    }
    let cost = problem.cost(graph.parameters()).unwrap();
    let moved_cost = problem.cost(moved.parameters()).unwrap();
    assert!((cost - moved_cost).abs() < 1e-9 * cost.max(1.0));

    // fixing node 0 removes all three null directions
    let fixed = ProblemBuilder::new(config.with_reference_node(ReferenceNode::First))
        .build(&graph)
        .unwrap();
    let normal = fixed
        .linearize(graph.parameters())
        .unwrap()
        .dense_normal_matrix();
    assert_eq!(normal.ncols(), 6);
    assert_eq!(normal.rank(1e-9), 6);
}

#[test]
fn test_unconstrained_node_is_not_converged() {
    let mut graph = triangle_graph().unwrap();
    graph.add_node(3, Pose::new(9.0, 9.0, 0.3)).unwrap();

    let summary = SpaOptimizer::new(SpaOptimizerConfig::default())
        .optimize(&mut graph)
        .unwrap();
    assert_eq!(summary.status, OptimizationStatus::RankDeficient);
    assert!(!summary.converged);
    assert_eq!(summary.num_effective_parameters, 9);
    // the constrained part is still solved and the loose node is left alone
    assert_ground_truth(&graph);
    assert_eq!(graph.pose(3), Some(Pose::new(9.0, 9.0, 0.3)));
}

#[test]
fn test_disabled_reference_node_is_not_converged() {
    let mut graph = triangle_graph().unwrap();
    let config = SpaOptimizerConfig::new().with_builder(
        ProblemBuilderConfig::new().with_reference_node(ReferenceNode::Disabled),
    );

    let summary = SpaOptimizer::new(config).optimize(&mut graph).unwrap();
    assert_eq!(summary.status, OptimizationStatus::RankDeficient);
    assert!(!summary.converged);
    assert!(summary.final_cost < 1e-12);
}

#[test]
fn test_solution_is_unique_with_reference_node() {
    let mut other = triangle_graph().unwrap();
    other.set_pose(1, Pose::new(3.6, 0.4, 1.7)).unwrap();
    other.set_pose(2, Pose::new(0.3, 3.7, -1.4)).unwrap();

    let optimizer = SpaOptimizer::new(SpaOptimizerConfig::default());
    let mut first = triangle_graph().unwrap();
    assert!(optimizer.optimize(&mut first).unwrap().converged);
    assert!(optimizer.optimize(&mut other).unwrap().converged);

    for (id, pose) in first.poses() {
        assert!(pose.approx_eq(&other.pose(id).unwrap(), 1e-6));
    }
}

#[test]
fn test_analytic_requests_only_free_columns() {
    let graph = triangle_graph().unwrap();
    let counter = Arc::new(EvaluationCounter::new());
    let config = ProblemBuilderConfig::new()
        .with_strategy(JacobianStrategy::Analytic)
        .with_counter(counter.clone());
    let problem = ProblemBuilder::new(config).build(&graph).unwrap();

    problem.linearize(graph.parameters()).unwrap();
    assert_eq!(counter.residual_evaluations(), 3);
    // 0→1 and 2→0 touch the fixed node, 1→2 does not
    assert_eq!(counter.jacobian_columns(), 3 + 6 + 3);

    counter.reset();
    problem.cost(graph.parameters()).unwrap();
    assert_eq!(counter.residual_evaluations(), 3);
    assert_eq!(counter.jacobian_columns(), 0);
}

#[test]
fn test_autodiff_always_computes_every_column() {
    let graph = triangle_graph().unwrap();
    let counter = Arc::new(EvaluationCounter::new());
    let config = ProblemBuilderConfig::new()
        .with_strategy(JacobianStrategy::AutoDiff)
        .with_counter(counter.clone());
    let problem = ProblemBuilder::new(config).build(&graph).unwrap();

    problem.linearize(graph.parameters()).unwrap();
    assert_eq!(counter.jacobian_columns(), 3 * 6);
}

#[test]
fn test_dangling_constraint_is_a_configuration_error() {
    let mut graph = triangle_graph().unwrap();
    graph.add_constraint(Constraint::with_identity_information(
        2,
        9,
        Pose::new(1.0, 0.0, 0.0),
    ));
    let before = graph.parameters().to_vec();

    let result = SpaOptimizer::new(SpaOptimizerConfig::default()).optimize(&mut graph);
    assert!(matches!(result, Err(SpaError::Configuration(_))));
    assert_eq!(graph.parameters(), before.as_slice());
}

#[test]
fn test_duplicate_node_is_rejected() {
    let mut graph = triangle_graph().unwrap();
    assert!(matches!(
        graph.add_node(1, Pose::identity()),
        Err(SpaError::Configuration(_))
    ));
    assert_eq!(graph.num_nodes(), 3);
}

#[test]
fn test_empty_graph_needs_no_reference_only_when_disabled() {
    let graph = PoseGraph::new();
    let result = ProblemBuilder::new(ProblemBuilderConfig::default()).build(&graph);
    assert!(matches!(result, Err(SpaError::Configuration(_))));

    let disabled = ProblemBuilderConfig::new().with_reference_node(ReferenceNode::Disabled);
    let problem = ProblemBuilder::new(disabled).build(&graph).unwrap();
    assert_eq!(problem.num_residual_blocks(), 0);
}

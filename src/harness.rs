//! Timing harness comparing Jacobian strategies on a fixed pose graph.
//!
//! Every trial builds a fresh graph, optimizes it with one strategy and records the solver's
//! total time. Trials are strictly sequential and share nothing.
//!
//! ## Timing Methodology
//! - The measured time is [`SolverSummary::total_time`](crate::optimizer::SolverSummary), so
//!   graph construction and problem assembly are excluded
//! - Mean and maximum are taken over all trials of one strategy

use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::builder::JacobianStrategy;
use crate::core::graph::PoseGraph;
use crate::core::pose::{Constraint, NodeId, Pose};
use crate::error::{SpaError, SpaResult};
use crate::spa::{SpaOptimizer, SpaOptimizerConfig};

/// Three nodes on a right triangle with slightly perturbed initial estimates.
///
/// Measurements: `0→1: (4, 0, π/2)`, `1→2: (4, 4, π)`, `2→0: (4, 0, π/2)`, all with unit
/// information. They are mutually consistent; with node 0 at the origin the solution is
/// `p1 = (4, 0, π/2)` and `p2 = (0, 4, −π/2)`.
pub fn triangle_graph() -> SpaResult<PoseGraph> {
    let mut graph = PoseGraph::new();
    graph.add_node(0, Pose::new(0.0, 0.0, 0.0))?;
    graph.add_node(1, Pose::new(4.3, -0.2, 1.4208))?;
    graph.add_node(2, Pose::new(-0.5, 4.4, -1.3708))?;

    graph.add_constraint(Constraint::with_identity_information(
        0,
        1,
        Pose::new(4.0, 0.0, FRAC_PI_2),
    ));
    graph.add_constraint(Constraint::with_identity_information(
        1,
        2,
        Pose::new(4.0, 4.0, PI),
    ));
    graph.add_constraint(Constraint::with_identity_information(
        2,
        0,
        Pose::new(4.0, 0.0, FRAC_PI_2),
    ));
    Ok(graph)
}

/// Configuration for [`run_benchmark`].
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Trials per strategy
    pub trials: usize,
    /// Strategies to time, in order
    pub strategies: Vec<JacobianStrategy>,
    /// Keep the optimized poses of the last trial of each strategy
    pub record_poses: bool,
    /// Template for every solve; its strategy is overridden per run
    pub optimizer: SpaOptimizerConfig,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            trials: 1000,
            strategies: JacobianStrategy::ALL.to_vec(),
            record_poses: false,
            optimizer: SpaOptimizerConfig::default(),
        }
    }
}

impl BenchmarkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trials(mut self, trials: usize) -> Self {
        self.trials = trials;
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<JacobianStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_record_poses(mut self, record_poses: bool) -> Self {
        self.record_poses = record_poses;
        self
    }

    pub fn with_optimizer(mut self, optimizer: SpaOptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }
}

/// Aggregated timings of one strategy.
#[derive(Debug, Clone)]
pub struct StrategyTiming {
    pub strategy: JacobianStrategy,
    pub trials: usize,
    pub mean_time: Duration,
    pub max_time: Duration,
    pub converged_trials: usize,
    /// Final cost of the last trial
    pub final_cost: f64,
    /// Optimized poses of the last trial, when requested
    pub final_poses: Option<Vec<(NodeId, Pose)>>,
}

/// One CSV row per strategy.
#[derive(Debug, Clone, Serialize)]
pub struct TimingRecord {
    pub strategy: String,
    pub trials: usize,
    pub mean_time_seconds: f64,
    pub max_time_seconds: f64,
    pub converged_trials: usize,
    pub final_cost: f64,
}

impl From<&StrategyTiming> for TimingRecord {
    fn from(timing: &StrategyTiming) -> Self {
        Self {
            strategy: timing.strategy.to_string(),
            trials: timing.trials,
            mean_time_seconds: timing.mean_time.as_secs_f64(),
            max_time_seconds: timing.max_time.as_secs_f64(),
            converged_trials: timing.converged_trials,
            final_cost: timing.final_cost,
        }
    }
}

/// Result of [`run_benchmark`], one entry per strategy in the configured order.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkReport {
    pub timings: Vec<StrategyTiming>,
}

impl BenchmarkReport {
    pub fn timing(&self, strategy: JacobianStrategy) -> Option<&StrategyTiming> {
        self.timings.iter().find(|t| t.strategy == strategy)
    }

    pub fn records(&self) -> Vec<TimingRecord> {
        self.timings.iter().map(TimingRecord::from).collect()
    }

    /// Write one CSV row per strategy, with a header.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> SpaResult<()> {
        let mut writer = csv::Writer::from_writer(writer);
        for record in self.records() {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for timing in &self.timings {
            writeln!(
                f,
                "Mean time {}: {:.6e} s",
                timing.strategy,
                timing.mean_time.as_secs_f64()
            )?;
            writeln!(
                f,
                "Max time {}: {:.6e} s",
                timing.strategy,
                timing.max_time.as_secs_f64()
            )?;
            writeln!(
                f,
                "Converged {}: {}/{}",
                timing.strategy, timing.converged_trials, timing.trials
            )?;
        }
        Ok(())
    }
}

/// Mean of `count` durations summing to `total`, for any `count > 0`.
fn mean_duration(total: Duration, count: usize) -> Duration {
    total.div_f64(count as f64)
}

/// Time `config.trials` solves of a freshly built graph for every configured strategy.
///
/// # Errors
///
/// [`SpaError::InvalidInput`] for zero trials; any error from building the graph or problem.
pub fn run_benchmark<F>(config: &BenchmarkConfig, graph_factory: F) -> SpaResult<BenchmarkReport>
where
    F: Fn() -> SpaResult<PoseGraph>,
{
    if config.trials == 0 {
        return Err(SpaError::InvalidInput(
            "benchmark needs at least one trial".to_string(),
        ));
    }

    let mut report = BenchmarkReport::default();
    for &strategy in &config.strategies {
        let optimizer = SpaOptimizer::new(config.optimizer.clone().with_strategy(strategy));
        info!("Timing {} Jacobians over {} trials", strategy, config.trials);

        let mut total = Duration::ZERO;
        let mut max_time = Duration::ZERO;
        let mut converged_trials = 0;
        let mut final_cost = f64::NAN;
        let mut final_poses = None;

        for trial in 0..config.trials {
            let mut graph = graph_factory()?;
            let summary = optimizer.optimize(&mut graph)?;

            total += summary.total_time;
            max_time = max_time.max(summary.total_time);
            if summary.converged {
                converged_trials += 1;
            } else {
                debug!("Trial {} with {} did not converge: {}", trial, strategy, summary.status);
            }
            final_cost = summary.final_cost;
            if config.record_poses && trial + 1 == config.trials {
                final_poses = Some(graph.poses());
            }
        }

        report.timings.push(StrategyTiming {
            strategy,
            trials: config.trials,
            mean_time: mean_duration(total, config.trials),
            max_time,
            converged_trials,
            final_cost,
            final_poses,
        });
    }
    Ok(report)
}

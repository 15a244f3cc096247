use std::path::PathBuf;

use clap::Parser;
use spa2d::builder::{JacobianStrategy, LossFunctionKind, ProblemBuilderConfig};
use spa2d::harness::{BenchmarkConfig, run_benchmark, triangle_graph};
use spa2d::init_logger;
use spa2d::optimizer::LevenbergMarquardtConfig;
use spa2d::spa::SpaOptimizerConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "spa_benchmark")]
#[command(about = "Time analytic against autodiff Jacobians on a 2D pose-graph triangle")]
struct Args {
    /// Number of solves per strategy
    #[arg(short, long, default_value = "1000")]
    trials: usize,

    /// Jacobian strategy: "autodiff", "analytic", or "all"
    #[arg(short, long, default_value = "all")]
    strategy: String,

    /// Report every solve summary
    #[arg(short, long)]
    verbose: bool,

    /// Print the optimized poses of the last trial of each strategy
    #[arg(short, long)]
    print_poses: bool,

    /// Robust loss function: "huber", "cauchy", or "l2"
    #[arg(long, default_value = "huber")]
    loss_function: String,

    /// Scale parameter for the loss function (default: 1.0)
    #[arg(long, default_value = "1.0")]
    loss_scale: f64,

    /// Maximum number of Levenberg-Marquardt iterations
    #[arg(short, long, default_value = "50")]
    max_iterations: usize,

    /// Optional path to write the timing report as CSV
    #[arg(long)]
    csv: Option<PathBuf>,
}

fn parse_strategies(name: &str) -> Result<Vec<JacobianStrategy>, Box<dyn std::error::Error>> {
    if name.eq_ignore_ascii_case("all") {
        return Ok(JacobianStrategy::ALL.to_vec());
    }
    Ok(vec![name.parse()?])
}

fn parse_loss(name: &str, scale: f64) -> Result<LossFunctionKind, Box<dyn std::error::Error>> {
    match name.to_lowercase().as_str() {
        "huber" => Ok(LossFunctionKind::Huber(scale)),
        "cauchy" => Ok(LossFunctionKind::Cauchy(scale)),
        "l2" | "none" => Ok(LossFunctionKind::None),
        _ => Err(format!("Unknown loss function: {name}. Valid options: huber, cauchy, l2").into()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();
    let args = Args::parse();

    let strategies = parse_strategies(&args.strategy)?;
    let loss = parse_loss(&args.loss_function, args.loss_scale)?;

    let optimizer = SpaOptimizerConfig::new()
        .with_builder(ProblemBuilderConfig::new().with_loss(loss))
        .with_solver(LevenbergMarquardtConfig::new().with_max_iterations(args.max_iterations))
        .with_verbose(args.verbose);

    let config = BenchmarkConfig::new()
        .with_trials(args.trials)
        .with_strategies(strategies)
        .with_record_poses(args.print_poses)
        .with_optimizer(optimizer);

    info!("=== SPA2D JACOBIAN BENCHMARK ===");
    info!("Trials per strategy: {}", config.trials);
    info!("Loss function: {}", loss);

    let report = run_benchmark(&config, triangle_graph)?;

    if args.print_poses {
        for timing in &report.timings {
            if let Some(poses) = &timing.final_poses {
                println!("Poses with {} Jacobians:", timing.strategy);
                for (id, pose) in poses {
                    println!("Pose {} is {}, {}, {}", id, pose.x(), pose.y(), pose.angle());
                }
            }
        }
    }

    print!("{report}");

    if let Some(path) = &args.csv {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        report.write_csv(std::fs::File::create(path)?)?;
        info!("Results written to {}", path.display());
    }

    let failed: Vec<String> = report
        .timings
        .iter()
        .filter(|t| t.converged_trials < t.trials)
        .map(|t| t.strategy.to_string())
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("Some trials failed to converge with: {}", failed.join(", ")).into())
    }
}

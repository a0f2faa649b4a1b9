//! Lockstep scenario CLI
//!
//! Runs a manager and managed applications over the in-process broker.

use clap::Parser;
use lockstep_core::ExecConfig;
use lockstep_sim::{ScenarioId, ScenarioPlan, ScenarioResult, ScenarioRunner};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Lockstep in-process scenario runner
#[derive(Parser, Debug)]
#[command(name = "lockstep-sim")]
#[command(about = "Run time-synchronized scenarios over an in-process broker", long_about = None)]
struct Args {
    /// Scenario to run (nominal, rescale, early_stop, scripted, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of managed applications
    #[arg(short, long, default_value = "3")]
    apps: usize,

    /// Run the manager test plan from a JSON configuration file instead
    #[arg(short, long)]
    config: Option<String>,

    /// Broker delivery latency in milliseconds
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// Correct wallclocks against this SNTP server
    #[arg(long)]
    sntp: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let mut runner = ScenarioRunner::new(args.apps)
        .with_latency(Duration::from_millis(args.latency_ms));
    if let Some(host) = &args.sntp {
        runner = runner.with_sntp_host(host.clone());
    }

    let plans: Vec<ScenarioPlan> = match &args.config {
        Some(path) => {
            let plan = ExecConfig::from_path(path)
                .map_err(|e| e.to_string())
                .and_then(|config| {
                    ScenarioPlan::from_config(config, runner.num_apps()).map_err(|e| e.to_string())
                });
            match plan {
                Ok(plan) => vec![plan],
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(2);
                }
            }
        }
        None => {
            let scenarios = if args.scenario == "all" {
                ScenarioId::all()
            } else {
                vec![args.scenario.parse().unwrap_or_else(|e| {
                    eprintln!("Error: {}", e);
                    eprintln!("Available scenarios: nominal, rescale, early_stop, scripted, all");
                    std::process::exit(2);
                })]
            };
            scenarios
                .into_iter()
                .map(|s| ScenarioPlan::for_scenario(s, runner.num_apps()))
                .collect()
        }
    };

    if !args.json {
        info!("Lockstep scenario runner v{}", env!("CARGO_PKG_VERSION"));
        info!("{} managed application(s), broker latency {} ms", runner.num_apps(), args.latency_ms);
    }

    let mut results: Vec<ScenarioResult> = Vec::new();
    for plan in plans {
        let result = runner.run_plan(plan).await;
        if !args.json {
            if result.passed {
                info!(
                    "✓ {} PASSED ({} tocks, {} ms wallclock, {} messages)",
                    result.scenario,
                    result.metrics.manager_tocks,
                    result.metrics.wallclock_elapsed_ms,
                    result.metrics.messages_delivered
                );
            } else {
                error!(
                    "✗ {} FAILED: {}",
                    result.scenario,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        results.push(result);
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    if args.json {
        let summary = serde_json::json!({
            "total": results.len(),
            "passed": results.len() - failed,
            "failed": failed,
            "results": results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(2);
            }
        }
    } else if failed == 0 {
        info!("All {} scenario runs passed", results.len());
    } else {
        error!("{}/{} scenario runs failed", failed, results.len());
    }

    // Exit with proper code for CI
    if failed > 0 {
        std::process::exit(1);
    }
}

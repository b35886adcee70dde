//! raft-harness
//!
//! A CLI around the in-process multi-replica test scenarios: `run` executes
//! one named scenario, `list` prints the available names, and `suite` runs
//! every scenario and reports a pass/fail summary.

mod cluster;
mod fault_injection;
mod scenarios;
mod workload;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "raft-harness")]
#[command(about = "In-process scenario harness for raft-core")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single named scenario.
    Run {
        /// Scenario name, e.g. "quorum-write" (see `list`)
        scenario: String,
    },
    /// Print the names of every available scenario.
    List,
    /// Run every scenario and print a pass/fail summary.
    Suite,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("info") };
    fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::List => {
            for (name, _) in scenarios::all_scenarios() {
                println!("{name}");
            }
        }
        Commands::Run { scenario } => {
            let Some((name, run)) = scenarios::all_scenarios().into_iter().find(|(n, _)| *n == scenario) else {
                error!(%scenario, "no such scenario");
                std::process::exit(2);
            };
            info!(%name, "running scenario");
            match run().await {
                Ok(()) => println!("{name}: PASS"),
                Err(e) => {
                    println!("{name}: FAIL ({e})");
                    std::process::exit(1);
                }
            }
        }
        Commands::Suite => {
            let mut failed = 0;
            let mut total = 0;
            for (name, run) in scenarios::all_scenarios() {
                total += 1;
                info!(%name, "running scenario");
                match run().await {
                    Ok(()) => println!("{name}: PASS"),
                    Err(e) => {
                        println!("{name}: FAIL ({e})");
                        failed += 1;
                    }
                }
            }
            println!("\n{} / {} scenarios passed", total - failed, total);
            if failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

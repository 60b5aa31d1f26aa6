//! Build automation tasks for nrflow
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "nrflow build automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Run the transport benchmarks
    Bench {
        /// Only benchmarks matching this filter
        filter: Option<String>,
    },

    /// Short release-mode pipeline run with forked workers
    Smoke {
        /// Run duration in seconds
        #[arg(short, long, default_value_t = 5)]
        duration: u64,
    },

    /// Generate documentation
    Doc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--workspace"])?;
        }
        Commands::Lint => {
            run_command("cargo", &["clippy", "--workspace", "--", "-D", "warnings"])?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", &["clippy", "--workspace", "--", "-D", "warnings"])?;
            run_command("cargo", &["test", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Bench { filter } => {
            let mut args = vec![
                "bench",
                "-p",
                "nrflow-integration-tests",
                "--bench",
                "transport_benchmarks",
            ];
            if let Some(filter) = filter.as_deref() {
                args.extend(["--", filter]);
            }
            run_command("cargo", &args)?;
        }
        Commands::Smoke { duration } => {
            let duration = duration.to_string();
            run_command(
                "cargo",
                &[
                    "run",
                    "--release",
                    "-p",
                    "nrflow-cli",
                    "--",
                    "run",
                    "--spawn",
                    "process",
                    "--duration",
                    &duration,
                ],
            )?;
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program).args(args).status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}

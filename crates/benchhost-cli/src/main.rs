mod config;
mod replay_cmd;
mod report;
mod run_cmd;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use benchhost_core::BrokerOutcome;
use benchhost_core::diagnoser::BenchmarkCase;
use benchhost_core::executor::WorkerCommand;

use config::{BenchhostConfig, TransportKind};

#[derive(Parser)]
#[command(name = "benchhost", about = "Host-side broker for out-of-process benchmark workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a benchhost config file with the default timeouts
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run a worker and broker its session
    Run {
        /// Benchmark name reported to diagnosers
        #[arg(long, default_value = "benchmark")]
        name: String,
        /// Benchmark id reported to diagnosers
        #[arg(long, default_value_t = 0)]
        id: u32,
        /// Transport carrying the protocol (overrides BENCHHOST_TRANSPORT)
        #[arg(long, value_enum)]
        transport: Option<TransportKind>,
        /// How long to wait for the worker to exit after the session, in ms
        #[arg(long)]
        exit_timeout_ms: Option<u64>,
        /// Working directory for the worker
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        /// Worker program
        program: PathBuf,
        /// Arguments passed to the worker
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Replay a recorded worker transcript through the broker
    Replay {
        /// Transcript file, one worker line per line
        path: PathBuf,
        /// Benchmark name reported to diagnosers
        #[arg(long, default_value = "benchmark")]
        name: String,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Execute the `benchhost init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::default();
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  run.transport = {:?}", cfg.run.transport);
    if let Some(ms) = cfg.timeouts.process_exit_ms {
        println!("  timeouts.process_exit_ms = {ms}");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
            return Ok(());
        }
        Commands::Run {
            name,
            id,
            transport,
            exit_timeout_ms,
            cwd,
            json,
            program,
            args,
        } => {
            let config =
                BenchhostConfig::resolve(exit_timeout_ms.map(Duration::from_millis), transport)?;
            let mut worker = WorkerCommand::new(program).args(args);
            if let Some(dir) = cwd {
                worker = worker.working_dir(dir);
            }
            run_cmd::cmd_run(run_cmd::RunOptions {
                benchmark: BenchmarkCase::new(id, name),
                worker,
                config,
                json,
            })
            .await?
        }
        Commands::Replay { path, name, json } => {
            replay_cmd::cmd_replay(&path, BenchmarkCase::new(0, name), json)?
        }
    };

    if outcome != BrokerOutcome::Success {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that touch process-wide environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Rocketship engine binary.
//!
//! Three entry points: `serve` exposes the gRPC run API, `run` executes a
//! suite file in-process and streams its log to stdout, and `validate`
//! compiles a suite without running it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::{error, Level};

use rocketship::dsl::{self, CompileOptions};
use rocketship::plugins::default_registry;
use rocketship::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use rocketship::{Engine, EngineConfig, RunStatus};

#[derive(Parser)]
#[command(name = "rocketship")]
#[command(about = "Declarative end-to-end testing engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (debug level).
    #[arg(long, short = 'v', global = true, default_value = "false")]
    verbose: bool,

    /// Only errors on stderr.
    #[arg(long, short = 'q', global = true, default_value = "false")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the gRPC run API.
    Serve {
        /// Listen address (`ROCKETSHIP_BIND_ADDR` overrides the default).
        #[arg(long, default_value = "127.0.0.1:7700")]
        addr: String,
    },

    /// Execute a suite file and stream its log to stdout.
    Run {
        /// Path to the suite YAML.
        #[arg(short, long)]
        file: PathBuf,

        /// Config variable overrides, `path=value`. Repeatable; wins over
        /// inline `vars` and `ROCKETSHIP_VAR_*` environment entries.
        #[arg(long = "var", value_name = "PATH=VALUE")]
        vars: Vec<String>,

        /// Overall deadline in seconds (overrides the suite's `timeout`).
        #[arg(long)]
        timeout_seconds: Option<u64>,
    },

    /// Compile a suite file without running it.
    Validate {
        /// Path to the suite YAML.
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.log_level = if cli.quiet {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if let Err(err) = init_telemetry(telemetry_config) {
        eprintln!("warning: telemetry init failed: {err}");
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    let outcome = match &cli.command {
        Commands::Serve { addr } => serve(addr).await,
        Commands::Run {
            file,
            vars,
            timeout_seconds,
        } => run(file, vars, *timeout_seconds, cli.quiet).await,
        Commands::Validate { file } => validate(file),
    };

    shutdown_telemetry();

    match outcome {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::from(2)
        }
    }
}

async fn serve(addr: &str) -> anyhow::Result<ExitCode> {
    let addr: SocketAddr = std::env::var("ROCKETSHIP_BIND_ADDR")
        .unwrap_or_else(|_| addr.to_string())
        .parse()
        .context("invalid listen address")?;
    let engine = Arc::new(Engine::new(EngineConfig::from_env()));
    rocketship::rpc::serve(engine, addr).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run(
    file: &PathBuf,
    vars: &[String],
    timeout_seconds: Option<u64>,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    let yaml = std::fs::read_to_string(file)
        .with_context(|| format!("reading suite file {}", file.display()))?;
    let overrides = parse_overrides(vars)?;

    let engine = Engine::new(EngineConfig::from_env());
    let run_id = engine
        .create_run(&yaml, overrides, timeout_seconds.map(Duration::from_secs))
        .await?;

    let mut subscription = engine
        .subscribe_logs(&run_id)
        .await
        .ok_or_else(|| anyhow!("run '{run_id}' vanished before streaming began"))?;
    while let Some(entry) = subscription.next().await {
        if quiet {
            continue;
        }
        let scope = match (&entry.test_name, &entry.step_name) {
            (Some(test), Some(step)) => format!("{test}/{step}"),
            (Some(test), None) => test.clone(),
            _ => "suite".to_string(),
        };
        println!(
            "{} [{}] {} {}",
            entry.timestamp.to_rfc3339(),
            entry.level,
            scope,
            entry.payload
        );
    }

    let status = engine
        .wait_for_run(&run_id)
        .await
        .ok_or_else(|| anyhow!("run '{run_id}' vanished before completion"))?;
    if !quiet {
        println!("run {run_id}: {}", status.as_str());
    }
    Ok(if status == RunStatus::Passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn validate(file: &PathBuf) -> anyhow::Result<ExitCode> {
    let yaml = std::fs::read_to_string(file)
        .with_context(|| format!("reading suite file {}", file.display()))?;
    let registry = default_registry();
    match dsl::compile(&yaml, &CompileOptions::from_process_env(Vec::new()), &registry) {
        Ok(suite) => {
            println!(
                "{}: ok ({} test{})",
                suite.name,
                suite.tests.len(),
                if suite.tests.len() == 1 { "" } else { "s" }
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn parse_overrides(vars: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    vars.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("--var expects PATH=VALUE, got '{pair}'"))
        })
        .collect()
}

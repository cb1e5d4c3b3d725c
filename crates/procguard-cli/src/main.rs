mod config;

use clap::Parser;
use procguard::{Guard, GuardConfig, GuardState, OutputPipe, RunOutput, RunRecord};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use config::CliError;

/// Run a command and restart it whenever it exits.
#[derive(Parser, Debug)]
#[command(name = "procguard", version, about)]
struct Cli {
	/// TOML config file with a [guard] table
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Extra environment variable for the child (repeatable)
	#[arg(short, long = "env", value_name = "KEY=VALUE")]
	env: Vec<String>,

	/// Working directory for the child
	#[arg(short = 'C', long)]
	dir: Option<PathBuf>,

	/// Consecutive failed runs to restart before giving up (0 = unlimited)
	#[arg(long)]
	max_restarts: Option<u32>,

	/// Delay before restarting after a clean exit
	#[arg(long)]
	restart_delay_ms: Option<u64>,

	/// Terminate the child when stopping instead of leaving it running
	#[arg(long)]
	kill_on_stop: bool,

	/// Let the child write straight to this terminal
	#[arg(long)]
	no_capture: bool,

	/// Write run statistics as JSON when done
	#[arg(long, value_name = "PATH")]
	stats_json: Option<PathBuf>,

	/// Debug logging
	#[arg(short, long)]
	verbose: bool,

	/// Command and arguments (overrides the config file)
	#[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
	command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	let default_level = if cli.verbose { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
		)
		.with_writer(std::io::stderr)
		.with_target(false)
		.init();

	tracing::debug!(?cli, "parsed CLI arguments");

	match run(&cli).await {
		Ok(GuardState::Exhausted { .. }) | Ok(GuardState::Failed) => ExitCode::FAILURE,
		Ok(_) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("{}", e);
			ExitCode::FAILURE
		}
	}
}

fn build_config(cli: &Cli) -> Result<GuardConfig, CliError> {
	let mut config = match &cli.config {
		Some(path) => config::load_config(path)?,
		None => GuardConfig::default(),
	};

	if let Some((command, args)) = cli.command.split_first() {
		config.command = command.clone();
		config.args = args.to_vec();
	}
	for pair in &cli.env {
		let (key, value) = config::parse_env_pair(pair)?;
		config.env.insert(key, value);
	}
	if let Some(dir) = &cli.dir {
		config.working_dir = Some(dir.clone());
	}
	if let Some(max) = cli.max_restarts {
		config.max_restart_on_fail = max;
	}
	if let Some(delay) = cli.restart_delay_ms {
		config.restart_delay_ms = delay;
	}
	if cli.kill_on_stop {
		config.kill_on_stop = true;
	}
	if cli.no_capture {
		config.capture_output = false;
	}

	Ok(config)
}

async fn run(cli: &Cli) -> Result<GuardState, CliError> {
	let config = build_config(cli)?;
	let capture = config.capture_output;
	let guard = Arc::new(Guard::new(config)?);

	// Subscribe before starting so the first attempt is forwarded too.
	let runs = guard.subscribe_runs();
	if let Err(e) = guard.run_guarded().await {
		write_stats(cli, &guard.statistics().await)?;
		return Err(e.into());
	}

	if capture {
		tokio::spawn(forward_output(runs, tokio::io::stdout, tokio::io::stderr));
	}

	let state = tokio::select! {
		state = guard.wait() => state,
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("interrupted, stopping guard");
			guard.stop().await?;
			guard.state()
		}
	};

	let runs = guard.statistics().await;
	let failed = runs.iter().filter(|r| r.error.is_some()).count();
	tracing::info!(state = ?state, runs = runs.len(), failed, "guard finished");
	write_stats(cli, &runs)?;

	Ok(state)
}

fn write_stats(cli: &Cli, runs: &[RunRecord]) -> Result<(), CliError> {
	let Some(path) = &cli.stats_json else {
		return Ok(());
	};
	let json = serde_json::to_vec_pretty(runs)
		.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
		.and_then(|data| std::fs::write(path, data));
	json.map_err(|e| CliError::Stats {
		path: path.clone(),
		source: e,
	})
}

/// Mirror the output of every attempt, in the order they were spawned.
async fn forward_output<O, E, OW, EW>(
	mut runs: broadcast::Receiver<RunOutput>,
	stdout: O,
	stderr: E,
) where
	O: Fn() -> OW,
	E: Fn() -> EW,
	OW: AsyncWrite + Unpin + Send + 'static,
	EW: AsyncWrite + Unpin + Send + 'static,
{
	loop {
		let run = match runs.recv().await {
			Ok(run) => run,
			Err(RecvError::Lagged(skipped)) => {
				tracing::warn!(skipped, "restarting faster than output can be forwarded");
				continue;
			}
			Err(RecvError::Closed) => break,
		};

		// One attempt at a time so consecutive runs are not interleaved.
		let out = async {
			if let Some(capture) = &run.stdout {
				copy_pipe(capture.subscribe().await, stdout()).await;
			}
		};
		let err = async {
			if let Some(capture) = &run.stderr {
				copy_pipe(capture.subscribe().await, stderr()).await;
			}
		};
		tokio::join!(out, err);
	}
}

async fn copy_pipe<W: AsyncWrite + Unpin>(mut pipe: OutputPipe, mut out: W) {
	while let Some(chunk) = pipe.read().await {
		if out.write_all(&chunk).await.is_err() {
			break;
		}
		let _ = out.flush().await;
	}
}

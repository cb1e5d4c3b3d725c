use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

use crate::error::GuardError;
use crate::output::{self, OutputCapture};
use crate::stats::Statistics;
use crate::types::{GuardConfig, RunError, StreamKind};

/// A successfully spawned attempt, owned by the monitor loop.
pub(crate) struct Launched {
	pub attempt: u64,
	pub pid: u32,
	pub child: Child,
	pub stdout: Option<OutputCapture>,
	pub stderr: Option<OutputCapture>,
}

pub(crate) fn build_command(config: &GuardConfig) -> Command {
	let mut cmd = Command::new(&config.command);
	cmd.args(&config.args)
		.stdin(Stdio::null())
		.process_group(0);

	if let Some(dir) = &config.working_dir {
		cmd.current_dir(dir);
	}

	// Layered over the inherited environment, same keys win.
	cmd.envs(&config.env);

	if config.capture_output {
		cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
	} else {
		cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
	}

	cmd
}

/// Start one attempt: open its record, spawn, wire up output capture.
///
/// A spawn failure is written to the record before it is returned.
pub(crate) async fn launch(config: &GuardConfig, stats: &Statistics) -> Result<Launched, GuardError> {
	let attempt = stats.begin().await;

	tracing::info!(
		attempt,
		command = %config.command,
		args = ?config.args,
		"spawning guarded process"
	);

	let spawned = build_command(config).spawn();
	let mut child = match spawned {
		Ok(child) => child,
		Err(e) => {
			tracing::warn!(attempt, command = %config.command, error = %e, "spawn failed");
			stats
				.finish(
					attempt,
					None,
					Some(RunError::Spawn {
						message: e.to_string(),
					}),
				)
				.await;
			return Err(GuardError::Spawn {
				command: config.command.clone(),
				source: e,
			});
		}
	};

	let pid = child.id().unwrap_or(0);
	stats.set_pid(attempt, pid).await;
	tracing::info!(attempt, pid, "guarded process started");

	let stdout = child.stdout.take().map(|reader| {
		let capture = OutputCapture::new(attempt, StreamKind::Stdout);
		tokio::spawn(output::pump(reader, capture.clone()));
		capture
	});
	let stderr = child.stderr.take().map(|reader| {
		let capture = OutputCapture::new(attempt, StreamKind::Stderr);
		tokio::spawn(output::pump(reader, capture.clone()));
		capture
	});

	Ok(Launched {
		attempt,
		pid,
		child,
		stdout,
		stderr,
	})
}

/// Split an exit status into the recorded exit code and failure kind.
pub(crate) fn classify_exit(status: ExitStatus) -> (Option<i32>, Option<RunError>) {
	match status.code() {
		Some(0) => (Some(0), None),
		Some(code) => (Some(code), Some(RunError::ExitCode { code })),
		None => match status.signal() {
			Some(signal) => (None, Some(RunError::Signal { signal })),
			None => (
				None,
				Some(RunError::Wait {
					message: format!("unknown exit status: {:?}", status),
				}),
			),
		},
	}
}

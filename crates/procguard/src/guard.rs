use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::GuardError;
use crate::launcher::{self, Launched};
use crate::output::{OutputCapture, OutputPipe};
use crate::restart::{RestartDecision, RestartPolicy};
use crate::stats::Statistics;
use crate::types::*;

/// Supervises one external command.
///
/// [`Guard::run_guarded`] starts the command and a background monitor loop
/// that restarts it whenever it exits, until [`Guard::stop`] is called or the
/// restart limit is reached. Every attempt is recorded in
/// [`Guard::statistics`].
pub struct Guard {
	config: Arc<GuardConfig>,
	shared: Arc<Shared>,
	started: AtomicBool,
	control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
	stop_requested: bool,
	stop_tx: Option<oneshot::Sender<()>>,
	monitor: Option<JoinHandle<()>>,
}

struct Shared {
	stats: Statistics,
	current: RwLock<Option<RunOutput>>,
	state: watch::Sender<GuardState>,
	runs: broadcast::Sender<RunOutput>,
}

const RUNS_CAPACITY: usize = 64;

/// A freshly spawned attempt and its output captures.
///
/// Sent to every [`Guard::subscribe_runs`] receiver as each attempt starts,
/// so no attempt is missed even when state changes are coalesced.
#[derive(Debug, Clone)]
pub struct RunOutput {
	pub attempt: u64,
	pub pid: u32,
	pub stdout: Option<OutputCapture>,
	pub stderr: Option<OutputCapture>,
}

impl Guard {
	pub fn new(config: GuardConfig) -> Result<Self, GuardError> {
		if config.command.trim().is_empty() {
			return Err(GuardError::InvalidConfig("command is empty".into()));
		}
		if config.backoff_initial_ms > config.backoff_max_ms {
			return Err(GuardError::InvalidConfig(format!(
				"backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
				config.backoff_initial_ms, config.backoff_max_ms
			)));
		}
		if config.backoff_initial_ms == 0 {
			return Err(GuardError::InvalidConfig(
				"backoff_initial_ms must be at least 1".into(),
			));
		}

		let (state, _) = watch::channel(GuardState::Idle);
		let (runs, _) = broadcast::channel(RUNS_CAPACITY);
		Ok(Self {
			config: Arc::new(config),
			shared: Arc::new(Shared {
				stats: Statistics::new(),
				current: RwLock::new(None),
				state,
				runs,
			}),
			started: AtomicBool::new(false),
			control: Mutex::new(Control::default()),
		})
	}

	pub fn config(&self) -> &GuardConfig {
		&self.config
	}

	/// Start supervising. Only the first call does anything.
	///
	/// The first attempt is spawned before this returns; if that spawn fails
	/// the error is returned, the guard ends up in [`GuardState::Failed`] and
	/// no monitor loop is started. Must be called inside a tokio runtime.
	pub async fn run_guarded(&self) -> Result<(), GuardError> {
		if self
			.started
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Ok(());
		}

		let mut control = self.control.lock().await;
		if control.stop_requested {
			self.shared.set_state(GuardState::Stopped);
			return Ok(());
		}

		let first = match self.shared.launch(&self.config).await {
			Ok(launched) => launched,
			Err(e) => {
				self.shared.set_state(GuardState::Failed);
				return Err(e);
			}
		};

		let (stop_tx, stop_rx) = oneshot::channel();
		let config = Arc::clone(&self.config);
		let shared = Arc::clone(&self.shared);
		control.stop_tx = Some(stop_tx);
		control.monitor = Some(tokio::spawn(async move {
			monitor_loop(config, shared, first, stop_rx).await;
		}));

		Ok(())
	}

	/// Ask the monitor loop to stop and wait until it has exited.
	///
	/// The running child is not killed unless `kill_on_stop` is set.
	/// Concurrent callers all return only once the guard is in a terminal
	/// state. Returns [`GuardError::NotStarted`] before [`Guard::run_guarded`].
	pub async fn stop(&self) -> Result<(), GuardError> {
		if !self.started.load(Ordering::Acquire) {
			return Err(GuardError::NotStarted);
		}

		let monitor = {
			let mut control = self.control.lock().await;
			control.stop_requested = true;
			if let Some(tx) = control.stop_tx.take() {
				let _ = tx.send(());
			}
			control.monitor.take()
		};

		if let Some(handle) = monitor {
			if let Err(e) = handle.await {
				tracing::error!(error = %e, "monitor loop panicked");
				self.shared.set_state(GuardState::Stopped);
			}
		}
		// Another caller may own the handle; wait for the loop's final state.
		self.wait().await;
		Ok(())
	}

	/// Wait for the monitor loop to end on its own (stop or restart limit).
	///
	/// Returns immediately with [`GuardState::Idle`] if never started.
	pub async fn wait(&self) -> GuardState {
		if !self.started.load(Ordering::Acquire) {
			return GuardState::Idle;
		}
		let mut rx = self.shared.state.subscribe();
		let state = match rx.wait_for(|state| state.is_terminal()).await {
			Ok(state) => state.clone(),
			Err(_) => self.state(),
		};
		state
	}

	pub fn state(&self) -> GuardState {
		self.shared.state.borrow().clone()
	}

	pub fn subscribe(&self) -> watch::Receiver<GuardState> {
		self.shared.state.subscribe()
	}

	/// Receive every attempt spawned after this call, in order.
	pub fn subscribe_runs(&self) -> broadcast::Receiver<RunOutput> {
		self.shared.runs.subscribe()
	}

	/// Snapshot of all run attempts, oldest first.
	pub async fn statistics(&self) -> Vec<RunRecord> {
		self.shared.stats.snapshot().await
	}

	/// Attempt index of the most recently spawned process.
	pub async fn current_attempt(&self) -> Option<u64> {
		self.shared.current.read().await.as_ref().map(|run| run.attempt)
	}

	pub async fn pid(&self) -> Option<u32> {
		self.shared.current.read().await.as_ref().map(|run| run.pid)
	}

	pub async fn stdout_pipe(&self) -> Result<OutputPipe, GuardError> {
		self.shared.pipe(StreamKind::Stdout).await
	}

	pub async fn stderr_pipe(&self) -> Result<OutputPipe, GuardError> {
		self.shared.pipe(StreamKind::Stderr).await
	}
}

impl Shared {
	fn set_state(&self, state: GuardState) {
		self.state.send_replace(state);
	}

	/// Spawn an attempt and make it the current run.
	async fn launch(&self, config: &GuardConfig) -> Result<Launched, GuardError> {
		let launched = launcher::launch(config, &self.stats).await?;
		let run = RunOutput {
			attempt: launched.attempt,
			pid: launched.pid,
			stdout: launched.stdout.clone(),
			stderr: launched.stderr.clone(),
		};
		*self.current.write().await = Some(run.clone());
		// No receivers is fine.
		let _ = self.runs.send(run);
		self.set_state(GuardState::Running {
			attempt: launched.attempt,
			pid: launched.pid,
		});
		Ok(launched)
	}

	async fn pipe(&self, stream: StreamKind) -> Result<OutputPipe, GuardError> {
		let current = self.current.read().await;
		let run = current.as_ref().ok_or(GuardError::NotStarted)?;
		let capture = match stream {
			StreamKind::Stdout => run.stdout.as_ref(),
			StreamKind::Stderr => run.stderr.as_ref(),
		}
		.ok_or(GuardError::OutputNotCaptured)?;
		Ok(capture.subscribe().await)
	}

	async fn record_exit(&self, attempt: u64, pid: u32, status: io::Result<ExitStatus>) -> bool {
		let (exit_code, error) = match status {
			Ok(status) => launcher::classify_exit(status),
			Err(e) => (
				None,
				Some(RunError::Wait {
					message: e.to_string(),
				}),
			),
		};

		match &error {
			None => tracing::info!(attempt, pid, "guarded process exited cleanly"),
			Some(err) => tracing::warn!(attempt, pid, error = %err, "guarded process failed"),
		}

		let failed = error.is_some();
		self.stats.finish(attempt, exit_code, error).await;
		failed
	}

	/// Let go of the running child after a stop request.
	async fn release(&self, config: &GuardConfig, mut run: Launched) {
		if config.kill_on_stop {
			tracing::info!(attempt = run.attempt, pid = run.pid, "stopping guarded process");
			let status = terminate(&mut run.child, run.pid, config.kill_grace()).await;
			self.record_exit(run.attempt, run.pid, status).await;
		} else {
			tracing::info!(
				attempt = run.attempt,
				pid = run.pid,
				"supervision stopped, leaving process running"
			);
			// Reaper only; nothing is reported back.
			tokio::spawn(async move {
				let _ = run.child.wait().await;
			});
		}
	}
}

/// Drive one guard: wait for each run, record it, restart it, until stopped
/// or the restart policy gives up.
async fn monitor_loop(
	config: Arc<GuardConfig>,
	shared: Arc<Shared>,
	first: Launched,
	mut stop_rx: oneshot::Receiver<()>,
) {
	let mut policy = RestartPolicy::from_config(&config);
	let mut launched = Ok(first);

	let final_state = loop {
		let failed = match launched {
			Ok(mut run) => {
				// A dropped sender means the guard itself is gone; treat it as stop.
				let status = tokio::select! {
					biased;
					_ = &mut stop_rx => {
						shared.release(&config, run).await;
						break GuardState::Stopped;
					}
					status = run.child.wait() => status,
				};
				shared.record_exit(run.attempt, run.pid, status).await
			}
			// Already recorded by the launcher.
			Err(_) => true,
		};

		let decision = if failed {
			policy.on_failure()
		} else {
			policy.on_success()
		};
		let delay = match decision {
			RestartDecision::Restart { delay } => delay,
			RestartDecision::GiveUp { failures } => break GuardState::Exhausted { failures },
		};

		// Published even for a zero delay so the state never names a dead pid.
		shared.set_state(GuardState::Restarting {
			attempt: shared.stats.len().await as u64,
			delay_ms: delay.as_millis() as u64,
		});
		if !delay.is_zero() {
			tokio::select! {
				biased;
				_ = &mut stop_rx => break GuardState::Stopped,
				_ = tokio::time::sleep(delay) => {}
			}
		}

		// Stop always wins over a pending restart.
		match stop_rx.try_recv() {
			Err(oneshot::error::TryRecvError::Empty) => {}
			_ => break GuardState::Stopped,
		}

		launched = shared.launch(&config).await;
	};

	tracing::info!(state = ?final_state, "monitor loop finished");
	shared.set_state(final_state);
}

/// SIGTERM the child's process group, SIGKILL it after `grace`.
async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> io::Result<ExitStatus> {
	use nix::sys::signal::Signal;

	signal_group(child, pid, Signal::SIGTERM);
	match tokio::time::timeout(grace, child.wait()).await {
		Ok(status) => status,
		Err(_) => {
			tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "process ignored SIGTERM, killing");
			signal_group(child, pid, Signal::SIGKILL);
			child.wait().await
		}
	}
}

fn signal_group(child: &mut Child, pid: u32, signal: nix::sys::signal::Signal) {
	use nix::sys::signal::killpg;
	use nix::unistd::Pid;

	// pid 0 would address our own group.
	if pid == 0 {
		let _ = child.start_kill();
		return;
	}
	if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
		tracing::debug!(pid, ?signal, error = %e, "killpg failed");
	}
}

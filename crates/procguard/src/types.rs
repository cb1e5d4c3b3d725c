use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Everything a [`Guard`](crate::Guard) needs to launch and restart one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
	#[serde(default)]
	pub command: String,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub env: HashMap<String, String>,
	#[serde(default)]
	pub working_dir: Option<PathBuf>,
	/// Consecutive restarts allowed after failed runs. `0` means unlimited.
	#[serde(default)]
	pub max_restart_on_fail: u32,
	#[serde(default)]
	pub restart_delay_ms: u64,
	#[serde(default = "default_backoff_initial")]
	pub backoff_initial_ms: u64,
	#[serde(default = "default_backoff_max")]
	pub backoff_max_ms: u64,
	#[serde(default = "default_true")]
	pub capture_output: bool,
	#[serde(default)]
	pub kill_on_stop: bool,
	#[serde(default = "default_kill_grace")]
	pub kill_grace_ms: u64,
}

fn default_true() -> bool {
	true
}
fn default_backoff_initial() -> u64 {
	100
}
fn default_backoff_max() -> u64 {
	30_000
}
fn default_kill_grace() -> u64 {
	3_000
}

impl Default for GuardConfig {
	fn default() -> Self {
		Self {
			command: String::new(),
			args: Vec::new(),
			env: HashMap::new(),
			working_dir: None,
			max_restart_on_fail: 0,
			restart_delay_ms: 0,
			backoff_initial_ms: default_backoff_initial(),
			backoff_max_ms: default_backoff_max(),
			capture_output: true,
			kill_on_stop: false,
			kill_grace_ms: default_kill_grace(),
		}
	}
}

impl GuardConfig {
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			..Default::default()
		}
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.env.insert(key.into(), value.into());
		self
	}

	pub fn kill_grace(&self) -> Duration {
		Duration::from_millis(self.kill_grace_ms)
	}
}

/// Why a single run ended badly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
	Spawn { message: String },
	ExitCode { code: i32 },
	Signal { signal: i32 },
	Wait { message: String },
}

impl std::fmt::Display for RunError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RunError::Spawn { message } => write!(f, "spawn failed: {}", message),
			RunError::ExitCode { code } => write!(f, "exited with code {}", code),
			RunError::Signal { signal } => write!(f, "killed by signal {}", signal),
			RunError::Wait { message } => write!(f, "wait failed: {}", message),
		}
	}
}

/// One attempt to run the guarded command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
	pub attempt: u64,
	pub pid: Option<u32>,
	pub start: SystemTime,
	pub finish: Option<SystemTime>,
	pub exit_code: Option<i32>,
	pub error: Option<RunError>,
}

impl RunRecord {
	pub fn new(attempt: u64) -> Self {
		Self {
			attempt,
			pid: None,
			start: SystemTime::now(),
			finish: None,
			exit_code: None,
			error: None,
		}
	}

	pub fn is_finished(&self) -> bool {
		self.finish.is_some()
	}

	/// Clean runs exit with code 0.
	pub fn is_success(&self) -> bool {
		self.is_finished() && self.error.is_none()
	}

	pub fn duration(&self) -> Option<Duration> {
		self.finish
			.and_then(|finish| finish.duration_since(self.start).ok())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardState {
	Idle,
	Running { attempt: u64, pid: u32 },
	Restarting { attempt: u64, delay_ms: u64 },
	Stopped,
	Exhausted { failures: u32 },
	Failed,
}

impl GuardState {
	pub fn is_running(&self) -> bool {
		matches!(self, GuardState::Running { .. })
	}

	/// The monitor loop has ended and will not start anything again.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			GuardState::Stopped | GuardState::Exhausted { .. } | GuardState::Failed
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
	Stdout,
	Stderr,
}

impl std::fmt::Display for StreamKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			StreamKind::Stdout => write!(f, "stdout"),
			StreamKind::Stderr => write!(f, "stderr"),
		}
	}
}

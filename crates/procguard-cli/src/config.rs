use procguard::{GuardConfig, GuardError};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};

/// Layout of a procguard TOML file. Everything lives under `[guard]`.
///
/// ```toml
/// [guard]
/// command = "my-server"
/// args = ["--port", "8080"]
/// max_restart_on_fail = 5
///
/// [guard.env]
/// RUST_LOG = "info"
/// ```
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
	#[serde(default)]
	pub guard: GuardConfig,
}

#[derive(Debug)]
pub enum CliError {
	Read { path: PathBuf, source: io::Error },
	Parse { path: PathBuf, message: String },
	Env(String),
	Guard(GuardError),
	Stats { path: PathBuf, source: io::Error },
}

impl std::fmt::Display for CliError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			CliError::Read { path, source } => {
				write!(f, "failed to read {}: {}", path.display(), source)
			}
			CliError::Parse { path, message } => {
				write!(f, "invalid config {}: {}", path.display(), message)
			}
			CliError::Env(msg) => write!(f, "invalid --env: {}", msg),
			CliError::Guard(e) => write!(f, "{}", e),
			CliError::Stats { path, source } => {
				write!(f, "failed to write statistics to {}: {}", path.display(), source)
			}
		}
	}
}

impl std::error::Error for CliError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			CliError::Read { source, .. } => Some(source),
			CliError::Guard(e) => Some(e),
			CliError::Stats { source, .. } => Some(source),
			_ => None,
		}
	}
}

impl From<GuardError> for CliError {
	fn from(e: GuardError) -> Self {
		CliError::Guard(e)
	}
}

pub fn load_config(path: &Path) -> Result<GuardConfig, CliError> {
	let content = std::fs::read_to_string(path).map_err(|e| CliError::Read {
		path: path.to_path_buf(),
		source: e,
	})?;
	parse_config(&content).map_err(|message| CliError::Parse {
		path: path.to_path_buf(),
		message,
	})
}

pub fn parse_config(content: &str) -> Result<GuardConfig, String> {
	toml::from_str::<ConfigFile>(content)
		.map(|file| file.guard)
		.map_err(|e| e.to_string())
}

/// Parse a `KEY=VALUE` pair as given to `--env`.
pub fn parse_env_pair(pair: &str) -> Result<(String, String), CliError> {
	match pair.split_once('=') {
		Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
		_ => Err(CliError::Env(format!("expected KEY=VALUE, got {:?}", pair))),
	}
}

use std::io;

/// Errors returned by [`Guard`](crate::Guard) operations.
#[derive(Debug)]
pub enum GuardError {
	/// The configuration cannot be run (empty command, ...).
	InvalidConfig(String),
	/// The OS refused to create the process.
	Spawn { command: String, source: io::Error },
	/// No process has been started yet.
	NotStarted,
	/// Output is inherited by the child, so there is nothing to attach to.
	OutputNotCaptured,
}

impl std::fmt::Display for GuardError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			GuardError::InvalidConfig(msg) => write!(f, "invalid guard config: {}", msg),
			GuardError::Spawn { command, source } => {
				write!(f, "failed to spawn {}: {}", command, source)
			}
			GuardError::NotStarted => write!(f, "guarded process not started"),
			GuardError::OutputNotCaptured => {
				write!(f, "output is not captured (capture_output = false)")
			}
		}
	}
}

impl std::error::Error for GuardError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			GuardError::Spawn { source, .. } => Some(source),
			_ => None,
		}
	}
}

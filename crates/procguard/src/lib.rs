//! # procguard
//!
//! Keep one external command running.
//!
//! A [`Guard`] spawns the command, waits for it to exit, records the run and
//! starts it again, until [`Guard::stop`] is called or the restart limit is
//! reached. The child's stdout and stderr can be attached to while it runs.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use procguard::{Guard, GuardConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), procguard::GuardError> {
//! let config = GuardConfig {
//!     max_restart_on_fail: 5,
//!     ..GuardConfig::new("my-server").args(["--port", "8080"])
//! };
//!
//! let guard = Guard::new(config)?;
//! guard.run_guarded().await?;
//!
//! let mut stdout = guard.stdout_pipe().await?;
//! while let Some(chunk) = stdout.read().await {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//!
//! guard.stop().await?;
//! for run in guard.statistics().await {
//!     println!("#{} {:?}", run.attempt, run.error);
//! }
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod stats;
pub mod output;
pub mod restart;
mod launcher;
pub mod guard;

pub use types::*;
pub use error::GuardError;
pub use stats::Statistics;
pub use output::{OutputCapture, OutputPipe};
pub use restart::{RestartDecision, RestartPolicy};
pub use guard::{Guard, RunOutput};

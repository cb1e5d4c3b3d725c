use std::time::Duration;
use tracing::{debug, warn};

use crate::types::GuardConfig;

/// What the monitor loop should do after a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
	/// Start the next attempt after `delay`.
	Restart { delay: Duration },
	/// Too many consecutive failures, stop supervising.
	GiveUp { failures: u32 },
}

/// Restart limit and backoff for one guard.
///
/// A clean exit resets the failure streak and restarts after the fixed
/// restart delay. Each failure doubles the backoff up to the cap; once the
/// streak exceeds `max_restart_on_fail` (when non-zero) the guard gives up.
pub struct RestartPolicy {
	max_restart_on_fail: u32,
	restart_delay: Duration,
	backoff_initial: Duration,
	backoff_max: Duration,
	consecutive_failures: u32,
}

impl RestartPolicy {
	pub fn new(
		max_restart_on_fail: u32,
		restart_delay: Duration,
		backoff_initial: Duration,
		backoff_max: Duration,
	) -> Self {
		Self {
			max_restart_on_fail,
			restart_delay,
			backoff_initial,
			backoff_max,
			consecutive_failures: 0,
		}
	}

	pub fn from_config(config: &GuardConfig) -> Self {
		Self::new(
			config.max_restart_on_fail,
			Duration::from_millis(config.restart_delay_ms),
			Duration::from_millis(config.backoff_initial_ms),
			Duration::from_millis(config.backoff_max_ms),
		)
	}

	pub fn on_success(&mut self) -> RestartDecision {
		if self.consecutive_failures > 0 {
			debug!(
				failures = self.consecutive_failures,
				"clean exit, failure streak reset"
			);
		}
		self.consecutive_failures = 0;
		RestartDecision::Restart {
			delay: self.restart_delay,
		}
	}

	pub fn on_failure(&mut self) -> RestartDecision {
		self.consecutive_failures = self.consecutive_failures.saturating_add(1);

		if self.max_restart_on_fail > 0 && self.consecutive_failures > self.max_restart_on_fail {
			warn!(
				failures = self.consecutive_failures,
				max_restart_on_fail = self.max_restart_on_fail,
				"restart limit reached, giving up"
			);
			return RestartDecision::GiveUp {
				failures: self.consecutive_failures,
			};
		}

		let delay = self.backoff_delay();
		debug!(
			failures = self.consecutive_failures,
			delay_ms = delay.as_millis() as u64,
			"run failed, backing off"
		);
		RestartDecision::Restart { delay }
	}

	fn backoff_delay(&self) -> Duration {
		let exponent = self.consecutive_failures.saturating_sub(1).min(31);
		self.backoff_initial
			.checked_mul(1u32 << exponent)
			.unwrap_or(self.backoff_max)
			.min(self.backoff_max)
	}

	pub fn consecutive_failures(&self) -> u32 {
		self.consecutive_failures
	}
}

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procguard::*;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> std::path::PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!(
		"procguard-test-{}-{}-{}",
		std::process::id(),
		n,
		name
	));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

fn sh(script: &str) -> GuardConfig {
	GuardConfig {
		restart_delay_ms: 10,
		backoff_initial_ms: 10,
		backoff_max_ms: 50,
		kill_on_stop: true,
		kill_grace_ms: 500,
		..GuardConfig::new("sh").args(["-c", script])
	}
}

/// Poll the guard until it has recorded at least `n` runs.
async fn wait_for_runs(guard: &Guard, n: usize) -> Vec<RunRecord> {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
	loop {
		let runs = guard.statistics().await;
		if runs.len() >= n {
			return runs;
		}
		assert!(
			tokio::time::Instant::now() < deadline,
			"timed out waiting for {} runs, have {}",
			n,
			runs.len()
		);
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

fn process_alive(pid: u32) -> bool {
	nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

// --- Config ---

#[test]
fn empty_command_is_rejected() {
	let err = Guard::new(GuardConfig::default()).err().unwrap();
	assert!(matches!(err, GuardError::InvalidConfig(_)));
}

#[test]
fn inverted_backoff_is_rejected() {
	let config = GuardConfig {
		backoff_initial_ms: 500,
		backoff_max_ms: 100,
		..GuardConfig::new("true")
	};
	assert!(matches!(
		Guard::new(config).err().unwrap(),
		GuardError::InvalidConfig(_)
	));
}

#[test]
fn zero_backoff_is_rejected() {
	let config = GuardConfig {
		backoff_initial_ms: 0,
		backoff_max_ms: 0,
		..GuardConfig::new("true")
	};
	assert!(matches!(
		Guard::new(config).err().unwrap(),
		GuardError::InvalidConfig(_)
	));
}

#[test]
fn config_defaults_from_minimal_json() {
	let config: GuardConfig = serde_json::from_str(r#"{"command": "echo"}"#).unwrap();
	assert_eq!(config.command, "echo");
	assert!(config.args.is_empty());
	assert!(config.env.is_empty());
	assert_eq!(config.max_restart_on_fail, 0);
	assert!(config.capture_output);
	assert!(!config.kill_on_stop);
	assert_eq!(config.backoff_initial_ms, 100);
	assert_eq!(config.backoff_max_ms, 30_000);
}

#[test]
fn run_error_serializes_tagged() {
	let json = serde_json::to_string(&RunError::ExitCode { code: 3 }).unwrap();
	assert_eq!(json, r#"{"kind":"exit_code","code":3}"#);
}

// --- Before start ---

#[tokio::test]
async fn pipes_before_start_fail_not_started() {
	let guard = Guard::new(GuardConfig::new("echo").args(["hi"])).unwrap();
	assert!(matches!(
		guard.stdout_pipe().await.err().unwrap(),
		GuardError::NotStarted
	));
	assert!(matches!(
		guard.stderr_pipe().await.err().unwrap(),
		GuardError::NotStarted
	));
	assert_eq!(guard.state(), GuardState::Idle);
	assert!(guard.statistics().await.is_empty());
}

#[tokio::test]
async fn stop_before_start_fails_not_started() {
	let guard = Guard::new(GuardConfig::new("echo")).unwrap();
	assert!(matches!(guard.stop().await, Err(GuardError::NotStarted)));
	assert_eq!(guard.wait().await, GuardState::Idle);
}

// --- Start ---

#[tokio::test]
async fn spawn_failure_is_returned_and_recorded() {
	let guard = Guard::new(GuardConfig::new("/nonexistent/binary")).unwrap();

	let err = guard.run_guarded().await.err().unwrap();
	assert!(matches!(err, GuardError::Spawn { .. }));
	assert_eq!(guard.state(), GuardState::Failed);

	let runs = guard.statistics().await;
	assert_eq!(runs.len(), 1);
	assert!(matches!(runs[0].error, Some(RunError::Spawn { .. })));
	assert!(runs[0].finish.unwrap() >= runs[0].start);

	// Nothing to stop, and a second start stays a no-op.
	assert!(guard.stop().await.is_ok());
	assert!(guard.run_guarded().await.is_ok());
	assert_eq!(guard.statistics().await.len(), 1);
}

#[tokio::test]
async fn concurrent_run_guarded_spawns_once() {
	let guard = Arc::new(Guard::new(sh("sleep 30")).unwrap());

	let mut handles = Vec::new();
	for _ in 0..16 {
		let g = Arc::clone(&guard);
		handles.push(tokio::spawn(async move { g.run_guarded().await }));
	}
	for h in handles {
		assert!(h.await.unwrap().is_ok());
	}

	tokio::time::sleep(Duration::from_millis(200)).await;
	let runs = guard.statistics().await;
	assert_eq!(runs.len(), 1);
	assert!(guard.state().is_running());

	guard.stop().await.unwrap();
}

#[tokio::test]
async fn echo_restarts_until_stopped() {
	let guard = Guard::new(GuardConfig {
		restart_delay_ms: 5,
		..GuardConfig::new("echo").args(["hi"])
	})
	.unwrap();
	guard.run_guarded().await.unwrap();

	wait_for_runs(&guard, 4).await;
	guard.stop().await.unwrap();
	assert_eq!(guard.state(), GuardState::Stopped);

	let runs = guard.statistics().await;
	for (i, run) in runs.iter().enumerate() {
		assert_eq!(run.attempt, i as u64);
	}
	for run in &runs[..runs.len() - 1] {
		let finish = run.finish.expect("earlier runs are finished");
		assert!(finish >= run.start);
		assert_eq!(run.exit_code, Some(0));
		assert!(run.error.is_none());
	}
	for pair in runs.windows(2) {
		assert!(pair[1].start >= pair[0].start);
	}

	// No further records after stop.
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(guard.statistics().await.len(), runs.len());
}

#[tokio::test]
async fn environment_reaches_child() {
	let config = sh("printf '%s|%s' \"$FOO\" \"${PATH:+path}\"; sleep 30").env("FOO", "bar");
	let guard = Guard::new(config).unwrap();
	guard.run_guarded().await.unwrap();

	let mut pipe = guard.stdout_pipe().await.unwrap();
	let chunk = tokio::time::timeout(Duration::from_secs(5), pipe.read())
		.await
		.unwrap()
		.unwrap();
	let text = String::from_utf8(chunk).unwrap();
	assert_eq!(text, "bar|path", "inherited variables are kept alongside FOO");

	guard.stop().await.unwrap();
}

// --- Restart policy ---

#[tokio::test]
async fn restart_limit_exhausts_guard() {
	let guard = Guard::new(GuardConfig {
		max_restart_on_fail: 2,
		..sh("exit 3")
	})
	.unwrap();
	guard.run_guarded().await.unwrap();

	let state = tokio::time::timeout(Duration::from_secs(10), guard.wait())
		.await
		.unwrap();
	assert_eq!(state, GuardState::Exhausted { failures: 3 });

	let runs = guard.statistics().await;
	assert_eq!(runs.len(), 3);
	for run in &runs {
		assert_eq!(run.exit_code, Some(3));
		assert_eq!(run.error, Some(RunError::ExitCode { code: 3 }));
		assert!(run.finish.unwrap() >= run.start);
	}

	// Stopping an exhausted guard is fine.
	assert!(guard.stop().await.is_ok());
	assert_eq!(guard.state(), GuardState::Exhausted { failures: 3 });
}

#[tokio::test]
async fn spawn_failure_during_restart_is_recorded() {
	let dir = temp_dir("vanishing-cwd");
	// The first run deletes its own working directory, so every restart fails to spawn.
	let guard = Guard::new(GuardConfig {
		working_dir: Some(dir.clone()),
		max_restart_on_fail: 2,
		..sh(&format!("rmdir '{}'; exit 1", dir.display()))
	})
	.unwrap();
	guard.run_guarded().await.unwrap();

	let state = tokio::time::timeout(Duration::from_secs(10), guard.wait())
		.await
		.unwrap();
	assert_eq!(state, GuardState::Exhausted { failures: 3 });

	let runs = guard.statistics().await;
	assert_eq!(runs.len(), 3);
	assert_eq!(runs[0].error, Some(RunError::ExitCode { code: 1 }));
	for run in &runs[1..] {
		assert!(matches!(run.error, Some(RunError::Spawn { .. })));
		assert!(run.pid.is_none());
		assert!(run.finish.unwrap() >= run.start);
	}

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn unlimited_spawn_failures_are_rate_limited() {
	let dir = temp_dir("vanishing-cwd-unlimited");
	let guard = Guard::new(GuardConfig {
		working_dir: Some(dir.clone()),
		max_restart_on_fail: 0,
		backoff_initial_ms: 20,
		backoff_max_ms: 20,
		..sh(&format!("rmdir '{}'; exit 1", dir.display()))
	})
	.unwrap();
	guard.run_guarded().await.unwrap();

	tokio::time::sleep(Duration::from_millis(400)).await;
	guard.stop().await.unwrap();
	assert_eq!(guard.state(), GuardState::Stopped);

	// One attempt per backoff period at most, plus the first run.
	let runs = guard.statistics().await;
	assert!(runs.len() >= 3, "only {} runs", runs.len());
	assert!(runs.len() <= 30, "{} runs in 400ms", runs.len());
	for run in &runs[1..] {
		assert!(matches!(run.error, Some(RunError::Spawn { .. })));
	}

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_delay_restart_passes_through_restarting() {
	let guard = Guard::new(GuardConfig {
		restart_delay_ms: 0,
		..sh("true")
	})
	.unwrap();
	let mut rx = guard.subscribe();
	guard.run_guarded().await.unwrap();

	let mut seen = Vec::new();
	let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
	while let Ok(Ok(())) = tokio::time::timeout_at(deadline, rx.changed()).await {
		seen.push(rx.borrow_and_update().clone());
	}
	guard.stop().await.unwrap();

	assert!(
		seen.iter()
			.any(|s| matches!(s, GuardState::Restarting { delay_ms: 0, .. })),
		"never left Running between attempts: {:?}",
		seen.iter().take(10).collect::<Vec<_>>()
	);
	// A Restarting state always names the attempt about to start.
	let runs = guard.statistics().await;
	for state in &seen {
		if let GuardState::Restarting { attempt, .. } = state {
			assert!((*attempt as usize) <= runs.len());
		}
	}
}

#[tokio::test]
async fn stop_during_zero_delay_restarts_is_final() {
	for i in 0..10u64 {
		let guard = Guard::new(GuardConfig {
			restart_delay_ms: 0,
			..sh("true")
		})
		.unwrap();
		guard.run_guarded().await.unwrap();
		tokio::time::sleep(Duration::from_millis(i * 7)).await;

		guard.stop().await.unwrap();
		assert_eq!(guard.state(), GuardState::Stopped);
		let runs = guard.statistics().await;

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(guard.statistics().await.len(), runs.len());
		for (index, run) in runs.iter().enumerate() {
			assert_eq!(run.attempt, index as u64);
			assert!(run.is_finished(), "attempt {} left unfinished", index);
		}
	}
}

// --- Stop ---

#[tokio::test]
async fn concurrent_stops_both_wait_for_exit() {
	let guard = Arc::new(
		Guard::new(GuardConfig {
			kill_grace_ms: 1_000,
			..sh("trap '' TERM; sleep 30")
		})
		.unwrap(),
	);
	guard.run_guarded().await.unwrap();
	// Let the shell install its trap.
	tokio::time::sleep(Duration::from_millis(200)).await;

	let first = tokio::spawn({
		let guard = Arc::clone(&guard);
		async move { guard.stop().await }
	});
	tokio::time::sleep(Duration::from_millis(50)).await;

	// The first stop is still inside the kill grace period.
	guard.stop().await.unwrap();
	assert_eq!(guard.state(), GuardState::Stopped);
	let runs = guard.statistics().await;
	assert_eq!(runs.len(), 1);
	assert_eq!(runs[0].error, Some(RunError::Signal { signal: 9 }));

	first.await.unwrap().unwrap();
	assert_eq!(guard.state(), GuardState::Stopped);
}

#[tokio::test]
async fn stop_during_backoff_is_prompt() {
	let guard = Guard::new(GuardConfig {
		backoff_initial_ms: 5_000,
		backoff_max_ms: 5_000,
		..sh("exit 1")
	})
	.unwrap();
	guard.run_guarded().await.unwrap();

	let mut rx = guard.subscribe();
	tokio::time::timeout(
		Duration::from_secs(5),
		rx.wait_for(|s| matches!(s, GuardState::Restarting { .. })),
	)
	.await
	.unwrap()
	.unwrap();

	let started = std::time::Instant::now();
	guard.stop().await.unwrap();
	assert!(started.elapsed() < Duration::from_secs(1));
	assert_eq!(guard.statistics().await.len(), 1);
}

#[tokio::test]
async fn stop_with_kill_records_signal() {
	let guard = Guard::new(sh("sleep 30")).unwrap();
	guard.run_guarded().await.unwrap();
	let pid = guard.pid().await.unwrap();
	assert!(process_alive(pid));

	guard.stop().await.unwrap();

	let runs = guard.statistics().await;
	assert_eq!(runs.len(), 1);
	assert_eq!(runs[0].error, Some(RunError::Signal { signal: 15 }));
	assert!(runs[0].finish.is_some());
}

#[tokio::test]
async fn stop_without_kill_leaves_child_running() {
	let guard = Guard::new(GuardConfig {
		kill_on_stop: false,
		..sh("sleep 30")
	})
	.unwrap();
	guard.run_guarded().await.unwrap();
	let pid = guard.pid().await.unwrap();

	guard.stop().await.unwrap();
	assert_eq!(guard.state(), GuardState::Stopped);

	let runs = guard.statistics().await;
	assert_eq!(runs.len(), 1);
	assert!(runs[0].finish.is_none());
	assert!(process_alive(pid));

	// Clean up the orphan ourselves.
	let _ = nix::sys::signal::kill(
		nix::unistd::Pid::from_raw(pid as i32),
		nix::sys::signal::Signal::SIGKILL,
	);
}

#[tokio::test]
async fn second_stop_is_noop() {
	let guard = Guard::new(sh("sleep 30")).unwrap();
	guard.run_guarded().await.unwrap();
	guard.stop().await.unwrap();
	guard.stop().await.unwrap();
	assert_eq!(guard.state(), GuardState::Stopped);
}

// --- Pipes ---

#[tokio::test]
async fn pipes_are_bound_to_one_generation() {
	let guard = Guard::new(sh("echo out-$$; echo err-$$ >&2; sleep 0.2")).unwrap();
	guard.run_guarded().await.unwrap();

	let stdout = guard.stdout_pipe().await.unwrap();
	let stderr = guard.stderr_pipe().await.unwrap();
	assert_eq!(stdout.generation(), 0);
	assert_eq!(stdout.stream(), StreamKind::Stdout);
	assert_eq!(stderr.stream(), StreamKind::Stderr);

	// The pipe ends with its own process, even though the guard restarts.
	let out = tokio::time::timeout(Duration::from_secs(5), stdout.read_to_end())
		.await
		.unwrap();
	let err = tokio::time::timeout(Duration::from_secs(5), stderr.read_to_end())
		.await
		.unwrap();
	assert!(String::from_utf8_lossy(&out).starts_with("out-"));
	assert!(String::from_utf8_lossy(&err).starts_with("err-"));

	wait_for_runs(&guard, 2).await;
	let next = guard.stdout_pipe().await.unwrap();
	assert!(next.generation() >= 1);
	assert!(guard.current_attempt().await.unwrap() >= next.generation());

	guard.stop().await.unwrap();
}

#[tokio::test]
async fn pipes_unavailable_without_capture() {
	let guard = Guard::new(GuardConfig {
		capture_output: false,
		..sh("sleep 30")
	})
	.unwrap();
	guard.run_guarded().await.unwrap();

	assert!(matches!(
		guard.stdout_pipe().await.err().unwrap(),
		GuardError::OutputNotCaptured
	));
	guard.stop().await.unwrap();
}

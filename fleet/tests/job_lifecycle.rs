//! Job orchestration against real detached processes.
//!
//! Jobs run a `stub` command provider (`sleep`, `true`, small `sh` scripts)
//! inside a scratch worktree of a temporary fleet home.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use fleet::core::types::{HealthState, JobState, ReasonCode};
use fleet::error::FleetError;
use fleet::io::config::FleetConfig;
use fleet::io::process::group_alive;
use fleet::io::provider::EnvCredentials;
use fleet::monitor::{WatchAction, watch_tick};
use fleet::orchestrator::{Orchestrator, StartRequest};
use fleet::test_support::{TEST_PROVIDER, TestRepo, command_config, wait_until};

fn orchestrator(repo: &TestRepo, config: FleetConfig) -> Orchestrator {
    Orchestrator::new(&repo.home(), config, Arc::new(EnvCredentials))
}

fn scratch_worktree(repo: &TestRepo, name: &str) -> PathBuf {
    let path = repo.scratch_root().join("app").join(name);
    fs::create_dir_all(&path).expect("create worktree");
    path
}

fn request(id: &str, worktree: PathBuf) -> StartRequest {
    StartRequest {
        id: id.to_string(),
        provider: TEST_PROVIDER.to_string(),
        prompt: "fix the flaky test".to_string(),
        worktree,
        model: None,
    }
}

fn wait_for_exit(orch: &Orchestrator, id: &str) {
    let exit_file = orch.store().paths(id).exit_code;
    assert!(
        wait_until(Duration::from_secs(10), || exit_file.exists()),
        "job {id} never exited"
    );
}

/// Verifies three restarts leave three numbered logs, each from its own attempt.
#[test]
fn restart_three_times_keeps_three_rotated_logs() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));
    let worktree = scratch_worktree(&repo, "j1");

    let first = orch.start(&request("J1", worktree)).expect("start");
    assert_eq!(first.state, JobState::Running);
    let mut pids = vec![first.pid.expect("pid")];

    for attempt in 1..=3 {
        let handle = orch.restart("J1").expect("restart");
        assert_eq!(handle.retry_count, attempt);
        pids.push(handle.pid.expect("pid"));
    }

    let paths = orch.store().paths("J1");
    assert_eq!(orch.store().rotated_log_count("J1"), 3);
    for n in 1..=3u32 {
        let rotated = fs::read_to_string(paths.rotated_log(n)).expect("rotated log");
        assert!(
            rotated.contains(&format!("attempt {n} model stub")),
            "log {n} should hold attempt {n}: {rotated}"
        );
    }
    let current = fs::read_to_string(&paths.log).expect("current log");
    assert!(current.contains("attempt 4 model stub"));

    let (last, earlier) = pids.split_last().expect("pids");
    assert!(group_alive(*last));
    assert!(earlier.iter().all(|pid| !group_alive(*pid)));

    let outcome = orch.stop("J1").expect("stop");
    assert_eq!(outcome.state, JobState::Aborted);
    assert_eq!(outcome.reason, Some(ReasonCode::Stopped));
    assert_eq!(outcome.retry_count, 3);
    assert!(!group_alive(*last));
}

/// Verifies concurrent restarts serialize so exactly one agent survives.
#[test]
fn concurrent_restarts_leave_one_live_process() {
    let repo = TestRepo::new().expect("repo");
    let mut config = command_config(&["sleep", "30"]);
    config.jobs.retry_ceiling = 10;
    let orch = orchestrator(&repo, config);
    let first = orch
        .start(&request("J2", scratch_worktree(&repo, "j2")))
        .expect("start");

    let mut pids = vec![first.pid.expect("pid")];
    let restarted: Vec<u32> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| orch.restart("J2").expect("restart").pid.expect("pid")))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect()
    });
    pids.extend(restarted);

    let record = orch.record("J2").expect("record");
    assert_eq!(record.retry_count, 4);
    let live: Vec<u32> = pids.iter().copied().filter(|pid| group_alive(*pid)).collect();
    assert_eq!(live, vec![record.pid.expect("pid")]);

    orch.stop("J2").expect("stop");
}

/// Verifies the restart past the ceiling fails the job with `retry_exhausted`.
#[test]
fn restart_at_the_ceiling_is_retry_exhausted() {
    let repo = TestRepo::new().expect("repo");
    let mut config = command_config(&["sleep", "30"]);
    config.jobs.retry_ceiling = 1;
    let orch = orchestrator(&repo, config);
    orch.start(&request("J3", scratch_worktree(&repo, "j3")))
        .expect("start");
    orch.restart("J3").expect("first restart");

    let err = orch.restart("J3").expect_err("ceiling");
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::RetryExhausted { retries: 1, ceiling: 1, .. })
    ));
    let outcome = orch
        .store()
        .load_outcome("J3")
        .expect("load")
        .expect("outcome");
    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.reason, Some(ReasonCode::RetryExhausted));
    let pid = orch.record("J3").expect("record").pid.expect("pid");
    assert!(!group_alive(pid));
}

/// Verifies an unavailable model fails preflight and leaves no job behind.
#[test]
fn unavailable_model_fails_preflight_without_artifacts() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));
    let mut req = request("J1", scratch_worktree(&repo, "j1"));
    req.model = Some("stub-pro".to_string());

    let err = orch.start(&req).expect_err("preflight");
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::Preflight {
            reason: ReasonCode::ModelUnavailable,
            ..
        })
    ));
    assert!(!orch.store().exists("J1"));
    assert!(!orch.store().paths("J1").dir.exists());
}

/// Verifies a missing agent binary is rejected before anything is written.
#[test]
fn missing_agent_binary_fails_preflight() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["fleet-test-no-such-agent"]));
    let err = orch
        .start(&request("J1", scratch_worktree(&repo, "j1")))
        .expect_err("preflight");
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::Preflight {
            reason: ReasonCode::StartFailed,
            ..
        })
    ));
    assert!(!orch.store().paths("J1").dir.exists());
}

/// Verifies worktrees outside the scratch root (e.g. canonical clones) are refused.
#[test]
fn worktree_outside_scratch_root_is_a_permission_error() {
    let repo = TestRepo::new().expect("repo");
    let canonical = repo.clone_canonical("app").expect("clone");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));

    let err = orch.start(&request("J1", canonical)).expect_err("permission");
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::Permission { .. })
    ));

    let sneaky = repo.scratch_root().join("..").join("..").join("canonical");
    let err = orch.start(&request("J1", sneaky)).expect_err("permission");
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::Permission { .. })
    ));
    assert!(!orch.store().exists("J1"));
}

/// Verifies `start` is idempotent for a live job and refuses a finished one.
#[test]
fn start_is_idempotent_per_id() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));
    let worktree = scratch_worktree(&repo, "j1");
    let first = orch.start(&request("J1", worktree.clone())).expect("start");
    let again = orch.start(&request("J1", worktree.clone())).expect("start again");
    assert_eq!(first.pid, again.pid);

    orch.stop("J1").expect("stop");
    let err = orch.start(&request("J1", worktree)).expect_err("terminal");
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::JobTerminal {
            state: JobState::Aborted,
            ..
        })
    ));
}

/// Verifies a clean exit is observed as succeeded and finalize is idempotent.
#[test]
fn successful_exit_finalizes_once() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["true"]));
    orch.start(&request("J1", scratch_worktree(&repo, "j1")))
        .expect("start");
    wait_for_exit(&orch, "J1");
    assert!(wait_until(Duration::from_secs(10), || {
        orch.check("J1").expect("check") == HealthState::Terminal(JobState::Succeeded)
    }));

    let first = orch.finalize("J1", None).expect("finalize");
    let second = orch
        .finalize("J1", Some(ReasonCode::ProcessLost))
        .expect("finalize again");
    assert_eq!(first, second);
    assert_eq!(first.state, JobState::Succeeded);
    assert_eq!(first.exit_code, Some(0));
    assert_eq!(first.reason, None);
}

/// Verifies a non-zero exit is dead, failed, and classified from the log tail.
#[test]
fn failed_exit_is_classified_from_the_log() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(
        &repo,
        command_config(&["sh", "-c", "echo 'Error: invalid API key' >&2; exit 1"]),
    );
    orch.start(&request("J1", scratch_worktree(&repo, "j1")))
        .expect("start");
    wait_for_exit(&orch, "J1");
    assert!(wait_until(Duration::from_secs(10), || {
        orch.check("J1").expect("check") == HealthState::Dead
    }));
    assert_eq!(
        orch.check("J1").expect("check"),
        HealthState::Terminal(JobState::Failed)
    );

    let outcome = orch
        .store()
        .load_outcome("J1")
        .expect("load")
        .expect("outcome");
    assert_eq!(outcome.exit_code, Some(1));
    assert_eq!(outcome.reason, Some(ReasonCode::AuthError));
}

/// Verifies the two-strikes rule: flat signals stall only on the third sample,
/// and a worktree change brings the job back to running.
#[test]
fn flat_signals_stall_and_mutations_recover() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));
    let worktree = scratch_worktree(&repo, "j1");
    orch.start(&request("J1", worktree.clone())).expect("start");

    assert_eq!(orch.check("J1").expect("check 1"), HealthState::Healthy);
    assert_eq!(orch.check("J1").expect("check 2"), HealthState::Healthy);
    let stalled = wait_until(Duration::from_secs(10), || {
        orch.check("J1").expect("check") == HealthState::Stalled
    });
    assert!(stalled, "idle job should stall");
    assert_eq!(orch.record("J1").expect("record").state, JobState::Stalled);

    thread::sleep(Duration::from_millis(20));
    fs::write(worktree.join("progress.txt"), "step 1").expect("write");
    assert_eq!(orch.check("J1").expect("recover"), HealthState::Healthy);
    let record = orch.record("J1").expect("record");
    assert_eq!(record.state, JobState::Running);
    assert_eq!(record.mutation_count, 1);
    assert_eq!(orch.store().read_mutations("J1").expect("mutations"), 1);

    orch.stop("J1").expect("stop");
}

/// Verifies `stop` on a terminal job is a no-op returning the same outcome.
#[test]
fn stop_twice_is_a_noop() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));
    orch.start(&request("J1", scratch_worktree(&repo, "j1")))
        .expect("start");
    let first = orch.stop("J1").expect("stop");
    let second = orch.stop("J1").expect("stop again");
    assert_eq!(first, second);
    let err = orch.restart("J1").expect_err("terminal restart");
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::JobTerminal { .. })
    ));
}

/// Verifies `finalize` recovers a job whose process vanished without an exit code.
#[test]
fn finalize_recovers_a_lost_process() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));
    let handle = orch
        .start(&request("J1", scratch_worktree(&repo, "j1")))
        .expect("start");
    let pid = handle.pid.expect("pid");
    nix::sys::signal::killpg(
        nix::unistd::Pid::from_raw(i32::try_from(pid).expect("pid")),
        nix::sys::signal::Signal::SIGKILL,
    )
    .expect("kill");
    assert!(wait_until(Duration::from_secs(5), || !group_alive(pid)));

    let outcome = orch.finalize("J1", None).expect("finalize");
    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.reason, Some(ReasonCode::ProcessLost));
    assert_eq!(outcome.exit_code, None);
}

/// Verifies prune removes old terminal jobs and never touches live ones.
#[test]
fn prune_skips_live_jobs() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));
    orch.start(&request("done", scratch_worktree(&repo, "a")))
        .expect("start");
    orch.stop("done").expect("stop");
    orch.start(&request("live", scratch_worktree(&repo, "b")))
        .expect("start");

    let kept = orch
        .prune(Duration::from_secs(3600), Utc::now())
        .expect("prune recent");
    assert!(kept.is_empty());

    let removed = orch
        .prune(
            Duration::from_secs(3600),
            Utc::now() + chrono::Duration::hours(2),
        )
        .expect("prune");
    assert_eq!(removed, vec!["done".to_string()]);
    assert!(!orch.store().exists("done"));
    assert!(orch.store().exists("live"));

    let summaries = orch.status(None).expect("status");
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].alive);
    orch.stop("live").expect("stop");
}

/// Verifies the watchdog waits out the backoff before restarting a stalled job.
#[test]
fn watchdog_restarts_after_backoff() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));
    orch.start(&request("J1", scratch_worktree(&repo, "j1")))
        .expect("start");
    assert!(wait_until(Duration::from_secs(10), || {
        orch.check("J1").expect("check") == HealthState::Stalled
    }));

    let ids = vec!["J1".to_string()];
    let now = Utc::now();
    let scheduled = watch_tick(&orch, &ids, now);
    let WatchAction::RetryScheduled { at } = scheduled[0].action.clone() else {
        panic!("expected a scheduled retry: {scheduled:?}");
    };
    assert_eq!(at, now + chrono::Duration::seconds(1));

    let waiting = watch_tick(&orch, &ids, now);
    assert_eq!(waiting[0].action, WatchAction::Waiting { until: at });

    let restarted = watch_tick(&orch, &ids, at + chrono::Duration::seconds(1));
    assert_eq!(restarted[0].action, WatchAction::Restarted { retry_count: 1 });
    let record = orch.record("J1").expect("record");
    assert_eq!(record.state, JobState::Running);
    assert_eq!(record.next_retry_at, None);

    orch.stop("J1").expect("stop");
}

/// Verifies an agent killed by its own `timeout` wrapper is reported as `wait_timeout`.
#[test]
fn timeout_exit_status_is_wait_timeout() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sh", "-c", "exit 124"]));
    orch.start(&request("J1", scratch_worktree(&repo, "j1")))
        .expect("start");
    wait_for_exit(&orch, "J1");
    let outcome = orch.finalize("J1", None).expect("finalize");
    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.exit_code, Some(124));
    assert_eq!(outcome.reason, Some(ReasonCode::WaitTimeout));
}

/// Verifies restarting a job whose agent already exited records its outcome
/// instead of running the agent again.
#[test]
fn restart_after_exit_finalizes_instead() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["true"]));
    orch.start(&request("J2", scratch_worktree(&repo, "j2")))
        .expect("start");
    wait_for_exit(&orch, "J2");

    let err = orch.restart("J2").expect_err("finished job");
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::JobTerminal {
            state: JobState::Succeeded,
            ..
        })
    ));
    let outcome = orch.store().load_outcome("J2").expect("load").expect("outcome");
    assert_eq!(outcome.state, JobState::Succeeded);
    assert_eq!(outcome.retry_count, 0);
    assert_eq!(orch.store().rotated_log_count("J2"), 0);
    assert_eq!(orch.record("J2").expect("record").retry_count, 0);
}

/// Verifies ids that would escape the jobs directory are rejected everywhere.
#[test]
fn path_like_ids_are_rejected() {
    let repo = TestRepo::new().expect("repo");
    let orch = orchestrator(&repo, command_config(&["sleep", "30"]));
    for id in ["../x", "a/b", ".hidden"] {
        assert!(orch.check(id).is_err(), "check {id}");
        assert!(orch.restart(id).is_err(), "restart {id}");
        assert!(orch.stop(id).is_err(), "stop {id}");
        assert!(orch.finalize(id, None).is_err(), "finalize {id}");
        assert!(orch.status(Some(id)).is_err(), "status {id}");
    }
    assert!(!repo.home().join("x").exists());
    assert!(!repo.home().join("jobs").join("x").exists());
}

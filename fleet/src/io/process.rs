//! Process helpers: bounded subprocess capture, detached agent launch,
//! liveness and CPU sampling, and process-group termination.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        use std::io::Write;
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
    }
    Ok(buf)
}

/// Everything needed to launch one agent attempt in the background.
#[derive(Debug, Clone)]
pub struct DetachedSpec {
    /// Agent executable plus arguments.
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    /// File fed to the agent's stdin.
    pub stdin_path: PathBuf,
    /// Log receiving stdout and stderr (appended).
    pub log_path: PathBuf,
    /// File the wrapper writes the agent's exit status to.
    pub exit_code_path: PathBuf,
    pub envs: Vec<(String, String)>,
}

/// Shell wrapper: run the agent, then record its exit status.
const EXIT_CAPTURE_SCRIPT: &str = r#""$@"; code=$?; echo "$code" > "$FLEET_EXIT_FILE"; exit "$code""#;

/// Launch `spec.argv` detached, in its own process group, and return the
/// wrapper's pid (which is also the process group id).
///
/// A background thread reaps the wrapper so it never lingers as a zombie
/// while this process is alive.
#[instrument(skip_all, fields(workdir = %spec.workdir.display()))]
pub fn spawn_detached(spec: &DetachedSpec) -> Result<u32> {
    let program = spec
        .argv
        .first()
        .ok_or_else(|| anyhow!("empty agent command"))?;
    let stdin = File::open(&spec.stdin_path)
        .with_context(|| format!("open {}", spec.stdin_path.display()))?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .with_context(|| format!("open {}", spec.log_path.display()))?;
    let log_err = log.try_clone().context("clone log handle")?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(EXIT_CAPTURE_SCRIPT)
        .arg("fleet-agent")
        .args(&spec.argv)
        .current_dir(&spec.workdir)
        .env("FLEET_EXIT_FILE", &spec.exit_code_path)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn agent {program}"))?;
    let pid = child.id();
    thread::spawn(move || {
        let _ = child.wait();
    });
    info!(pid, program = %program, "agent launched");
    Ok(pid)
}

/// Whether `pid` names a live (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }
    !matches!(read_proc_stat(pid), Some(stat) if stat.state == 'Z')
}

/// Whether any live process remains in process group `pgid`.
pub fn group_alive(pgid: u32) -> bool {
    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }
    match group_members(pgid) {
        Some(members) => members.iter().any(|stat| stat.state != 'Z'),
        None => true,
    }
}

/// Parsed fields from `/proc/<pid>/stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub pgrp: i64,
    /// utime + stime + cutime + cstime, in clock ticks.
    pub cpu_ticks: u64,
}

/// Parse one `/proc/<pid>/stat` line. The command name may contain spaces and
/// parentheses, so fields are read after the last `") "`.
pub fn parse_proc_stat(line: &str) -> Option<ProcStat> {
    let (_, rest) = line.rsplit_once(") ")?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let pgrp = fields.get(2)?.parse().ok()?;
    let mut cpu_ticks = 0u64;
    for idx in 11..=14 {
        let v: i64 = fields.get(idx)?.parse().ok()?;
        cpu_ticks = cpu_ticks.saturating_add(u64::try_from(v).unwrap_or(0));
    }
    Some(ProcStat {
        state,
        pgrp,
        cpu_ticks,
    })
}

fn read_proc_stat(pid: u32) -> Option<ProcStat> {
    let line = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_proc_stat(&line)
}

/// Every process in group `pgid`, or `None` where `/proc` is unavailable.
fn group_members(pgid: u32) -> Option<Vec<ProcStat>> {
    let entries = std::fs::read_dir("/proc").ok()?;
    let mut members = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if let Some(stat) = read_proc_stat(pid)
            && stat.pgrp == i64::from(pgid)
        {
            members.push(stat);
        }
    }
    Some(members)
}

/// Total CPU ticks consumed by process group `pgid` (children included).
///
/// `None` when `/proc` is unavailable, which drops this signal from the
/// health comparison instead of reporting it as flat.
pub fn group_cpu_ticks(pgid: u32) -> Option<u64> {
    if !Path::new("/proc/self/stat").exists() {
        return None;
    }
    let members = group_members(pgid)?;
    Some(members.iter().map(|s| s.cpu_ticks).sum())
}

/// SIGTERM the process group, wait up to `grace`, then SIGKILL.
///
/// Returns once no member of the group is alive. A group that is already gone
/// is not an error.
#[instrument(skip_all, fields(pgid))]
pub fn terminate_group(pgid: u32, grace: Duration) -> Result<()> {
    let raw = i32::try_from(pgid).with_context(|| format!("pid {pgid} out of range"))?;
    let group = Pid::from_raw(raw);
    if !group_alive(pgid) {
        debug!(pgid, "process group already gone");
        return Ok(());
    }
    send_group(group, Signal::SIGTERM)?;
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !group_alive(pgid) {
            info!(pgid, "process group terminated");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }
    warn!(pgid, "process group ignored SIGTERM, killing");
    send_group(group, Signal::SIGKILL)?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if !group_alive(pgid) {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(20));
    }
    Err(anyhow!("process group {pgid} survived SIGKILL"))
}

/// SIGTERM a single process (e.g. a job's monitor loop). Missing is fine.
pub fn terminate_pid(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid).with_context(|| format!("pid {pid} out of range"))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!("signal pid {pid}: {e}")),
    }
}

fn send_group(group: Pid, signal: Signal) -> Result<()> {
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!("signal process group {group}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_stat_with_spaces_in_name() {
        let line = "4242 (agent (x) y) S 1 4242 4242 0 -1 4194560 100 0 0 0 7 3 2 1 20 0 1 0";
        let stat = parse_proc_stat(line).expect("parse");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.cpu_ticks, 13);
    }

    #[test]
    fn rejects_truncated_stat() {
        assert!(parse_proc_stat("1 (init) S 0").is_none());
    }

    #[test]
    fn timeout_kills_slow_command() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let out = run_command_with_timeout(cmd, None, Duration::from_millis(200), 1024)
            .expect("run");
        assert!(out.timed_out);
    }

    /// Verifies the wrapper records the agent's exit status and the group can be terminated.
    #[test]
    fn detached_launch_captures_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stdin_path = temp.path().join("prompt.md");
        std::fs::write(&stdin_path, "hello\n").expect("prompt");
        let spec = DetachedSpec {
            argv: vec!["sh".into(), "-c".into(), "cat; exit 7".into()],
            workdir: temp.path().to_path_buf(),
            stdin_path,
            log_path: temp.path().join("job.log"),
            exit_code_path: temp.path().join("exit_code"),
            envs: Vec::new(),
        };
        let pid = spawn_detached(&spec).expect("spawn");
        let deadline = Instant::now() + Duration::from_secs(10);
        while !spec.exit_code_path.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let code = std::fs::read_to_string(&spec.exit_code_path).expect("exit code");
        assert_eq!(code.trim(), "7");
        let log = std::fs::read_to_string(&spec.log_path).expect("log");
        assert!(log.contains("hello"));
        terminate_group(pid, Duration::from_secs(1)).expect("terminate");
        assert!(!group_alive(pid));
    }

    #[test]
    fn terminate_group_kills_running_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stdin_path = temp.path().join("prompt.md");
        std::fs::write(&stdin_path, "").expect("prompt");
        let spec = DetachedSpec {
            argv: vec!["sleep".into(), "30".into()],
            workdir: temp.path().to_path_buf(),
            stdin_path,
            log_path: temp.path().join("job.log"),
            exit_code_path: temp.path().join("exit_code"),
            envs: Vec::new(),
        };
        let pid = spawn_detached(&spec).expect("spawn");
        assert!(is_alive(pid));
        terminate_group(pid, Duration::from_secs(2)).expect("terminate");
        assert!(!group_alive(pid));
    }
}

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub const TRUNCATION_MARKER: &str = "[TRUNCATED]";
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_CAPTURE_LIMIT: usize = 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct SupervisedCommand {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub grace: Duration,
    pub capture_limit: usize,
}

impl SupervisedCommand {
    pub fn new(binary: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            timeout: Duration::from_secs(300),
            grace: DEFAULT_GRACE,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }
}

#[derive(Debug)]
pub struct SupervisedExit {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub canceled: bool,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum SpawnOutcome {
    Exited(SupervisedExit),
    MissingBinary,
}

/// Launch a subprocess without a shell and supervise it: two reader tasks
/// drain stdout/stderr line-wise (capped with a truncation marker) while
/// the caller's thread races process exit against the timeout and the
/// cancellation flag. Overrun or cancellation triggers the two-stage stop:
/// soft terminate, wait out the grace window, hard kill.
pub fn run_supervised(
    cmd: &SupervisedCommand,
    cancel: &AtomicBool,
    stdout_line_hook: Option<&mut (dyn FnMut(&str) + Send)>,
) -> std::io::Result<SpawnOutcome> {
    let mut command = Command::new(&cmd.binary);
    command
        .args(&cmd.args)
        .current_dir(&cmd.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &cmd.env {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SpawnOutcome::MissingBinary)
        }
        Err(err) => return Err(err),
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("missing stdout pipe"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("missing stderr pipe"))?;

    let start = Instant::now();
    let capture_limit = cmd.capture_limit;

    let (status, timed_out, canceled, stdout_buf, stderr_buf) = thread::scope(|scope| {
        let stdout_reader =
            scope.spawn(move || capture_stream(stdout, capture_limit, stdout_line_hook));
        let stderr_reader = scope.spawn(move || capture_stream(stderr, capture_limit, None));

        let mut timed_out = false;
        let mut canceled = false;
        let status: Option<ExitStatus> = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if cancel.load(Ordering::Relaxed) {
                        canceled = true;
                    } else if start.elapsed() > cmd.timeout {
                        timed_out = true;
                    }
                    if canceled || timed_out {
                        break terminate_two_stage(&mut child, cmd.grace);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(_) => break None,
            }
        };

        let stdout_buf = stdout_reader.join().unwrap_or_default();
        let stderr_buf = stderr_reader.join().unwrap_or_default();
        (status, timed_out, canceled, stdout_buf, stderr_buf)
    });

    Ok(SpawnOutcome::Exited(SupervisedExit {
        exit_code: status.and_then(|s| s.code()),
        timed_out,
        canceled,
        duration: start.elapsed(),
        stdout: stdout_buf,
        stderr: stderr_buf,
    }))
}

fn capture_stream<R: Read>(
    stream: R,
    limit: usize,
    mut line_hook: Option<&mut (dyn FnMut(&str) + Send)>,
) -> String {
    let mut reader = BufReader::new(stream);
    let mut captured = String::new();
    let mut truncated = false;
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw);
                if let Some(hook) = line_hook.as_mut() {
                    hook(&line);
                }
                if truncated {
                    continue;
                }
                if captured.len() + line.len() > limit {
                    truncated = true;
                    if !captured.is_empty() && !captured.ends_with('\n') {
                        captured.push('\n');
                    }
                    captured.push_str(TRUNCATION_MARKER);
                    captured.push('\n');
                } else {
                    captured.push_str(&line);
                }
            }
            Err(_) => break,
        }
    }
    captured
}

/// Soft-terminate, wait out the grace window, then hard-kill. Always reaps
/// the child before returning.
fn terminate_two_stage(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    send_soft_terminate(child.id());
    let start = Instant::now();
    while start.elapsed() < grace {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    child.wait().ok()
}

#[cfg(unix)]
fn send_soft_terminate(pid: u32) {
    let _ = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn send_soft_terminate(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(path: &Path, body: &str) {
        fs::write(path, body).expect("write script");
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }

    #[test]
    fn captures_both_streams() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("talk.sh");
        write_script(&bin, "#!/bin/sh\necho out-line\necho err-line 1>&2\n");

        let cmd = SupervisedCommand::new(bin.display().to_string(), dir.path());
        let cancel = AtomicBool::new(false);
        let outcome = run_supervised(&cmd, &cancel, None).expect("run");
        match outcome {
            SpawnOutcome::Exited(exit) => {
                assert_eq!(exit.exit_code, Some(0));
                assert!(exit.stdout.contains("out-line"));
                assert!(exit.stderr.contains("err-line"));
                assert!(!exit.timed_out);
            }
            SpawnOutcome::MissingBinary => panic!("binary exists"),
        }
    }

    #[test]
    fn timeout_terminates_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("sleepy.sh");
        write_script(&bin, "#!/bin/sh\nexec sleep 30\n");

        let mut cmd = SupervisedCommand::new(bin.display().to_string(), dir.path());
        cmd.timeout = Duration::from_millis(200);
        cmd.grace = Duration::from_millis(200);
        let cancel = AtomicBool::new(false);
        let started = Instant::now();
        let outcome = run_supervised(&cmd, &cancel, None).expect("run");
        match outcome {
            SpawnOutcome::Exited(exit) => {
                assert!(exit.timed_out);
                assert_ne!(exit.exit_code, Some(0));
                assert!(started.elapsed() < Duration::from_secs(10));
            }
            SpawnOutcome::MissingBinary => panic!("binary exists"),
        }
    }

    #[test]
    fn missing_binary_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = SupervisedCommand::new("definitely-not-on-path-9f2", dir.path());
        let cancel = AtomicBool::new(false);
        let outcome = run_supervised(&cmd, &cancel, None).expect("run");
        assert!(matches!(outcome, SpawnOutcome::MissingBinary));
    }

    #[test]
    fn oversized_output_is_truncated_with_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("noisy.sh");
        write_script(
            &bin,
            "#!/bin/sh\ni=0\nwhile [ $i -lt 200 ]; do echo 'a long repeated output line'; i=$((i+1)); done\n",
        );

        let mut cmd = SupervisedCommand::new(bin.display().to_string(), dir.path());
        cmd.capture_limit = 256;
        let cancel = AtomicBool::new(false);
        let outcome = run_supervised(&cmd, &cancel, None).expect("run");
        match outcome {
            SpawnOutcome::Exited(exit) => {
                assert!(exit.stdout.contains(TRUNCATION_MARKER));
                assert!(exit.stdout.len() < 512);
            }
            SpawnOutcome::MissingBinary => panic!("binary exists"),
        }
    }

    #[test]
    fn cancellation_stops_a_running_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("sleepy.sh");
        write_script(&bin, "#!/bin/sh\nexec sleep 30\n");

        let mut cmd = SupervisedCommand::new(bin.display().to_string(), dir.path());
        cmd.timeout = Duration::from_secs(60);
        cmd.grace = Duration::from_millis(200);
        let cancel = AtomicBool::new(true);
        let outcome = run_supervised(&cmd, &cancel, None).expect("run");
        match outcome {
            SpawnOutcome::Exited(exit) => {
                assert!(exit.canceled);
                assert!(!exit.timed_out);
            }
            SpawnOutcome::MissingBinary => panic!("binary exists"),
        }
    }
}

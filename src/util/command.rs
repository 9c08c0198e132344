//! Running external binaries with a hard timeout.

use std::env;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Error type for subprocess invocation.
#[derive(Debug)]
pub enum CommandError {
    /// The binary could not be started.
    Spawn(io::Error),
    /// The process did not exit within the timeout and was killed, or its
    /// output pipes stayed open past the timeout.
    Timeout(Duration),
    /// The process exited unsuccessfully.
    Failed { status: ExitStatus, stderr: String },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Spawn(e) => write!(f, "failed to start: {}", e),
            CommandError::Timeout(t) => write!(f, "timed out after {:?}", t),
            CommandError::Failed { status, stderr } => {
                write!(f, "exited with {}: {}", status, stderr.trim())
            }
        }
    }
}

impl std::error::Error for CommandError {}

/// Captured output of a successful run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
}

/// Runs `program` with `args`, killing it if it outlives `timeout`.
///
/// Succeeds only when the process exits with status 0 in time.
pub fn run_with_timeout(
    program: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(CommandError::Spawn)?;

    // Drain both pipes while waiting; a full pipe would stall the child.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CommandError::Timeout(timeout));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                return Err(CommandError::Spawn(e));
            }
        }
    };

    // A leftover grandchild can hold the pipes open after the child exits.
    let deadline = start + timeout;
    if !status.success() {
        let stderr = collect(stderr, deadline).unwrap_or_default();
        return Err(CommandError::Failed { status, stderr });
    }
    match collect(stdout, deadline) {
        Some(stdout) => Ok(CommandOutput { stdout }),
        None => Err(CommandError::Timeout(timeout)),
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// Waits for a drained pipe until `deadline`. `None` if it is still open.
fn collect(pipe: Option<Receiver<String>>, deadline: Instant) -> Option<String> {
    let Some(pipe) = pipe else {
        return Some(String::new());
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    pipe.recv_timeout(remaining.max(POLL_INTERVAL)).ok()
}

/// Searches `PATH` for an executable file named `name`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout() {
        let out = run_with_timeout(Path::new("/bin/sh"), &["-c", "echo hello"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let err = run_with_timeout(
            Path::new("/bin/sh"),
            &["-c", "echo oops >&2; exit 3"],
            Duration::from_secs(5),
        )
        .unwrap_err();
        match err {
            CommandError::Failed { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_timeout_kills_process() {
        let start = Instant::now();
        let err = run_with_timeout(Path::new("/bin/sh"), &["-c", "sleep 5"], Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_inherited_stdout_does_not_block() {
        let start = Instant::now();
        let err = run_with_timeout(
            Path::new("/bin/sh"),
            &["-c", "sleep 5 & echo started"],
            Duration::from_millis(500),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_missing_binary() {
        let err = run_with_timeout(
            Path::new("/nonexistent/binary/12345"),
            &[],
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::Spawn(_)));
    }

    #[test]
    fn test_find_in_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-binary-12345").is_none());
    }
}

//! Background process lifecycle: PID file, daemonization, uptime and stop.
//!
//! # States
//!
//! ```text
//!  NOT_RUNNING ──daemonize()/write_pid()──► RUNNING
//!       ▲                                      │
//!       │            stop(): SIGTERM           │
//!       │   poll every 100ms for up to 3s      ▼
//!       └──── cleanup ◄── SIGKILL if still ── STOPPING
//!                          alive
//! ```
//!
//! A PID file whose process is gone, or whose content is not a PID, is
//! removed as soon as it is read.

pub mod procfs;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::util::format_uptime;

/// Interval between liveness checks after SIGTERM.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Number of checks before escalating to SIGKILL (3 seconds).
const STOP_POLLS: u32 = 30;

/// Error type for lifecycle operations.
#[derive(Debug)]
pub enum DaemonError {
    /// The caller lacks rights to a file or to signal a process.
    PermissionDenied(String),
    Io(io::Error),
    /// `fork` or `setsid` failed while detaching.
    Fork(io::Error),
    /// `/proc` content could not be parsed.
    ProcFs(String),
    /// Another instance already holds the PID file.
    AlreadyRunning(u32),
    /// The platform has no `fork`.
    Unsupported,
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::PermissionDenied(what) => write!(f, "permission denied: {}", what),
            DaemonError::Io(e) => write!(f, "I/O error: {}", e),
            DaemonError::Fork(e) => write!(f, "fork failed: {}", e),
            DaemonError::ProcFs(msg) => write!(f, "procfs: {}", msg),
            DaemonError::AlreadyRunning(pid) => write!(f, "already running (PID: {})", pid),
            DaemonError::Unsupported => write!(f, "daemon mode is not supported on this platform"),
        }
    }
}

impl std::error::Error for DaemonError {}

impl From<io::Error> for DaemonError {
    fn from(e: io::Error) -> Self {
        DaemonError::Io(e)
    }
}

impl DaemonError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, DaemonError::PermissionDenied(_))
    }

    fn from_io(path: &Path, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::PermissionDenied {
            DaemonError::PermissionDenied(path.display().to_string())
        } else {
            DaemonError::Io(e)
        }
    }
}

/// Tracks one agent instance through its PID file.
pub struct DaemonManager {
    pid_file: PathBuf,
    proc_path: PathBuf,
    /// Cached start time of the tracked process.
    start_time: Option<DateTime<Utc>>,
}

impl DaemonManager {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
            proc_path: PathBuf::from("/proc"),
            start_time: None,
        }
    }

    /// Reads process information from `proc_path` instead of `/proc`.
    pub fn with_proc_path(mut self, proc_path: impl Into<PathBuf>) -> Self {
        self.proc_path = proc_path.into();
        self
    }

    /// PID of the running instance, if any.
    ///
    /// Stale or unparsable PID files are removed. Read failures other than a
    /// missing file are logged and treated as not running; use
    /// [`DaemonManager::read_pid`] to see them.
    pub fn get_pid(&self) -> Option<u32> {
        match self.read_pid() {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Cannot read PID file {}: {}", self.pid_file.display(), e);
                None
            }
        }
    }

    /// Like [`DaemonManager::get_pid`], but reports an unreadable PID file as
    /// an error.
    pub fn read_pid(&self) -> Result<Option<u32>, DaemonError> {
        let bytes = match fs::read(&self.pid_file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DaemonError::from_io(&self.pid_file, e)),
        };

        let parsed = String::from_utf8(bytes)
            .ok()
            .and_then(|content| content.trim().parse::<i32>().ok())
            .filter(|pid| *pid > 0);
        let Some(pid) = parsed else {
            debug!("Invalid PID file content in {}", self.pid_file.display());
            self.cleanup_pid_file();
            return Ok(None);
        };
        let pid = pid as u32;

        if self.process_exists(pid) {
            Ok(Some(pid))
        } else {
            debug!("Removing stale PID file for pid {}", pid);
            self.cleanup_pid_file();
            Ok(None)
        }
    }

    pub fn is_running(&self) -> bool {
        self.get_pid().is_some()
    }

    /// Atomically records the current process ID.
    ///
    /// Writes to a temporary file next to the target, then renames it.
    pub fn write_pid(&mut self) -> Result<(), DaemonError> {
        let mut tmp = self.pid_tempfile()?;
        writeln!(tmp, "{}", std::process::id())?;
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file().set_permissions(fs::Permissions::from_mode(0o644))?;
        }

        tmp.persist(&self.pid_file)
            .map_err(|e| DaemonError::from_io(&self.pid_file, e.error))?;
        self.start_time = Some(Utc::now());
        Ok(())
    }

    /// Checks that the PID file can be written, without writing it.
    pub fn check_writable(&self) -> Result<(), DaemonError> {
        self.pid_tempfile().map(drop)
    }

    fn pid_tempfile(&self) -> Result<tempfile::NamedTempFile, DaemonError> {
        let dir = match self.pid_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| DaemonError::from_io(&dir, e))?;

        tempfile::Builder::new()
            .prefix(".pid_")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| DaemonError::from_io(&dir, e))
    }

    /// Removes the PID file. A missing file is not an error.
    pub fn cleanup_pid_file(&self) {
        match fs::remove_file(&self.pid_file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!("Permission denied removing PID file: {}", self.pid_file.display());
            }
            Err(e) => warn!("Cannot remove PID file {}: {}", self.pid_file.display(), e),
        }
    }

    /// Uptime of the running instance, e.g. `1h 2m 3s`.
    ///
    /// `None` when not running, `"unknown"` when the start time cannot be
    /// determined.
    pub fn get_uptime(&mut self) -> Option<String> {
        let pid = self.get_pid()?;

        if self.start_time.is_none() {
            match procfs::process_start_time(&self.proc_path, pid) {
                Ok(start) => self.start_time = Some(start),
                Err(e) => debug!("Could not get process start time: {}", e),
            }
        }

        let Some(start) = self.start_time else {
            return Some("unknown".to_string());
        };
        let elapsed = (Utc::now() - start).num_seconds().max(0);
        Some(format_uptime(elapsed))
    }

    /// Stops the running instance with SIGTERM, escalating to SIGKILL.
    ///
    /// Not running and "already gone" both count as success. Only a
    /// permission failure is reported as an error.
    #[cfg(unix)]
    pub fn stop(&mut self) -> Result<(), DaemonError> {
        let Some(pid) = self.read_pid()? else {
            return Ok(());
        };

        info!("Sending SIGTERM to pid {}", pid);
        if !send_signal(pid, libc::SIGTERM)? {
            self.cleanup_pid_file();
            return Ok(());
        }

        for _ in 0..STOP_POLLS {
            std::thread::sleep(STOP_POLL_INTERVAL);
            if !self.process_exists(pid) {
                self.cleanup_pid_file();
                return Ok(());
            }
        }

        warn!("Process {} did not exit after SIGTERM, sending SIGKILL", pid);
        send_signal(pid, libc::SIGKILL)?;
        std::thread::sleep(STOP_POLL_INTERVAL);
        self.cleanup_pid_file();
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn stop(&mut self) -> Result<(), DaemonError> {
        match self.read_pid()? {
            None => Ok(()),
            Some(_) => Err(DaemonError::Unsupported),
        }
    }

    /// Detaches from the terminal with a double fork and writes the PID file.
    ///
    /// The calling process and the intermediate child exit with status 0.
    /// Must run before any threads are spawned.
    #[cfg(unix)]
    pub fn daemonize(&mut self) -> Result<(), DaemonError> {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        fork_and_exit_parent()?;

        std::env::set_current_dir("/")?;
        // SAFETY: setsid and umask take no pointers and cannot violate memory safety.
        if unsafe { libc::setsid() } < 0 {
            return Err(DaemonError::Fork(io::Error::last_os_error()));
        }
        unsafe { libc::umask(0) };

        fork_and_exit_parent()?;
        redirect_stdio()?;
        self.write_pid()
    }

    #[cfg(not(unix))]
    pub fn daemonize(&mut self) -> Result<(), DaemonError> {
        Err(DaemonError::Unsupported)
    }

    fn process_exists(&self, pid: u32) -> bool {
        if self.proc_path.is_dir() {
            procfs::process_alive(&self.proc_path, pid)
        } else {
            signal_probe(pid)
        }
    }
}

#[cfg(unix)]
fn fork_and_exit_parent() -> Result<(), DaemonError> {
    // SAFETY: the caller guarantees no other threads exist, so the child
    // starts from a consistent copy of the process.
    match unsafe { libc::fork() } {
        -1 => Err(DaemonError::Fork(io::Error::last_os_error())),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}

#[cfg(unix)]
fn redirect_stdio() -> Result<(), DaemonError> {
    use std::os::unix::io::AsRawFd;

    let devnull = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(devnull.as_raw_fd(), target) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Sends `signal` to `pid`. Returns `false` if the process no longer exists.
#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> Result<bool, DaemonError> {
    // SAFETY: kill takes plain integers; pid is positive so no process group is targeted.
    if unsafe { libc::kill(pid as libc::pid_t, signal) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        Some(libc::EPERM) => Err(DaemonError::PermissionDenied(format!("signal pid {}", pid))),
        _ => Err(DaemonError::Io(err)),
    }
}

/// Existence check for systems without a `/proc` tree.
#[cfg(unix)]
fn signal_probe(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the permission and existence check.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn signal_probe(_pid: u32) -> bool {
    false
}

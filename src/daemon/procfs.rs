//! Reading process start times from `/proc`.
//!
//! Parsing is split from file access so it can be tested on strings.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};

use super::DaemonError;

/// Used when `sysconf` cannot report the tick rate.
const DEFAULT_CLK_TCK: u64 = 100;

/// Index of `starttime` among the fields after the `comm` field.
const STARTTIME_FIELD: usize = 19;

/// Parses the `btime` line of `/proc/stat`.
pub fn parse_boot_time(content: &str) -> Result<i64, DaemonError> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .ok_or_else(|| DaemonError::ProcFs("no btime in stat".to_string()))?
        .trim()
        .parse()
        .map_err(|_| DaemonError::ProcFs("invalid btime".to_string()))
}

/// Fields following the `(comm)` field of `/proc/[pid]/stat`.
///
/// `comm` may contain spaces and parentheses, so the split happens after
/// the last `)`.
fn fields_after_comm(content: &str) -> Result<Vec<&str>, DaemonError> {
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| DaemonError::ProcFs("missing ')' in stat".to_string()))?;
    Ok(content[close_paren + 1..].split_whitespace().collect())
}

/// Parses `starttime` (clock ticks since boot) from `/proc/[pid]/stat`.
pub fn parse_start_ticks(content: &str) -> Result<u64, DaemonError> {
    let fields = fields_after_comm(content)?;
    fields
        .get(STARTTIME_FIELD)
        .ok_or_else(|| {
            DaemonError::ProcFs(format!(
                "not enough fields in stat: expected {}+, got {}",
                STARTTIME_FIELD + 1,
                fields.len()
            ))
        })?
        .parse()
        .map_err(|_| DaemonError::ProcFs("invalid starttime".to_string()))
}

/// Parses the one-letter state from `/proc/[pid]/stat`.
pub fn parse_state(content: &str) -> Option<char> {
    fields_after_comm(content).ok()?.first()?.chars().next()
}

/// Kernel clock ticks per second.
pub fn clock_ticks() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions and only reads a constant.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as u64;
        }
    }
    DEFAULT_CLK_TCK
}

/// Wall-clock start time of `pid`: boot time plus its start offset.
pub fn process_start_time(proc_path: &Path, pid: u32) -> Result<DateTime<Utc>, DaemonError> {
    let boot_time = parse_boot_time(&fs::read_to_string(proc_path.join("stat"))?)?;
    let stat = fs::read_to_string(proc_path.join(pid.to_string()).join("stat"))?;
    let ticks = parse_start_ticks(&stat)?;

    let millis = boot_time * 1000 + (ticks * 1000 / clock_ticks()) as i64;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| DaemonError::ProcFs(format!("start time out of range: {}", millis)))
}

/// Returns `true` while `pid` has a process-table entry that has not exited.
///
/// Zombies count as exited.
pub fn process_alive(proc_path: &Path, pid: u32) -> bool {
    match fs::read_to_string(proc_path.join(pid.to_string()).join("stat")) {
        Ok(stat) => !matches!(parse_state(&stat), Some('Z') | Some('X')),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STAT: &str = "cpu  100 0 50 1000 0 0 0 0 0 0\nctxt 12345\nbtime 1700000000\nprocesses 4242\n";
    const PID_STAT: &str = "4242 (collector (agent)) S 1 4242 4242 0 -1 4194560 500 0 0 0 10 5 0 0 20 0 1 0 360000 10000000 500 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0\n";

    #[test]
    fn test_parse_boot_time() {
        assert_eq!(parse_boot_time(STAT).unwrap(), 1_700_000_000);
        assert!(parse_boot_time("cpu 1 2 3\n").is_err());
        assert!(parse_boot_time("btime soon\n").is_err());
    }

    #[test]
    fn test_parse_start_ticks_with_parens_in_comm() {
        assert_eq!(parse_start_ticks(PID_STAT).unwrap(), 360_000);
        assert_eq!(parse_state(PID_STAT), Some('S'));
    }

    #[test]
    fn test_parse_start_ticks_short_line() {
        assert!(parse_start_ticks("1 (init) S 0 1").is_err());
        assert!(parse_start_ticks("no parens here").is_err());
    }

    #[test]
    fn test_process_start_time_from_fake_proc() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("stat"), STAT).unwrap();
        fs::create_dir(dir.path().join("4242")).unwrap();
        fs::write(dir.path().join("4242").join("stat"), PID_STAT).unwrap();

        let start = process_start_time(dir.path(), 4242).unwrap();
        let expected = 1_700_000_000 + (360_000 / clock_ticks()) as i64;
        assert_eq!(start.timestamp(), expected);
    }

    #[test]
    fn test_process_alive() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("10")).unwrap();
        fs::write(dir.path().join("10").join("stat"), PID_STAT).unwrap();
        fs::create_dir(dir.path().join("11")).unwrap();
        fs::write(
            dir.path().join("11").join("stat"),
            PID_STAT.replacen(") S ", ") Z ", 1),
        )
        .unwrap();

        assert!(process_alive(dir.path(), 10));
        assert!(!process_alive(dir.path(), 11));
        assert!(!process_alive(dir.path(), 12));
    }
}

//! Log sink setup for the agent binary.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing::{Level, warn};
use tracing_subscriber::EnvFilter;

/// Maps a configured level name onto a tracing level.
///
/// `WARNING` and `CRITICAL` are accepted as aliases of `WARN` and `ERROR`.
/// Unknown names map to `INFO`.
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" | "CRITICAL" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    let filter = EnvFilter::from_default_env();
    match format!("collector_agent={}", level).parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Installs the global subscriber.
///
/// Output goes to `file` when it can be opened for append, otherwise to
/// stderr. Must be called at most once per process, after daemonizing.
pub fn init(level: &str, file: Option<&Path>) {
    let level = parse_level(level);
    let filter = build_filter(level);

    let mut fallback_reason = None;
    if let Some(path) = file {
        match open_log_file(path) {
            Ok(log_file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(Mutex::new(log_file))
                    .with_ansi(false)
                    .with_target(false)
                    .init();
                return;
            }
            Err(e) => fallback_reason = Some((path.to_path_buf(), e)),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Some((path, e)) = fallback_reason {
        warn!("Cannot open log file {}: {}. Logging to stderr.", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("info"), Level::INFO);
        assert_eq!(parse_level("WARNING"), Level::WARN);
        assert_eq!(parse_level("CRITICAL"), Level::ERROR);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_open_log_file_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("agent.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_filter_mentions_crate() {
        let filter = build_filter(Level::DEBUG);
        assert!(filter.to_string().contains("collector_agent=debug"));
    }
}

//! collector-agent - host metrics agent.
//!
//! Periodically collects CPU, memory, disk and GPU metrics and sends them to
//! a remote endpoint. Runs in the foreground or as a daemon.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing::warn;

use collector_agent::collector::MetricsCollector;
use collector_agent::config::{Config, ConfigError, DEFAULT_CONFIG_PATH, set_config_value};
use collector_agent::daemon::{DaemonError, DaemonManager};
use collector_agent::logging;
use collector_agent::shutdown::ShutdownToken;

const PERMISSION_HINT: &str = "Permission denied. Try running with sudo.";

/// Host metrics collector agent.
#[derive(Parser)]
#[command(name = "collector-agent", about = "Host metrics collector agent", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true, default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start collecting.
    Start {
        /// Detach and run in the background.
        #[arg(short, long)]
        daemon: bool,
    },
    /// Stop the background instance.
    Stop,
    /// Show whether an instance is running and which sources are reachable.
    Status,
    /// Collect once and print the snapshot as JSON.
    Metrics {
        /// Print only one part of the snapshot.
        #[arg(value_parser = ["cpu", "memory", "disks", "gpu"])]
        category: Option<String>,
    },
    /// Check the endpoint and send one snapshot.
    Test {
        /// Print the snapshot instead of sending it.
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Show version information.
    Version,
    /// Inspect or change the configuration file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Set one key, e.g. `interval 60` or `exporters.nvidia_smi.enabled false`.
    Set { key: String, value: String },
    /// Overwrite the configuration file with defaults.
    Reset,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { daemon } => start(&cli.config_path, daemon),
        Commands::Stop => stop(&cli.config_path),
        Commands::Status => status(&cli.config_path),
        Commands::Metrics { category } => metrics(&cli.config_path, category.as_deref()),
        Commands::Test { dry_run } => test(&cli.config_path, dry_run),
        Commands::Version => println!("collector-agent v{}", collector_agent::VERSION),
        Commands::Config(command) => config(&cli.config_path, command),
    }
}

/// Loads the config and sets up stderr logging for short-lived commands.
fn load_for_command(path: &Path) -> Config {
    logging::init("WARNING", None);
    Config::load(path)
}

fn start(path: &Path, daemon: bool) {
    let config = Config::load(path);
    let token = ShutdownToken::new();

    if !daemon {
        logging::init(&config.logging.level, None);
        if let Err(e) = token.install_signal_handler() {
            warn!("Failed to set signal handler: {}", e);
        }
        println!("Starting collector (interval: {}s)", config.interval);
        println!("Endpoint: {}", config.endpoint);
        println!("Press Ctrl+C to stop");
        MetricsCollector::from_config(config).run_foreground(&token);
        return;
    }

    let level = config.logging.level.clone();
    let log_file = config.logging.file.clone();
    println!("Starting collector as daemon...");

    let mut collector = MetricsCollector::from_config(config);
    let result = collector.run_daemon(&token, || {
        logging::init(&level, Some(&log_file));
        if let Err(e) = token.install_signal_handler() {
            warn!("Failed to set signal handler: {}", e);
        }
    });

    match result {
        Ok(()) => {}
        Err(DaemonError::AlreadyRunning(pid)) => {
            eprintln!("Collector is already running (PID: {})", pid);
            process::exit(1);
        }
        Err(e) if e.is_permission_denied() => {
            eprintln!("{}", PERMISSION_HINT);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to start daemon: {}", e);
            process::exit(1);
        }
    }
}

fn stop(path: &Path) {
    let config = load_for_command(path);
    let mut daemon = DaemonManager::new(&config.daemon.pid_file);

    let Some(pid) = read_pid_or_exit(&daemon) else {
        println!("Collector is not running");
        return;
    };

    println!("Stopping collector (PID: {})...", pid);
    match daemon.stop() {
        Ok(()) => println!("Collector stopped"),
        Err(e) if e.is_permission_denied() => {
            eprintln!("Failed to stop collector. {}", PERMISSION_HINT);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to stop collector: {}", e);
            process::exit(1);
        }
    }
}

fn status(path: &Path) {
    let config = load_for_command(path);
    let nvidia_enabled = config.exporters.nvidia_smi.enabled;
    let node_enabled = config.exporters.node_exporter.enabled;
    let mut collector = MetricsCollector::from_config(config);

    let daemon = collector.daemon_manager();
    match read_pid_or_exit(daemon) {
        Some(pid) => {
            println!("Status:        running (PID: {})", pid);
            let uptime = daemon.get_uptime().unwrap_or_else(|| "unknown".to_string());
            println!("Uptime:        {}", uptime);
        }
        None => println!("Status:        stopped"),
    }

    println!("Endpoint:      {}", collector.config().endpoint);
    println!("Interval:      {}s", collector.config().interval);

    let (node_ok, gpu_ok) = collector.check_exporters();
    let describe = |enabled: bool, ok: bool| match (enabled, ok) {
        (false, _) => "disabled",
        (true, true) => "available",
        (true, false) => "unavailable",
    };
    println!("Node exporter: {}", describe(node_enabled, node_ok));
    println!("nvidia-smi:    {}", describe(nvidia_enabled, gpu_ok));
}

/// Reads the PID file; an unreadable file ends the command with an error.
fn read_pid_or_exit(daemon: &DaemonManager) -> Option<u32> {
    match daemon.read_pid() {
        Ok(pid) => pid,
        Err(e) if e.is_permission_denied() => {
            eprintln!("Cannot read PID file. {}", PERMISSION_HINT);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot read PID file: {}", e);
            process::exit(1);
        }
    }
}

fn metrics(path: &Path, category: Option<&str>) {
    let config = load_for_command(path);
    let mut collector = MetricsCollector::from_config(config);
    let snapshot = collector.collect_once().to_json();

    let output = match category {
        Some(key) => snapshot.get(key).cloned().unwrap_or(serde_json::Value::Null),
        None => snapshot,
    };
    print_json(&output);
}

fn test(path: &Path, dry_run: bool) {
    let config = load_for_command(path);
    let endpoint = config.endpoint.clone();
    let mut collector = MetricsCollector::from_config(config);

    if dry_run {
        println!("Collected metrics (dry-run mode):");
        print_json(&collector.collect_once().to_json());
        return;
    }

    println!("Testing connection to {}...", endpoint);
    let status = collector.test_connection();
    if !status.is_ok() {
        eprintln!("{}", status);
        process::exit(1);
    }
    println!("{}", status);

    println!("Sending metrics...");
    if collector.collect_and_send() {
        println!("Metrics sent successfully!");
    } else {
        eprintln!("Failed to send metrics");
        process::exit(1);
    }
}

fn config(path: &Path, command: ConfigCommand) {
    logging::init("WARNING", None);

    let result = match command {
        ConfigCommand::Show => Config::load(path).to_toml().map(|toml| print!("{}", toml)),
        ConfigCommand::Set { key, value } => {
            set_config_value(&key, &value, path).map(|_| println!("{} = {}", key, value))
        }
        ConfigCommand::Reset => Config::default()
            .save(path)
            .map(|()| println!("Configuration reset to defaults")),
    };

    match result {
        Ok(()) => {}
        Err(ConfigError::PermissionDenied(_)) => {
            eprintln!("{}", PERMISSION_HINT);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to render metrics: {}", e);
            process::exit(1);
        }
    }
}

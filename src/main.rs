mod config;
mod frame;
mod session;
mod signals;
mod ticker;

use clap::Parser;
use config::{ConfigError, FeedConfig, DEFAULT_CONFIG_FILE};
use session::EventSink;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Supervise a child process and feed it a fixed-layout frame over stdin
/// every 250 ms until it exits.
#[derive(Parser, Debug)]
#[command(name = "childfeed", version, about)]
pub struct Cli {
    /// Executable to spawn (overrides [child].command from the config)
    #[arg(long, value_name = "PATH")]
    process: Option<String>,

    /// Config file path [default: childfeed.toml, may be absent]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Resolve the command and print the frame layout, don't spawn
    #[arg(long)]
    dry_run: bool,

    /// Log every frame written
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

/// Exit status for configuration errors.
const CONFIG_ERROR_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let command = match resolve_command(&cli) {
        Ok(command) => command,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(CONFIG_ERROR_EXIT);
        }
    };

    if cli.dry_run {
        print_dry_run(&command);
        return ExitCode::SUCCESS;
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let logger = tokio::spawn(session::log_events(rx));
    let report = session::run_session(&command, EventSink::new(tx)).await;
    let summary = logger.await.unwrap_or_default();
    tracing::info!(
        pid = ?report.pid,
        outcome = %report.outcome,
        started_at = %report.started_at.format("%Y-%m-%d %H:%M:%S"),
        duration_secs = report.duration.as_secs_f64(),
        ticks = report.ticks.ticks,
        frames_failed = summary.frames_failed,
        partial_frames = summary.partial_frames,
        "done"
    );
    if !report.outcome.success() {
        tracing::warn!(outcome = %report.outcome, "child did not exit cleanly");
    }
    ExitCode::from(signals::shell_exit_code(&report.outcome))
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout belongs to the child.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Merge the config file with CLI overrides and return the child command.
fn resolve_command(cli: &Cli) -> Result<String, ConfigError> {
    match &cli.config {
        Some(path) => resolve_from(path, true, cli.process.clone()),
        None => resolve_from(Path::new(DEFAULT_CONFIG_FILE), false, cli.process.clone()),
    }
}

/// The default config file may be absent, and is skipped when it doesn't
/// parse but `--process` already names the child. An explicitly named file
/// must exist and parse.
fn resolve_from(
    path: &Path,
    explicit: bool,
    process: Option<String>,
) -> Result<String, ConfigError> {
    let config = match FeedConfig::load(path, explicit) {
        Ok(config) => config,
        Err(e @ ConfigError::Parse { .. }) if !explicit && process.is_some() => {
            tracing::warn!(error = %e, "ignoring default config file");
            FeedConfig::default()
        }
        Err(e) => return Err(e),
    };
    config
        .with_command_override(process)
        .command()
        .map(str::to_string)
}

fn print_dry_run(command: &str) {
    let frame = frame::Frame::for_counter(ticker::SEQUENCE_SEED + 1);
    println!("childfeed v{}", env!("CARGO_PKG_VERSION"));
    println!("Command:  {command}");
    println!("Interval: {} ms", ticker::TICK_INTERVAL.as_millis());
    println!("Address:  {:#010x}", frame::FRAME_ADDRESS);
    println!("Size:     {}", frame::PAYLOAD_SIZE);
    println!("First:    {:02x?}", frame.to_bytes());
    println!("Dry run: config resolved, not spawning.");
}

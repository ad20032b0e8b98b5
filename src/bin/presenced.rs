//! Presence daemon - serverless link-local chat endpoint
//!
//! Accepts peer connections, answers chat commands, relays messages
//! between connected peers and stores files they send.
//!
//! # Usage
//!
//! ```bash
//! # Start in the foreground
//! presenced start
//!
//! # Start in the background, replacing a running instance
//! presenced start -d -k
//!
//! # Stop the daemon
//! presenced stop
//!
//! # Check daemon status
//! presenced status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use presenced::config::Config;
use presenced::server::PresenceServer;

/// How long `stop` and `start -k` wait before giving up on SIGTERM
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const STOP_POLL: Duration = Duration::from_millis(100);

/// Presence daemon - link-local chat endpoint
#[derive(Parser, Debug)]
#[command(name = "presenced", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start(StartArgs),
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

#[derive(clap::Args, Debug, Default)]
struct StartArgs {
    /// Run as a background daemon (fork to background)
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Terminate an already running instance first
    #[arg(short = 'k', long)]
    kill: bool,

    /// Log at debug level
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/presence/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory received files are stored in
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Name this endpoint answers to
    #[arg(long)]
    identity: Option<String>,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("presence")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("presenced.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("presenced.log")
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("presence").join("config.toml"))
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).context("PID out of range")?;
    // SAFETY: kill has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, signal) };
    if result != 0 {
        bail!("Failed to send signal {signal} to process {pid}");
    }
    Ok(())
}

/// Polls until `pid` exits or `STOP_TIMEOUT` elapses.
fn wait_for_exit(pid: u32) -> bool {
    let attempts = STOP_TIMEOUT.as_millis() / STOP_POLL.as_millis();
    for _ in 0..attempts {
        if !is_process_running(pid) {
            return true;
        }
        std::thread::sleep(STOP_POLL);
    }
    !is_process_running(pid)
}

/// SIGTERM, then SIGKILL if the process outlives the timeout.
fn kill_daemon(pid: u32) -> Result<()> {
    send_signal(pid, libc::SIGTERM)?;
    if wait_for_exit(pid) {
        return Ok(());
    }
    eprintln!("Daemon (PID {pid}) ignored SIGTERM, sending SIGKILL");
    send_signal(pid, libc::SIGKILL)?;
    if !wait_for_exit(pid) {
        bail!("Process {pid} survived SIGKILL");
    }
    remove_pid_file();
    Ok(())
}

fn load_config(args: &StartArgs) -> Result<Config> {
    let default_path = default_config_path();
    let mut config = Config::load(args.config.as_deref(), default_path.as_deref())
        .context("Failed to load configuration")?;

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = &args.download_dir {
        config.download_dir = Some(dir.clone());
    }
    if let Some(identity) = &args.identity {
        config.identity = identity.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start(StartArgs::default()));

    match command {
        Command::Start(start) => {
            if let Some(pid) = is_daemon_running() {
                if !start.kill {
                    eprintln!("Daemon is already running (PID {pid})");
                    eprintln!("Use 'presenced stop' or 'presenced start -k' to replace it.");
                    process::exit(1);
                }
                println!("Terminating running daemon (PID {pid})...");
                kill_daemon(pid)?;
            }

            // Fail before forking so configuration errors reach the terminal.
            let config = load_config(&start)?;

            if start.daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config, start.verbose);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                send_signal(pid, libc::SIGTERM)?;

                if wait_for_exit(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }

                eprintln!("Daemon did not stop within {} seconds.", STOP_TIMEOUT.as_secs());
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                println!("Log: {}", log_file_path().display());
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: Config, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("presenced={level}").parse()?)
                .add_directive(format!("presence_core={level}").parse()?)
                .add_directive(format!("presence_protocol={level}").parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        identity = %config.identity,
        "Presence daemon starting"
    );
    match &config.download_dir {
        Some(dir) => info!(download_dir = %dir.display(), "File transfers enabled"),
        None => info!("No download directory, file transfers will be refused"),
    }

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let server = PresenceServer::new(&config, cancel_token);

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Presence daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}

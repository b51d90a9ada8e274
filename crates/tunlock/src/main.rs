//! tunlock: VPN kill-switch governor
//!
//! Main entry point. Initializes the global allocator and logging, parses
//! the command line and maps failures onto exit codes:
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | normal shutdown |
//! | 1 | firewall failure |
//! | 2 | root privileges not acquired |
//! | 3 | interface probe failure |
//! | 4 | configuration or usage error |

mod pidfile;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use crossbeam_channel::Sender;
use pidfile::{Pidfile, PidfileError, is_tunlock_process};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunlock_core::{
    ConfigError, DesktopNotifier, Governor, GovernorConfig, GovernorError, GovernorSession,
    LogNotifier, Notifier,
};
use tunlock_firewall::{BackendKind, FirewallGate, GateError, open_backend};
use tunlock_net::{
    HttpAddressResolver, InterfaceProbe, PrivilegeContext, PrivilegeError, ProbeError,
    PublicAddressResolver, SystemNetwork,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_GATE: u8 = 1;
const EXIT_PRIVILEGE: u8 = 2;
const EXIT_PROBE: u8 = 3;
const EXIT_USAGE: u8 = 4;

#[derive(Parser)]
#[command(name = "tunlock", version, about = "VPN kill-switch governor")]
struct Cli {
    /// Config file (default: /etc/tunlock/tunlock.toml if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the governor in the foreground
    Start {
        /// Stage rulesets without loading them; no root required
        #[arg(long)]
        dry_run: bool,
    },
    /// Ask the running governor to restore the firewall and exit
    Stop,
    /// Show the running governor's last state
    Status,
    /// Restore the pre-session firewall after a crash
    Cleanup,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    init_logging();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_logging() {
    // "tunlock" also matches the tunlock_* library targets
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tunlock=info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = GovernorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Start { dry_run } => start(config, dry_run),
        Command::Stop => stop(&config),
        Command::Status => status(&config),
        Command::Cleanup => cleanup(&config),
    }
}

fn start(config: GovernorConfig, dry_run: bool) -> Result<()> {
    let privilege = if dry_run {
        info!("Dry run: rulesets are staged but never loaded");
        PrivilegeContext::dry_run()
    } else {
        PrivilegeContext::acquire()?
    };
    let backend_kind = if dry_run {
        BackendKind::DryRun
    } else {
        config.backend
    };

    let storage = config.ruleset_storage_path.clone();
    std::fs::create_dir_all(&storage)
        .with_context(|| format!("creating storage directory {}", storage.display()))?;
    let _pidfile = Pidfile::acquire(&storage)?;

    // Signals and the public address lookup live on the runtime; the
    // governor loop stays on this thread and blocks on the handle.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("tunlock-rt")
        .enable_all()
        .build()
        .context("starting tokio runtime")?;

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    runtime.spawn(forward_signals(shutdown_tx.clone()));

    let backend = open_backend(backend_kind, &privilege, config.gate_command_timeout())?;
    let gate = FirewallGate::new(backend, &storage, config.allowances())?;

    let host = SystemNetwork::new(&privilege, config.query_timeout());
    let probe = InterfaceProbe::new(
        host,
        config.configured_interface_name.clone(),
        config.query_timeout(),
    );

    let notifier: Box<dyn Notifier> = if config.notifications.enabled {
        Box::new(DesktopNotifier)
    } else {
        Box::new(LogNotifier)
    };

    let resolver = config.public_address.enabled.then(|| {
        Box::new(HttpAddressResolver::new(
            runtime.handle().clone(),
            config.public_address.url.clone(),
        )) as Box<dyn PublicAddressResolver>
    });

    let mut governor = Governor::new(&config, Box::new(probe), gate, notifier, resolver);
    governor.run(&shutdown_rx)?;

    drop(shutdown_tx);
    info!("tunlock shutting down");
    Ok(())
}

/// Forward SIGINT/SIGTERM to the governor's shutdown channel
async fn forward_signals(shutdown: Sender<()>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    let _ = shutdown.try_send(());
}

fn stop(config: &GovernorConfig) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let storage = &config.ruleset_storage_path;
    let pid = Pidfile::read(storage)
        .context("reading pidfile")?
        .ok_or_else(|| anyhow!("tunlock is not running (no pidfile in {})", storage.display()))?;

    if !is_tunlock_process(pid) {
        bail!("tunlock is not running (stale pidfile names pid {})", pid);
    }

    let raw = i32::try_from(pid).context("pid out of range")?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .with_context(|| format!("sending SIGTERM to pid {}", pid))?;

    println!("Sent SIGTERM to tunlock (pid {})", pid);
    Ok(())
}

fn status(config: &GovernorConfig) -> Result<()> {
    let storage = &config.ruleset_storage_path;

    match Pidfile::running(storage).context("reading pidfile")? {
        Some(pid) => println!("tunlock:     running (pid {})", pid),
        None => println!("tunlock:     not running"),
    }

    let Some(session) = GovernorSession::read_status(storage)? else {
        println!("status:      no session snapshot in {}", storage.display());
        return Ok(());
    };
    print_session(&session);
    Ok(())
}

fn print_session(session: &GovernorSession) {
    let gate = session
        .gate
        .as_ref()
        .map(|g| g.to_string())
        .unwrap_or_else(|| "not applied".to_string());

    println!("backend:     {}", session.backend);
    println!("connection:  {}", session.connection);
    println!("gate:        {}", gate);
    println!(
        "last iface:  {}",
        session.last_applied_interface.as_deref().unwrap_or("-")
    );
    println!("ticks:       {}", session.ticks);
    println!("updated:     {}", ago(session.updated_at));
}

fn ago(unix_secs: u64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{}s ago", now.saturating_sub(unix_secs))
}

fn cleanup(config: &GovernorConfig) -> Result<()> {
    let privilege = PrivilegeContext::acquire()?;
    let storage: &Path = &config.ruleset_storage_path;

    if let Some(pid) = Pidfile::running(storage).context("reading pidfile")? {
        bail!("tunlock is running (pid {}); use `tunlock stop` instead", pid);
    }

    let backend = open_backend(config.backend, &privilege, config.gate_command_timeout())?;
    let mut gate = FirewallGate::new(backend, storage, config.allowances())?;
    gate.cleanup()?;
    GovernorSession::clear_status(storage)?;

    println!("Firewall restored ({})", gate.backend_name());
    Ok(())
}

/// Map a failure onto the documented exit codes
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<GovernorError>() {
            return u8::try_from(e.exit_code()).unwrap_or(EXIT_GATE);
        }
        if cause.is::<PrivilegeError>() {
            return EXIT_PRIVILEGE;
        }
        if cause.is::<ProbeError>() {
            return EXIT_PROBE;
        }
        if cause.is::<ConfigError>() {
            return EXIT_USAGE;
        }
        if let Some(GateError::Privilege(_)) = cause.downcast_ref::<GateError>() {
            return EXIT_PRIVILEGE;
        }
        if cause.is::<PidfileError>() {
            return EXIT_USAGE;
        }
    }
    EXIT_GATE
}

//! Leaf Interface Guard Daemon
//!
//! Main entry point for leafd. Forces leaf interfaces down when the upstream
//! loses carrier and restores them once LLDP sees the upstream neighbor again.

use anyhow::Context;
use clap::{ArgAction, CommandFactory, Parser};
use sonic_leafd::config_file::DEFAULT_CONFIG_PATH;
use sonic_leafd::daemon::{self, PidfileGuard};
use sonic_leafd::{
    EventLoop, InterfaceName, LeafError, LeafSet, LeafdConfig, LinkControl, LldpClient,
    NetlinkControl, NetlinkWatch, Reconciler, SystemdNotifier, UpstreamTracker, exit_status,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Keep leaf interfaces down while the upstream interface is down
#[derive(Parser, Debug)]
#[command(name = "leafd")]
#[command(version, about, long_about = None, disable_help_flag = true)]
struct Args {
    /// Upstream interface whose health gates the leaf interfaces
    #[arg(short = 'u', long)]
    upstream: Option<String>,

    /// Leaf interfaces
    #[arg(value_name = "LEAF")]
    leaves: Vec<String>,

    /// Stay in the foreground
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Redirect stderr to this file, stdin/stdout to /dev/null
    #[arg(short = 'l', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Pidfile guarding against a second instance
    #[arg(short = 'p', long)]
    pidfile: Option<PathBuf>,

    /// LLDP daemon socket, overrides the configuration file
    #[arg(short = 'n', long = "lldp-socket")]
    lldp_socket: Option<PathBuf>,

    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Increase verbosity (repeatable)
    #[arg(short = 'd', long = "debug", action = ArgAction::Count)]
    debug: u8,

    /// Print usage and exit
    #[arg(short = 'h', long = "help", action = ArgAction::SetTrue)]
    help: bool,
}

/// Everything the daemon needs once arguments and configuration are accepted.
struct Settings {
    config: LeafdConfig,
    upstream: InterfaceName,
    leaves: LeafSet,
}

fn settings_from(args: &Args) -> sonic_leafd::Result<Settings> {
    let upstream = args.upstream.as_deref().ok_or_else(|| {
        LeafError::Configuration("missing upstream interface (-u)".to_string())
    })?;
    let upstream = InterfaceName::new(upstream)?;
    let leaves = LeafSet::new(
        args.leaves
            .iter()
            .map(|name| InterfaceName::new(name.as_str()))
            .collect::<sonic_leafd::Result<Vec<_>>>()?,
    );
    if leaves.contains(upstream.as_str()) {
        return Err(LeafError::Configuration(format!(
            "upstream interface {} is also listed as a leaf",
            upstream
        )));
    }

    let mut config = LeafdConfig::load_or_default(&args.config)?;
    if let Some(path) = &args.lldp_socket {
        config.lldp.socket_path = path.clone();
    }
    config.validate()?;

    Ok(Settings {
        config,
        upstream,
        leaves,
    })
}

fn init_logging(debug: u8) {
    let level = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// Pidfile, log redirection and daemonization; returns the live pidfile guard.
fn prepare_process(args: &Args) -> anyhow::Result<Option<PidfileGuard>> {
    if let Some(pidfile) = &args.pidfile {
        daemon::check_pidfile(pidfile).context("pidfile check failed")?;
    }
    if let Some(log_file) = &args.log_file {
        daemon::redirect_output(log_file)
            .with_context(|| format!("cannot log to {}", log_file.display()))?;
    }
    init_logging(args.debug);

    if !args.foreground {
        daemon::daemonize().context("daemonization failed")?;
    }

    let guard = match &args.pidfile {
        Some(pidfile) => {
            let guard = PidfileGuard::create(pidfile).context("pidfile creation failed")?;
            daemon::chdir_root()?;
            Some(guard)
        }
        None => None,
    };
    Ok(guard)
}

fn register_shutdown_signals() -> anyhow::Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .with_context(|| format!("cannot register handler for signal {}", signal))?;
    }
    Ok(shutdown)
}

/// Channels and engine, released in reverse order if a later step fails.
fn build_event_loop(
    settings: Settings,
) -> sonic_leafd::Result<EventLoop<NetlinkWatch, LldpClient, NetlinkControl>> {
    let Settings {
        config,
        upstream,
        leaves,
    } = settings;

    let mut control = NetlinkControl::new(&config.netlink)?;
    let watch = NetlinkWatch::new(&config.netlink)?;

    control.interfaces_exist(std::slice::from_ref(&upstream))?;
    control.interfaces_exist(&leaves)?;

    let lldp = LldpClient::connect(&config.lldp.socket_path, config.lldp.handshake_timeout())?;

    let engine = Reconciler::new(control, UpstreamTracker::new(upstream), leaves);
    Ok(EventLoop::new(
        watch,
        lldp,
        engine,
        config.lldp.reconnect_interval(),
    ))
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayVersion => {
            let _ = e.print();
            return ExitCode::from(exit_status::SUCCESS);
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(exit_status::BAD_ARGUMENTS);
        }
    };
    if args.help {
        eprint!("{}", Args::command().render_help());
        return ExitCode::from(exit_status::FAILURE);
    }

    let settings = match settings_from(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("leafd: {}", e);
            return ExitCode::from(exit_status::BAD_ARGUMENTS);
        }
    };

    let _pidfile = match prepare_process(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("leafd: {:#}", e);
            return ExitCode::from(exit_status::FAILURE);
        }
    };

    let shutdown = match register_shutdown_signals() {
        Ok(flag) => flag,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Signal setup failed");
            return ExitCode::from(exit_status::FAILURE);
        }
    };

    info!(
        upstream = %settings.upstream,
        leaves = %settings.leaves,
        lldp_socket = %settings.config.lldp.socket_path.display(),
        "Starting leafd"
    );
    let status = format!("Guarding {} behind {}", settings.leaves, settings.upstream);

    let mut event_loop = match build_event_loop(settings) {
        Ok(event_loop) => event_loop,
        Err(e) => {
            error!(error = %e, "Initialization failed");
            return ExitCode::from(exit_status::INIT_FAILURE);
        }
    };

    let notifier = SystemdNotifier::new();
    if let Err(e) = notifier
        .notify_status(&status)
        .and_then(|_| notifier.notify_ready())
    {
        warn!(error = %e, "systemd notification failed");
    }

    let result = event_loop.run(&shutdown);

    if let Err(e) = notifier.notify_stopping() {
        warn!(error = %e, "systemd notification failed");
    }
    match result {
        Ok(()) => {
            info!("leafd exiting normally");
            ExitCode::from(exit_status::SUCCESS)
        }
        Err(e) => {
            error!(error = %e, fatal_decode = e.is_fatal_decode(), "Event loop failed");
            ExitCode::from(exit_status::FAILURE)
        }
    }
}

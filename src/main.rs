//! lamco-login - console login manager
//!
//! Entry point for the login binary.

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lamco_login::config::{LoginConfig, DEFAULT_CONFIG_PATH};
use lamco_login::greeter::{Attempt, TerminalGreeter};
use lamco_login::session::{SessionCatalog, SessionId};
use lamco_login::{AuthSessionOrchestrator, Collaborators};

/// How often a running session is polled for exit
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// How long a signal waits for an in-flight login call
const SHUTDOWN_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments for lamco-login
#[derive(Parser, Debug)]
#[command(name = "lamco-login")]
#[command(version, about = "Console login manager", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "LAMCO_LOGIN_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Session offered by default
    #[arg(short, long)]
    pub session: Option<String>,

    /// Print the available sessions and exit
    #[arg(long)]
    pub list_sessions: bool,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "compact")]
    pub log_format: String,

    /// Write logs to file (in addition to stderr)
    #[arg(long)]
    pub log_file: Option<String>,

    /// Run without root (session launches will fail at setgid)
    #[arg(long)]
    pub allow_unprivileged: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = LoginConfig::load(&args.config);

    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = init_logging(&args, config.as_ref().ok())?;

    info!("lamco-login v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {} ({})", env!("BUILD_DATE"), env!("GIT_HASH"));

    let config = config.unwrap_or_else(|e| {
        warn!("Failed to load config: {:#}, using defaults", e);
        LoginConfig::default()
    });
    tracing::debug!("Config: {:?}", config);

    if args.list_sessions {
        for session in SessionCatalog::new(&config.sessions).list() {
            println!("{}", session);
        }
        return Ok(());
    }

    if !nix::unistd::Uid::effective().is_root() {
        if args.allow_unprivileged {
            warn!("Running without root - sessions cannot be started");
        } else {
            let e = anyhow::anyhow!("Login manager must run as root");
            eprintln!("{}", lamco_login::utils::format_user_error(&e));
            return Err(e);
        }
    }

    let collaborators = match Collaborators::system(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", lamco_login::utils::format_user_error(&e));
            return Err(e);
        }
    };

    let orchestrator = Arc::new(Mutex::new(AuthSessionOrchestrator::new(
        &config,
        collaborators,
    )));
    tokio::spawn(logout_on_signal(orchestrator.clone()));

    let preferred = args.session.map(SessionId::from);

    loop {
        let round = orchestrator.clone();
        let choice = preferred.clone();
        let attempt = tokio::task::spawn_blocking(move || {
            TerminalGreeter::stdio().attempt(&round, choice.as_ref())
        })
        .await??;

        match attempt {
            Attempt::Quit => break,
            Attempt::Retry => continue,
            Attempt::Launched(session) => {
                wait_for_sessions(&orchestrator).await;
                info!("Session {} ended", session);
                orchestrator.lock().logout();
            }
        }
    }

    orchestrator.lock().logout();
    info!("lamco-login shut down");
    Ok(())
}

/// Poll until every launched session has exited
async fn wait_for_sessions(orchestrator: &Mutex<AuthSessionOrchestrator>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        let mut orchestrator = orchestrator.lock();
        orchestrator.reap_sessions();
        if !orchestrator.has_active_sessions() {
            break;
        }
    }
}

/// Log out and exit on SIGINT/SIGTERM
async fn logout_on_signal(orchestrator: Arc<Mutex<AuthSessionOrchestrator>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(int), Ok(term)) => (int, term),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to install signal handlers: {}", e);
            return;
        }
    };

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    info!("Received {}, shutting down", name);

    match orchestrator.try_lock_for(SHUTDOWN_LOCK_TIMEOUT) {
        Some(mut orchestrator) => orchestrator.logout(),
        None => warn!("Login call still in progress - exiting without logout"),
    }

    std::process::exit(0);
}

fn init_logging(
    args: &Args,
    config: Option<&LoginConfig>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_level = match args.verbose {
        0 => config.map_or("info", |c| c.logging.level.as_str()),
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "lamco_login={level},lamco_login::auth={level},warn",
            level = log_level
        ))
    });

    // stdout belongs to the greeter
    let console = std::io::stderr;

    // If log file is specified, write to both stderr and file
    if let Some(log_file_path) = &args.log_file {
        let path = std::path::Path::new(log_file_path);
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", log_file_path))?;

        let appender = tracing_appender::rolling::never(directory, file_name);
        let (file, guard) = tracing_appender::non_blocking(appender);

        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json().with_writer(console))
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            "pretty" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty().with_writer(console))
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact().with_writer(console))
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        info!("Logging to file: {}", log_file_path);
        return Ok(Some(guard));
    }

    match args.log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(console))
                .init();
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(console))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact().with_writer(console))
                .init();
        }
    }

    Ok(None)
}

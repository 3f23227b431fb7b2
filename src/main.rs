//! Diablo - Point-to-Point Encrypted Tunnel
//!
//! Command-line entry point: host or connect a tunnel session, stop or
//! restart it from another shell, and manage the server password.

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use diablo::auth::PasswordRecord;
use diablo::config::{self, Settings};
use diablo::error::{Error, Result};
use diablo::forwarder::ForwardReport;
use diablo::session::{PasswordSource, Role, SessionContext, SessionController, SessionStatus, StopOutcome};
use diablo::tls::{CertificateStore, Fingerprint};

/// Diablo - Point-to-Point Encrypted Tunnel
#[derive(Parser)]
#[command(name = "diablo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "DIABLO_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a tunnel and wait for one peer
    Host {
        /// Tunnel port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to a hosted tunnel
    Connect {
        /// Responder address
        #[arg(default_value = "127.0.0.1")]
        peer: String,

        /// Tunnel port
        #[arg(short, long)]
        port: Option<u16>,

        /// Server password (prompted for when required and omitted)
        #[arg(long, env = "DIABLO_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Expected SHA-256 fingerprint of the responder certificate
        #[arg(long)]
        pin: Option<Fingerprint>,
    },

    /// Stop the running session
    Stop {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Stop the running session only if it is a connection
    Disconnect {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the running session
    Status,

    /// Stop the last session and start it again in this shell
    Restart,

    /// Set the server password
    Password {
        /// Also require connecting peers to present it
        #[arg(long)]
        require: bool,
    },

    /// Print the certificate fingerprint for peers to pin
    Fingerprint,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

    let settings = Settings::load(&config_path);
    let level = cli.log_level.clone().unwrap_or_else(|| match &settings {
        Ok(settings) => settings.logging.level.clone(),
        Err(_) => "info".to_string(),
    });
    init_logging(&level);

    let result = match settings {
        Ok(settings) => run(cli.command, &config_path, settings).await,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}", config_path);
            Err(e)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !e.is_user_facing() {
                tracing::error!("{:?}", e);
            }
            eprintln!("✗ {}", e);
            ExitCode::from(1)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(command: Commands, config_path: &Path, settings: Settings) -> Result<()> {
    match command {
        Commands::Host { port } => run_host(settings, port).await,
        Commands::Connect {
            peer,
            port,
            password,
            pin,
        } => run_connect(settings, peer, port, password, pin).await,
        Commands::Stop { yes } => run_stop(&settings, None, yes).await,
        Commands::Disconnect { yes } => run_stop(&settings, Some(Role::Initiator), yes).await,
        Commands::Status => run_status(&settings),
        Commands::Restart => run_restart(settings).await,
        Commands::Password { require } => run_password(config_path, settings, require),
        Commands::Fingerprint => run_fingerprint(&settings),
    }
}

/// Cancelled on SIGINT or SIGTERM
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });
    token
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = terminate.recv() => {
            tracing::info!("Received termination signal");
        }
    }
}

async fn run_host(mut settings: Settings, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        settings.server.port = port;
    }
    settings.validate()?;

    let mut controller = SessionController::for_host(&settings);
    let report = controller
        .start(SessionContext::responder(settings), shutdown_on_signal())
        .await?;
    print_report(&report);
    Ok(())
}

async fn run_connect(
    mut settings: Settings,
    peer: String,
    port: Option<u16>,
    password: Option<String>,
    pin: Option<Fingerprint>,
) -> Result<()> {
    if let Some(port) = port {
        settings.server.port = port;
    }
    settings.validate()?;

    let password = match password {
        Some(password) => PasswordSource::Given(password),
        None if std::io::stdin().is_terminal() => PasswordSource::Prompt(prompt_server_password),
        None => PasswordSource::None,
    };

    let mut controller = SessionController::for_host(&settings);
    let ctx = SessionContext::initiator(settings, peer, password).with_pin(pin);
    let report = controller.start(ctx, shutdown_on_signal()).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &ForwardReport) {
    println!(
        "✓ Tunnel closed: {} packets sent ({} bytes), {} received ({} bytes)",
        report.outbound.packets, report.outbound.bytes, report.inbound.packets, report.inbound.bytes
    );
    if report.peer_closed() {
        println!("  The peer ended the session");
    }
}

async fn run_stop(settings: &Settings, only: Option<Role>, yes: bool) -> Result<()> {
    let controller = SessionController::for_host(settings);
    let outcome = controller
        .stop(only, |active| {
            yes || confirm(&format!(
                "Stop the {} session (PID {})?",
                active.role, active.process_id
            ))
        })
        .await?;

    match outcome {
        StopOutcome::NothingToStop => match only {
            Some(role) => println!("No {} session to stop", role),
            None => println!("Nothing to stop"),
        },
        StopOutcome::Declined => println!("Left running"),
        StopOutcome::Stopped { role, pid } => println!("✓ Stopped {} session (PID {})", role, pid),
        StopOutcome::AlreadyGone { role, pid } => {
            println!("✓ {} session (PID {}) had already exited", role, pid)
        }
        StopOutcome::StillRunning { role, pid } => return Err(Error::StillRunning { role, pid }),
    }
    Ok(())
}

fn run_status(settings: &Settings) -> Result<()> {
    let controller = SessionController::for_host(settings);
    match controller.status()? {
        Some(status) => print_status(&status),
        None => println!("No active session"),
    }
    Ok(())
}

fn print_status(status: &SessionStatus) {
    let uptime = status.uptime();

    println!();
    println!("Diablo Session Status");
    println!("=====================");
    println!();
    println!("Role:         {}", status.role);
    println!("PID:          {}", status.process_id);
    println!("Host:         {}", status.host_address);
    println!("Interface:    {}", status.interface.as_deref().unwrap_or("(starting)"));
    println!("Peer:         {}", status.peer_address.as_deref().unwrap_or("(waiting)"));
    println!("Peers:        {}", status.peer_count);
    println!(
        "Password:     {}",
        if status.password_required { "required" } else { "not required" }
    );
    println!(
        "Started:      {} (up {}h {}m {}s)",
        status.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        uptime.num_hours(),
        uptime.num_minutes() % 60,
        uptime.num_seconds() % 60
    );
    println!();
}

async fn run_restart(settings: Settings) -> Result<()> {
    let controller = SessionController::for_host(&settings);
    let Some(plan) = controller.plan_restart().await? else {
        println!("No previous session to restart");
        return Ok(());
    };

    println!("Restarting {} session", plan.role);
    match plan.role {
        Role::Responder => run_host(settings, None).await,
        Role::Initiator => {
            let peer = plan.peer.unwrap_or_else(|| "127.0.0.1".to_string());
            run_connect(settings, peer, None, None, None).await
        }
    }
}

fn run_password(config_path: &Path, mut settings: Settings, require: bool) -> Result<()> {
    if settings.password_is_set() && !nix::unistd::Uid::effective().is_root() {
        let current = PasswordRecord::from_hash(settings.server.password_hash.trim())?;
        let attempt = prompt_password("Current password: ")?;
        if !current.verify(&attempt) {
            return Err(Error::Password("current password is incorrect".into()));
        }
    }

    let password = prompt_password("New password: ")?;
    let again = prompt_password("Repeat new password: ")?;
    if password != again {
        return Err(Error::Password("passwords do not match".into()));
    }

    let record = PasswordRecord::create(&password)?;
    settings.server.password_hash = record.as_str().to_string();
    if require {
        settings.server.require_password = true;
    }
    settings.save(config_path)?;

    println!("✓ Password updated in {}", config_path.display());
    if settings.server.require_password {
        println!("  Peers must present it to connect");
    } else {
        println!("  Not enforced; run `diablo password --require` to enforce it");
    }
    Ok(())
}

fn run_fingerprint(settings: &Settings) -> Result<()> {
    let store = CertificateStore::new(settings.tls.cert_path.clone(), settings.tls.key_path.clone());
    store.ensure()?;
    let fingerprint = store.load()?.fingerprint()?;

    println!("{}", fingerprint);
    println!("  Connect with: diablo connect <host> --pin {}", fingerprint);
    Ok(())
}

fn prompt_server_password() -> Option<String> {
    match prompt_password("Server password: ") {
        Ok(password) if !password.is_empty() => Some(password),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Cannot read password: {}", e);
            None
        }
    }
}

/// Read a line from stdin with terminal echo disabled
fn prompt_password(label: &str) -> std::io::Result<String> {
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

    let stdin = std::io::stdin();
    eprint!("{}", label);
    std::io::stderr().flush()?;

    let saved = if stdin.is_terminal() { tcgetattr(&stdin).ok() } else { None };
    if let Some(original) = &saved {
        let mut silent = original.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        let _ = tcsetattr(&stdin, SetArg::TCSANOW, &silent);
    }

    let mut line = String::new();
    let read = stdin.lock().read_line(&mut line);

    if let Some(original) = &saved {
        let _ = tcsetattr(&stdin, SetArg::TCSANOW, original);
        eprintln!();
    }
    read?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn confirm(question: &str) -> bool {
    eprint!("{} [y/N] ", question);
    let _ = std::io::stderr().flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

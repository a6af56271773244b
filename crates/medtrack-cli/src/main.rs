//! MedTrack CLI - drive the client session from a terminal.
//!
//! This binary is a host for `medtrack-core`: it picks the credential
//! backend from the config, restores the stored session, and runs one
//! session command (login, register, logout, status, whoami).

use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use medtrack_core::auth::{open_store, SessionManager};
use medtrack_core::models::NewAccount;
use medtrack_core::push::{NoopRegistrar, PushSubscriber};
use medtrack_core::{Config, Phase};

// ============================================================================
// Constants
// ============================================================================

/// Log file name when a log directory is configured
const LOG_FILE: &str = "medtrack.log";

const USAGE: &str = "Usage: medtrack <command>

Commands:
  login [email]   Sign in and store the session
  register        Create a new account
  logout          Sign out and forget the stored session
  status          Show whether a stored session is still valid
  whoami          Print the signed-in user's profile as JSON";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login(Option<String>),
    Register,
    Logout,
    Status,
    WhoAmI,
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        match args.first().map(String::as_str) {
            Some("login") => Some(Command::Login(args.get(1).cloned())),
            Some("register") => Some(Command::Register),
            Some("logout") => Some(Command::Logout),
            Some("status") | None => Some(Command::Status),
            Some("whoami") => Some(Command::WhoAmI),
            Some(_) => None,
        }
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = Command::parse(&args) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config ({}), using defaults", e);
            Config::default()
        }
    };

    let _log_guard = init_tracing(&config);
    info!(api = %config.api_base_url, storage = ?config.storage, "MedTrack CLI starting");

    let store = open_store(&config)?;
    let manager = SessionManager::from_config(&config, store)?;

    // No push service on a terminal; the subscriber still follows the session
    let push = PushSubscriber::new(NoopRegistrar, manager.api().clone()).spawn(manager.subscribe());

    let result = run(command, &manager, &mut config).await;

    drop(manager);
    let _ = push.await;
    result
}

async fn run(command: Command, manager: &SessionManager, config: &mut Config) -> Result<()> {
    match command {
        Command::Status => {
            let session = manager.restore().await;
            match session.user() {
                Some(user) => println!("Signed in as {}", user.display_name()),
                None => println!("Not signed in"),
            }
        }
        Command::WhoAmI => {
            let session = manager.restore().await;
            let user = session
                .user()
                .ok_or_else(|| anyhow::anyhow!("Not signed in. Run `medtrack login` first."))?;
            println!("{}", serde_json::to_string_pretty(user).context("Failed to format profile")?);
        }
        Command::Login(email) => {
            if manager.restore().await.phase() == Phase::Authenticated {
                println!("Already signed in. Run `medtrack logout` to switch accounts.");
                return Ok(());
            }

            let email = match email.or_else(|| std::env::var("MEDTRACK_EMAIL").ok()) {
                Some(email) => email,
                None => prompt_with_default("Email", config.last_email.as_deref())?,
            };
            let password = match std::env::var("MEDTRACK_PASSWORD") {
                Ok(password) => password,
                Err(_) => prompt_password()?,
            };

            let user = manager.login(&email, &password).await?;

            config.last_email = Some(email);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
            println!("Signed in as {}", user.display_name());
        }
        Command::Register => {
            let account = NewAccount {
                name: prompt("Name")?,
                email: prompt("Email")?,
                password: prompt_password()?,
                time_zone: std::env::var("TZ").ok(),
            };
            manager.register(&account).await?;
            println!("Account created. Run `medtrack login` to sign in.");
        }
        Command::Logout => {
            manager.logout().await;
            println!("Signed out");
        }
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_with_default(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(default) => {
            let input = prompt(&format!("{} [{}]", label, default))?;
            Ok(if input.is_empty() { default.to_string() } else { input })
        }
        None => prompt(label),
    }
}

fn prompt_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

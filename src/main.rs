use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crm_console::config::{ConfigError, ConsoleConfig, parse_base_url};
use crm_console::console::{Console, ConsoleError, ViewOutcome};
use crm_console::guard::Verification;
use crm_console::net::types::{Credentials, Registration};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error("not signed in; redirected to {0}")]
    Redirected(String),
    #[error("token rejected; redirected to {0}")]
    Rejected(String),
    #[error("session still loading")]
    StillLoading,
    #[error("token verification failed: {0:?}")]
    Verification(Verification),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "crm-console", about = "CRM console session and protected-view client")]
struct Cli {
    #[arg(long, env = "CRM_API_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "CRM_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and persist the session.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "CRM_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account and sign in with it.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "CRM_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        company: Option<String>,
    },
    /// Clear the persisted session.
    Logout,
    /// Show the persisted session without contacting the backend.
    Status,
    /// Check the persisted token against the backend.
    Verify,
    /// Open a protected view and print its data.
    View {
        #[arg(default_value = "/api/leads")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = dotenv {
        if !e.not_found() {
            tracing::warn!(error = %e, "failed to load .env");
        }
    }

    let cli = Cli::parse();
    let mut config = ConsoleConfig::from_env()?;
    if let Some(base_url) = cli.base_url.as_deref() {
        config.api_base_url = parse_base_url("--base-url", base_url)?;
    }
    if let Some(path) = cli.storage_path {
        config.storage_path = path;
    }
    let console = Console::from_config(config)?;

    match cli.command {
        Command::Login { email, password } => {
            let user = console.login(&Credentials { email, password }).await?;
            eprintln!("signed in as {}", user.display_name());
            Ok(())
        }
        Command::Register { email, password, name, company } => {
            let user = console
                .register(&Registration { email, password, name, company })
                .await?;
            eprintln!("registered and signed in as {}", user.display_name());
            Ok(())
        }
        Command::Logout => {
            console.logout()?;
            eprintln!("signed out");
            Ok(())
        }
        Command::Status => run_status(&console),
        Command::Verify => run_verify(&console).await,
        Command::View { path } => run_view(&console, &path).await,
    }
}

fn run_status(console: &Console) -> Result<(), CliError> {
    let session = console.status();
    let status = serde_json::json!({
        "authenticated": session.is_authenticated(),
        "hydrated": session.is_hydrated,
        "user": session.user,
    });
    print_json(&status)
}

async fn run_verify(console: &Console) -> Result<(), CliError> {
    match console.verify().await {
        Verification::Verified => {
            eprintln!("token valid");
            Ok(())
        }
        Verification::Unreachable => {
            eprintln!("backend unreachable; keeping session");
            Ok(())
        }
        Verification::Skipped => Err(CliError::Redirected(last_redirect(console))),
        Verification::Rejected => Err(CliError::Rejected(last_redirect(console))),
        other => Err(CliError::Verification(other)),
    }
}

fn last_redirect(console: &Console) -> String {
    console
        .navigator()
        .last()
        .unwrap_or_else(|| console.guard("/").redirect_target())
}

async fn run_view(console: &Console, path: &str) -> Result<(), CliError> {
    match console.open(path).await? {
        ViewOutcome::Rendered(data) => print_json(&data),
        ViewOutcome::Redirected(target) => Err(CliError::Redirected(target)),
        ViewOutcome::Loading => Err(CliError::StillLoading),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

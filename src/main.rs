use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use configuration::{DEFAULT_PREFIX, Settings, load_settings, parse_overrides, resolve_from_env};
use database::{SeedOptions, SeedOutcome, get_engine, get_session_factory, initialize_db, models};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// The main entry point for the Case Interview application.
#[tokio::main]
async fn main() -> Result<()> {
    // The PG_* connection variables may come from a .env file.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let settings = read_settings(&args.config, args.options.as_deref())?;
            init_tracing(&settings)?;
            web_server::run_server(settings).await?;
        }
        Commands::InitializeDb(args) => {
            let settings = read_settings(&args.config, args.options.as_deref())?;
            init_tracing(&settings)?;
            handle_initialize_db(settings, args.drop_all).await?;
        }
    }

    Ok(())
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Time series and depth series data behind a small, permissioned web app.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web application.
    Serve(ServeArgs),
    /// Create the database schema and seed the admin account.
    InitializeDb(InitializeDbArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// The settings file (TOML).
    config: PathBuf,

    /// Comma-separated list of key=value pairs overwriting settings from the file.
    #[arg(short, long)]
    options: Option<String>,
}

#[derive(Parser)]
struct InitializeDbArgs {
    /// The settings file (TOML).
    config: PathBuf,

    /// Comma-separated list of key=value pairs overwriting settings from the file.
    #[arg(short, long)]
    options: Option<String>,

    /// Drop all tables first.
    #[arg(long)]
    drop_all: bool,
}

fn read_settings(path: &Path, options: Option<&str>) -> Result<Settings> {
    let overrides = options.map(parse_overrides).transpose()?.unwrap_or_default();
    load_settings(path, &overrides)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

/// `RUST_LOG` wins; otherwise the `logging.level` setting, then `info`.
fn init_tracing(settings: &Settings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.get_or("logging.level", "info")))
        .context("Invalid logging.level setting")?;
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

// ==============================================================================
// Initialize-DB Command Logic
// ==============================================================================

async fn handle_initialize_db(mut settings: Settings, drop_all: bool) -> Result<()> {
    resolve_from_env(&mut settings).context("Invalid database configuration")?;
    let engine = get_engine(&settings, DEFAULT_PREFIX)?;
    let session_factory = get_session_factory(&engine, None);
    let metadata = models::metadata()?;

    let options = SeedOptions {
        drop_all,
        ..SeedOptions::default()
    };
    let outcome = initialize_db(&metadata, &session_factory, &options).await;
    engine.dispose().await;

    match outcome.context("Database initialization failed")? {
        SeedOutcome::Seeded { admin_id } => {
            println!("Database initialized; created user '{}' ({admin_id}).", options.admin_name);
        }
        SeedOutcome::AlreadySeeded => {
            println!("Database schema is up to date; users already exist.")
        }
    }
    Ok(())
}

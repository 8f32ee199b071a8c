use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use markgate::config::Config;
use markgate::coordinator::{
    AccessMode, ClientConfig, CoordinatorClient, CoordinatorServer, LockError, LockMode, ResourceId,
};
use markgate::error::{Error, MarkgateError};

/// Exit code for failures worth retrying (EX_TEMPFAIL)
const EXIT_RETRYABLE: i32 = 75;

#[derive(Parser)]
#[command(
    name = "markgate",
    version,
    about = "Read/write lock coordinator for exam marks",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); defaults to the configured format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator server
    Serve {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the bind address, e.g. 127.0.0.1:8080
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Show the lock state of a resource
    Status {
        /// Resource id, e.g. exam:42:results
        resource: String,

        /// Coordinator URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },

    /// Acquire a lock
    Acquire {
        resource: String,
        holder: String,

        /// Lock mode (read, write)
        #[arg(short, long)]
        mode: AccessMode,

        /// Requested lease in milliseconds
        #[arg(long)]
        lease_ms: Option<u64>,

        /// Fail instead of queueing when the resource is busy
        #[arg(long)]
        no_wait: bool,

        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },

    /// Release a lock
    Release {
        resource: String,
        holder: String,

        /// Lock mode (read, write)
        #[arg(short, long)]
        mode: AccessMode,

        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Serve { config, bind } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind_address = bind
                    .parse()
                    .with_context(|| format!("Invalid bind address: {bind}"))?;
            }
            config
        }
        _ => Config::from_env()?,
    };

    let log_format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(log_format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Serve { .. } => serve(config).await,
        Commands::Status { resource, url } => {
            exit_on_error(status(&url, &resource).await);
            Ok(())
        }
        Commands::Acquire {
            resource,
            holder,
            mode,
            lease_ms,
            no_wait,
            url,
        } => {
            tracing::info!(resource = %resource, holder = %holder, mode = mode.label(), "Starting acquire command");
            exit_on_error(acquire(&url, &resource, &holder, mode, lease_ms, !no_wait).await);
            Ok(())
        }
        Commands::Release {
            resource,
            holder,
            mode,
            url,
        } => {
            tracing::info!(resource = %resource, holder = %holder, mode = mode.label(), "Starting release command");
            exit_on_error(release(&url, &resource, &holder, mode).await);
            Ok(())
        }
    }
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("markgate=debug,tower_http=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("markgate={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    if let Err(e) = markgate::metrics::init_metrics() {
        tracing::warn!("Metrics initialization failed: {}", e);
    }

    let server = CoordinatorServer::new(config.to_coordinator_config())
        .context("Failed to create coordinator server")?;
    println!("{}", server.info().display());

    server
        .start_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Coordinator server failed")?;

    Ok(())
}

/// Print a client failure and exit, distinguishing retryable outcomes
fn exit_on_error(result: markgate::error::Result<()>) {
    let Err(e) = result else {
        return;
    };

    eprintln!("error [{}]: {e}", e.category().as_str());
    std::process::exit(if e.is_recoverable() { EXIT_RETRYABLE } else { 1 });
}

fn client(url: &str) -> markgate::error::Result<CoordinatorClient> {
    Ok(CoordinatorClient::new(ClientConfig::new(url))?)
}

async fn status(url: &str, resource: &str) -> markgate::error::Result<()> {
    let snapshot = client(url)?.status(resource).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn acquire(
    url: &str,
    resource: &str,
    holder: &str,
    mode: AccessMode,
    lease_ms: Option<u64>,
    wait: bool,
) -> markgate::error::Result<()> {
    let response = client(url)?
        .acquire(resource, holder, mode, lease_ms, wait)
        .await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if !response.granted {
        // Still queued; the caller polls or retries
        return Err(Error::Lock(LockError::LockBusy {
            resource: ResourceId::parse(resource)?,
            mode: response.blocked_by.unwrap_or(LockMode::Write),
        }));
    }
    Ok(())
}

async fn release(url: &str, resource: &str, holder: &str, mode: AccessMode) -> markgate::error::Result<()> {
    client(url)?.release(resource, holder, mode).await?;
    println!("released {} lock on {resource} for {holder}", mode.label());
    Ok(())
}

//! boardcache - capability-validated board database cache

use anyhow::{Context, Result};
use boardcache_core::{
    CacheConfig, CancelToken, CapabilityTier, CoreError, Credentials, DatabaseOrchestrator,
};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tool output printed to the terminal on failure
const DIAGNOSTIC_LIMIT: usize = 4000;

#[derive(Parser)]
#[command(
    name = "boardcache",
    version,
    about = "Capability-validated cache of climbing board databases",
    long_about = "Builds, validates and caches per-board SQLite databases produced by boardlib.\n\
                  \n\
                  A database is only served when it contains every table the requested tier\n\
                  needs (layouts, catalog, geometry, logbook). Lookups go local cache, then\n\
                  remote cache, then a fresh build.\n\
                  \n\
                  Examples:\n\
                    boardcache serve --port 8000\n\
                    boardcache ensure aurora --tier catalog\n\
                    boardcache ensure kilter --username me --password-env KILTER_PASSWORD\n\
                    boardcache fetch-images aurora\n\
                    boardcache inspect aurora\n\
                    boardcache evict kilter\n\
                  \n\
                  Environment Variables:\n\
                    ENV                              # dev | prod (prod requires the remote cache)\n\
                    BOARDCACHE_CACHE_DIR             # Local cache root (default server/board_dbs)\n\
                    DATA_DIR                         # Root for board images (default data)\n\
                    PUBLIC_SUPABASE_URL              # Remote cache project URL\n\
                    SUPABASE_SERVICE_ROLE_KEY        # Remote cache service key\n\
                    BOARDCACHE_PYTHON                # Interpreter used to run boardlib\n\
                    RUST_LOG                         # Log filter (default info)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Local cache directory (overrides BOARDCACHE_CACHE_DIR / DATA_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Build timeout in seconds
    #[arg(long, global = true)]
    build_timeout: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "BOARDCACHE_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1", env = "BOARDCACHE_HOST")]
        host: IpAddr,
        /// Port to listen on
        #[arg(long, default_value = "8000", env = "BOARDCACHE_PORT")]
        port: u16,
        /// Allowed CORS origin (repeatable; none allows any)
        #[arg(long = "cors-origin", env = "BOARDCACHE_CORS_ORIGINS", value_delimiter = ',')]
        cors_origins: Vec<String>,
    },
    /// Ensure a database for a board and print where it is
    Ensure {
        /// Board identifier (aurora, kilter, tension, ...)
        board: String,
        /// Capability tier the database must satisfy
        #[arg(long, default_value = "catalog")]
        tier: String,
        /// Origin account username
        #[arg(long)]
        username: Option<String>,
        /// Environment variable holding the origin account password
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,
    },
    /// Download board images next to the cache
    FetchImages {
        /// Board identifier
        board: String,
        /// Origin account username
        #[arg(long)]
        username: Option<String>,
        /// Environment variable holding the origin account password
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,
    },
    /// Show the cached database for a board without building
    Inspect {
        /// Board identifier
        board: String,
    },
    /// Remove the cached database for a board
    Evict {
        /// Board identifier
        board: String,
    },
    /// Remove every locally cached database
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = CacheConfig::from_env().context("Failed to load configuration")?;
    if let Some(dir) = cli.cache_dir {
        config = config.with_cache_root(dir);
    }
    if let Some(secs) = cli.build_timeout {
        config.runner.timeout = Duration::from_secs(secs);
    }

    let orchestrator =
        Arc::new(DatabaseOrchestrator::from_config(config).context("Failed to initialize cache")?);

    match cli.command {
        Command::Serve {
            host,
            port,
            cors_origins,
        } => {
            let addr = SocketAddr::new(host, port);
            boardcache_web::run(orchestrator, addr, &cors_origins).await?;
        }
        Command::Ensure {
            board,
            tier,
            username,
            password_env,
        } => {
            run_ensure(&orchestrator, &board, &tier, username, password_env).await?;
        }
        Command::FetchImages {
            board,
            username,
            password_env,
        } => {
            let credentials = credentials(username, password_env)?;
            let cancel = cancel_on_interrupt();
            match orchestrator
                .ensure_images(&board, &credentials, &cancel)
                .await
            {
                Ok(images) => println!("{}", serde_json::to_string_pretty(&images)?),
                Err(err) => {
                    report(&err);
                    return Err(err.into());
                }
            }
        }
        Command::Inspect { board } => {
            let status = orchestrator.status(&board)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Evict { board } => {
            orchestrator.evict(&board).await?;
            println!("Evicted {}", board.trim().to_ascii_lowercase());
        }
        Command::ClearCache => {
            let removed = orchestrator.clear()?;
            println!(
                "Removed {} cached database(s) from {}",
                removed,
                orchestrator.cache_root().display()
            );
        }
    }

    Ok(())
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_ensure(
    orchestrator: &DatabaseOrchestrator,
    board: &str,
    tier: &str,
    username: Option<String>,
    password_env: Option<String>,
) -> Result<()> {
    let tier: CapabilityTier = tier.parse()?;
    let credentials = credentials(username, password_env)?;
    let cancel = cancel_on_interrupt();

    match orchestrator
        .ensure_with_cancel(board, tier, &credentials, &cancel)
        .await
    {
        Ok(database) => {
            info!(board = %database.board, source = ?database.source, "Database ready");
            println!("{}", serde_json::to_string_pretty(&database)?);
            Ok(())
        }
        Err(err) => {
            report(&err);
            Err(err.into())
        }
    }
}

fn credentials(username: Option<String>, password_env: Option<String>) -> Result<Credentials> {
    let password = match password_env {
        Some(var) => Some(
            std::env::var(&var).with_context(|| format!("Password variable {} is not set", var))?,
        ),
        None => None,
    };
    Ok(Credentials::from_parts(username, password))
}

/// Token that fires on Ctrl-C
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling build");
            on_interrupt.cancel();
        }
    });
    cancel
}

fn report(err: &CoreError) {
    if let Some(diagnostic) = err.diagnostic() {
        let output = diagnostic.render_truncated(DIAGNOSTIC_LIMIT);
        if !output.is_empty() {
            eprintln!("--- boardlib output ---\n{}\n---", output);
        }
    }
    if let Some(suggestion) = err.suggestion() {
        eprintln!("hint: {}", suggestion);
    }
}

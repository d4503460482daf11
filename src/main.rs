//! Hatrac -- hierarchical object store with referentially stable
//! versioned names.
//!
//! `hatrac deploy <admin-role>` initializes the directory schema and
//! root ACLs; `hatrac serve` runs the HTTP service. Startup is
//! idempotent: schema creation re-runs harmlessly on every launch.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use hatrac::authn::TrustedHeaderProvider;
use hatrac::config::{load_config, Config};
use hatrac::directory::sqlite::SqliteDirectory;
use hatrac::name::SegmentClass;
use hatrac::storage::build_storage;

/// Command-line arguments for the hatrac server.
#[derive(Parser, Debug)]
#[command(name = "hatrac", version, about = "Hierarchical object store")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "hatrac.conf.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service.
    Serve {
        /// Override the bind address (host:port).
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Initialize the directory schema and root ACLs.
    Deploy {
        /// Role(s) granted ownership of the root namespace.
        #[arg(required = true)]
        admin_roles: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from {}", cli.config);
    let config = load_config(&cli.config)?;

    // Ensure the parent directory for the SQLite file exists.
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let directory = Arc::new(SqliteDirectory::open(
        &config.database_path,
        config.database_max_retries,
    )?);
    info!("Directory opened at {}", config.database_path);

    match cli.command {
        Commands::Deploy { admin_roles } => {
            directory.deploy(&admin_roles)?;
            info!("Deployed root namespace owned by {:?}", admin_roles);
            Ok(())
        }
        Commands::Serve { bind } => serve(config, directory, bind).await,
    }
}

async fn serve(
    config: Config,
    directory: Arc<SqliteDirectory>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    let bind_addr =
        bind.unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    let storage = build_storage(&config).await?;

    let class = SegmentClass::parse(&config.allowed_url_char_class)
        .map_err(|e| anyhow::anyhow!("invalid allowed_url_char_class: {e}"))?;

    let state = Arc::new(hatrac::AppState {
        config: config.clone(),
        class,
        directory,
        storage,
        authn: Arc::new(TrustedHeaderProvider::new()),
    });

    let app = hatrac::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(
        "Hatrac listening on {} under {}",
        bind_addr, config.service_prefix
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Hatrac shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}

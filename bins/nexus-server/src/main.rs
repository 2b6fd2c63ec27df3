use anyhow::{bail, Context, Result};
use nexus_auth::core::{AuthConfig, AuthCore};
use nexus_auth::{MemoryLoginThrottle, MemorySessionStore, NoCaptcha};
use nexus_remote::{
    BatchExecutor, Dialer, MemoryTaskStore, SqliteBatchStore, TransferOrchestrator,
};
use nexus_types::{EventBus, TransferTask};
use nexus_vault::{MasterKey, SqliteConnectionStore, Vault};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Config {
    database_url: String,
    rp_id: String,
    rp_origin: String,
    allowed_origins: Vec<String>,
}

impl Config {
    /// Read and validate the environment. Missing required variables
    /// are fatal before anything else starts.
    fn from_env() -> Result<Self> {
        if std::env::var("SESSION_SECRET").map(|v| v.is_empty()).unwrap_or(true) {
            bail!("SESSION_SECRET must be set");
        }

        let database_url = std::env::var("NEXUS_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite::memory:".to_string());
        let rp_id = std::env::var("NEXUS_RP_ID").unwrap_or_else(|_| "localhost".to_string());
        let rp_origin = std::env::var("NEXUS_RP_ORIGIN")
            .unwrap_or_else(|_| "http://localhost".to_string());
        let allowed_origins = std::env::var("NEXUS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            database_url,
            rp_id,
            rp_origin,
            allowed_origins,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("nexus-server {VERSION}");
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("nexus-server {VERSION}");
        println!("Remote-operations control plane\n");
        println!("USAGE: nexus-server [OPTIONS]\n");
        println!("OPTIONS:");
        println!("  -h, --help       Print help");
        println!("  -V, --version    Print version");
        println!("\nENVIRONMENT:");
        println!("  SESSION_SECRET         Cookie-signing secret (required)");
        println!("  NEXUS_MASTER_KEY       32-byte hex vault master key (required)");
        println!("  NEXUS_DATABASE_URL     SQLite URL (default: sqlite::memory:)");
        println!("  NEXUS_RP_ID            WebAuthn relying-party id");
        println!("  NEXUS_RP_ORIGIN        WebAuthn relying-party origin");
        println!("  NEXUS_ALLOWED_ORIGINS  Comma-separated WebSocket origins");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("nexus-server v{VERSION} starting");

    let config = Config::from_env()?;
    let master_key =
        MasterKey::from_env("NEXUS_MASTER_KEY").context("master encryption key")?;

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("database initialization failed")?;
    SqliteConnectionStore::init_schema(&pool).await?;
    nexus_auth::store::init_schema(&pool).await?;
    SqliteBatchStore::init_schema(&pool).await?;

    let batch_store = Arc::new(SqliteBatchStore::new(pool.clone()));
    let interrupted = batch_store.recover_interrupted().await?;
    if interrupted > 0 {
        tracing::warn!("marked {interrupted} in-flight batch sub-tasks as interrupted");
    }

    let bus = Arc::new(EventBus::new());
    // Audit and notification sinks subscribe here; the default build
    // mirrors domain events into the server log.
    bus.subscribe(|event| {
        let line = serde_json::to_string(event).unwrap_or_default();
        tracing::info!(target: "nexus::events", "{line}");
    });

    let vault = Arc::new(Vault::new(
        master_key,
        Arc::new(SqliteConnectionStore::new(pool.clone())),
    ));

    let auth = AuthCore::new(
        Arc::new(nexus_auth::SqliteUserStore::new(pool.clone())),
        Arc::new(nexus_auth::SqlitePasskeyStore::new(pool.clone())),
        Arc::new(MemorySessionStore::new()),
        Arc::new(MemoryLoginThrottle::default()),
        Arc::new(NoCaptcha),
        bus.clone(),
        AuthConfig {
            rp_id: config.rp_id.clone(),
            rp_origin: config.rp_origin.clone(),
            rp_name: "Nexus".into(),
            ..AuthConfig::default()
        },
    )?;

    let batch = Arc::new(BatchExecutor::new(
        vault.clone(),
        Dialer::default(),
        batch_store,
        bus.clone(),
    ));
    let transfers = Arc::new(TransferOrchestrator::new(
        vault,
        Dialer::default(),
        Arc::new(MemoryTaskStore::<TransferTask>::new()),
        bus,
    ));

    tracing::info!(
        rp_id = %config.rp_id,
        allowed_origins = config.allowed_origins.len(),
        "control plane ready"
    );

    // The HTTP front-end consumes these handles; it lives outside
    // this crate. Hold them until the process is signalled.
    let _control_plane = (auth, batch, transfers);
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("nexus-server shutting down");
    Ok(())
}

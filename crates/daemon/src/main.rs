use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use coffer_daemon::ciphertext::{CiphertextCache, FileStorage, PeerFetcher, PermanentStorage, S3Storage, Zone};
use coffer_daemon::database::{MemoryObjectStore, ObjectStore};
use coffer_daemon::events::connect_bus;
use coffer_daemon::http_server;
use coffer_daemon::process::spawn_workers;
use coffer_daemon::service_config::StorageConfig;
use coffer_daemon::{Config, ServiceState};
use common::auth::{AccessControl, FakeAccessControl};
use common::crypto::MasterKey;

#[derive(Debug, Parser)]
#[command(name = "cofferd", about = "Classification-gated encrypted object storage service")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level filter, e.g. "info" or "coffer_daemon=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = Config::load(args.config.as_deref())?;
    let master = MasterKey::new(config.master_key.clone())?;

    let permanent: Option<Arc<dyn PermanentStorage>> = match &config.storage {
        StorageConfig::None => None,
        StorageConfig::S3 { bucket } => Some(Arc::new(S3Storage::connect(bucket.clone()).await)),
        StorageConfig::File { root } => Some(Arc::new(FileStorage::new(root.clone()))),
    };

    let peers = Arc::new(PeerFetcher::new(
        config.peers.urls.clone(),
        config.peers.signifier.clone(),
        config.peers.enabled,
    ));

    let cache = CiphertextCache::open(
        Zone::new(config.cache.zone.clone()),
        &config.cache,
        permanent,
        Some(Arc::clone(&peers)),
        &master,
    )
    .await?;

    let bus = connect_bus(config.audit.nats_url.as_deref(), &config.audit.subject).await;

    // The external authorization service is wired behind the AccessControl
    // trait; the builtin fake keeps a single node usable on its own.
    let access: Arc<dyn AccessControl> = Arc::new(FakeAccessControl::new());
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());

    let state = ServiceState::new(config, store, access, bus, cache, master);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let workers = spawn_workers(state.clone(), shutdown_rx.clone());

    let server = tokio::spawn(http_server::run(state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    if let Ok(result) = server.await {
        result?;
    }
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

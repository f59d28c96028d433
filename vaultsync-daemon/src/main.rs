mod config;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::DaemonConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vaultsync_core::session::{StoredAddressKey, ADDRESS_KEY_SLOT, SESSION_SLOT};
use vaultsync_core::sync::{Connectivity, PassResult, SyncDependencies};
use vaultsync_core::{
    HttpRemoteApi, ItemCryptoCodec, KeyHierarchyManager, KeyringSecretStore, LocalCache,
    RemoteSyncClient, SecretStore, SessionMonitor, SessionState, SqliteItemStore,
    StaticUserKeyring, SymmetricKeyProvider, SyncEvent, SyncReconciler, TypedSecret,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "vaultsync-daemon", version, about = "Keeps the local vault cache in sync")]
struct Args {
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server base URL, overriding the configuration file
    #[arg(long)]
    api_url: Option<String>,

    /// Local cache database, overriding the configuration file
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Run one pass of every vault and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(vaultsync_core::platform::get_default_config_path);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(api_url) = args.api_url {
        config.api_url = api_url;
    }
    if let Some(cache) = args.cache {
        config.cache_path = Some(cache);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting VaultSync Daemon v{}", VERSION);
    config.validate()?;

    let secrets: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::new(config.keyring_service.clone()));
    let session = Arc::new(SessionMonitor::load(TypedSecret::new(secrets.clone(), SESSION_SLOT)).await?);
    if session.state() == SessionState::Invalidated {
        error!("No stored session. Sign in with a VaultSync client first.");
        return Ok(());
    }

    let address = TypedSecret::<StoredAddressKey>::new(secrets.clone(), ADDRESS_KEY_SLOT)
        .load()
        .await?
        .ok_or_else(|| anyhow!("no address key in keyring service {}", config.keyring_service))?
        .to_key()?;
    let keyring = Arc::new(StaticUserKeyring::new(vec![address]));

    let api = Arc::new(HttpRemoteApi::new(
        &config.api_url,
        session.clone(),
        config.sync.request_timeout(),
    )?);
    let remote = Arc::new(RemoteSyncClient::new(api, &config.sync).with_session(session.clone()));
    let keys = Arc::new(KeyHierarchyManager::new(remote.clone(), keyring));
    let device_key = Arc::new(SymmetricKeyProvider::new(secrets.clone()));

    let cache_path = config.cache_path();
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteItemStore::open(&cache_path)?);
    let cache = LocalCache::sqlite(store, Arc::new(ItemCryptoCodec::new(device_key.clone())));
    info!("Local cache at {:?}", cache_path);

    // a daemon has no platform reachability feed; it stays online and foregrounded
    let (_connectivity, connectivity_rx) = watch::channel(Connectivity::ONLINE);
    let reconciler = SyncReconciler::new(
        config.sync.clone(),
        SyncDependencies {
            remote,
            keys,
            cache,
            device_key,
            session,
            connectivity: connectivity_rx,
        },
    );

    if args.once {
        for (share_id, result) in reconciler.sync_now().await? {
            match result {
                PassResult::Synced {
                    changed,
                    conflicts,
                    rejected,
                } => info!(
                    share_id = %share_id,
                    changed,
                    conflicts = conflicts.len(),
                    rejected = rejected.len(),
                    "Synced"
                ),
                other => warn!(share_id = %share_id, result = ?other, "Not synced"),
            }
        }
        return Ok(());
    }

    let mut events = reconciler.subscribe();
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    reconciler.start();
    info!("Daemon ready. Press Ctrl+C to exit.");

    signal::ctrl_c().await?;
    info!("Shutting down");
    reconciler.stop();
    event_log.abort();
    Ok(())
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::PassFailed { share_id, error } => {
            warn!(share_id = %share_id, %error, "Sync pass failed")
        }
        SyncEvent::RevisionConflict(report) => warn!(
            share_id = %report.share_id,
            item_id = %report.item_id,
            held = report.held,
            "Revision conflict"
        ),
        SyncEvent::ChangeRejected(change) => warn!(
            share_id = %change.share_id,
            item_id = %change.item_id,
            change = %change.change,
            reason = %change.reason,
            held = change.held,
            "Local change rejected"
        ),
        SyncEvent::ItemUnavailable { share_id, item_id, reason } => {
            warn!(share_id = %share_id, item_id = %item_id, %reason, "Item unavailable")
        }
        SyncEvent::Resync { missed } => warn!(missed, "Event log fell behind"),
        other => match serde_json::to_string(other) {
            Ok(json) => tracing::debug!(event = %json, "Sync event"),
            Err(e) => tracing::debug!(error = %e, "Unserializable sync event"),
        },
    }
}

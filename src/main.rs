use std::sync::Arc;

use dotenv::dotenv;
use log::{error, info};
use prometheus_client::registry::Registry;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use oseg_lib::cli::{parse_args, StoreBackend};
use oseg_lib::config::Config;
use oseg_lib::segmentation::{ObjectSegmentation, OsegSettings};
use oseg_lib::server;
use oseg_lib::server::monitoring::{OsegMetrics, OSEG_METRICS};
use oseg_lib::store::craq::{CraqStore, CraqStoreConfig};
use oseg_lib::store::redis::RedisStore;
use oseg_lib::store::DirectoryStore;
use oseg_lib::types::{
    Entry, LookupListener, MigrateAck, ObjectId, ServerMessageRouter, WriteListener, WriteStatus,
};

/// Stand-in listeners until the space server's transport layer is wired in:
/// terminal outcomes are only logged.
struct LogListener;

impl LookupListener for LogListener {
    fn oseg_lookup_completed(&self, id: ObjectId, entry: Option<Entry>) {
        match entry {
            Some(entry) => info!("lookup completed: {} is on server {}", id, entry.server),
            None => info!("lookup completed: {} unresolved", id),
        }
    }
}

impl WriteListener for LogListener {
    fn oseg_add_new_finished(&self, id: ObjectId, status: WriteStatus) {
        info!("registration finished for {}: {:?}", id, status);
    }

    fn oseg_migration_acknowledged(&self, id: ObjectId) {
        info!("migration acknowledged for {}; connection may be dropped", id);
    }
}

impl ServerMessageRouter for LogListener {
    fn try_route(&self, ack: &MigrateAck) -> bool {
        info!(
            "routing migrate-ack for {} to server {}",
            ack.object_id, ack.to_server
        );
        true
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();
    let args = parse_args();

    let mut config = Config::from_env().expect("Config incorrectly specified");
    if let Some(server_id) = args.server_id {
        config.server_id = server_id;
    }
    info!("Starting directory node for server {}", config.server_id);

    let shutdown_token = CancellationToken::new();

    let store: Arc<dyn DirectoryStore> = match args.backend {
        StoreBackend::Craq => Arc::new(CraqStore::new(
            CraqStoreConfig::new(config.craq_get_addrs.clone(), config.craq_set_addr.clone()),
            shutdown_token.clone(),
        )),
        StoreBackend::Redis => {
            Arc::new(RedisStore::new(&config.redis_url).expect("Could not build Redis pool"))
        }
    };

    let mut registry = Registry::default();
    let metrics = OsegMetrics::register(&mut registry);
    let _ = OSEG_METRICS.set(metrics);

    let mut settings = OsegSettings::for_server(config.server_id);
    settings.key_prefix = config.key_prefix;
    settings.cache_capacity = config.cache_capacity;
    settings.not_found_sit_out = config.not_found_sit_out;

    let listener = Arc::new(LogListener);
    let oseg = ObjectSegmentation::new(
        settings,
        store,
        listener.clone(),
        listener.clone(),
        listener,
        shutdown_token.clone(),
    );

    let health_addr = config
        .health_addr
        .parse()
        .expect("Invalid OSEG_HEALTH_ADDR");
    let app = server::build_router(Arc::new(registry));
    let server_handle = tokio::spawn(async move {
        if let Err(err) = axum::Server::bind(&health_addr)
            .serve(app.into_make_service())
            .await
        {
            error!("health server failed: {}", err);
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down.");
        }
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down.");
        }
    }

    // Trigger the shutdown: every directory operation becomes a no-op and
    // in-flight store completions are discarded. The store connections share
    // the same token.
    oseg.stop();
    server_handle.abort();
    info!(
        "Stopped with {} lookups still queued for dispatch",
        oseg.get_pushback()
    );
}

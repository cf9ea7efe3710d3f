//! Process bootstrap: store, broker session, topology, relay loop.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{AmqpSession, BrokerChannel, TopologyManager};
use crate::config::Config;
use crate::core::error::StartupError;
use crate::core::shutdown;
use crate::relay::{Relay, StatsSnapshot};
use crate::store::seed::seed_samples;
use crate::store::{RecordStore, SqliteRecordStore};
use crate::util::netif::discover_broker_host;

/// Open the record store named in `config`, seeding it when configured.
pub fn open_store(config: &Config) -> Result<Arc<dyn RecordStore>, StartupError> {
    let store = SqliteRecordStore::open(&config.database_path)?;
    if config.seed_on_startup {
        seed_samples(&store)?;
    }
    Ok(Arc::new(store))
}

/// Insert the sample records and report how many were new.
pub fn seed(config: &Config) -> anyhow::Result<usize> {
    let store = SqliteRecordStore::open(&config.database_path).map_err(StartupError::from)?;
    let inserted = seed_samples(&store)?;
    info!(
        inserted,
        total = store.count()?,
        path = %config.database_path.display(),
        "seeding finished"
    );
    Ok(inserted)
}

/// Configured broker host, or the discovered LAN address.
pub fn broker_host(config: &Config) -> String {
    match &config.broker_host {
        Some(host) => host.clone(),
        None => discover_broker_host().to_string(),
    }
}

/// Ensure topology, then relay until `shutdown` fires.
///
/// The channel is closed on every exit path: clean stop, topology failure or
/// a broken delivery stream.
pub async fn serve(
    channel: Arc<dyn BrokerChannel>,
    store: Arc<dyn RecordStore>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<StatsSnapshot> {
    let result = serve_inner(Arc::clone(&channel), store, config, shutdown).await;

    if let Err(e) = channel.close().await {
        warn!("closing broker channel failed: {e}");
    }
    result
}

async fn serve_inner(
    channel: Arc<dyn BrokerChannel>,
    store: Arc<dyn RecordStore>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<StatsSnapshot> {
    TopologyManager::new(config.topology_config())
        .ensure(channel.as_ref())
        .await
        .map_err(StartupError::Topology)?;

    let relay = Relay::new(channel, store, config.relay_config());
    let snapshot = relay.run(shutdown).await?;
    Ok(snapshot)
}

/// Full daemon: store, AMQP connection, topology, relay, signal handling.
pub async fn run(config: Config) -> anyhow::Result<StatsSnapshot> {
    let store = open_store(&config)?;

    let host = broker_host(&config);
    info!(%host, port = config.broker_port, "connecting to broker");
    let session = AmqpSession::connect(&config.amqp_uri(&host), config.prefetch)
        .await
        .map_err(StartupError::Connect)?;
    let channel: Arc<dyn BrokerChannel> = Arc::new(session);

    let (tx, rx) = shutdown::channel();
    let listener = shutdown::spawn_signal_listener(tx);

    let result = serve(channel, store, &config, rx).await;
    listener.abort();

    match &result {
        Ok(snapshot) => info!(%snapshot, "relay shut down cleanly"),
        Err(e) => error!("relay stopped with error: {e:#}"),
    }
    result
}

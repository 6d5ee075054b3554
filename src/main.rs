//! labeld daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

mod config;
mod error;
mod labels;
mod logging;
mod orchestrator;
mod runtime;
mod sinks;
mod types;
mod watcher;

use config::{Config, ConfigFile};
use orchestrator::{Orchestrator, Pipeline, CHANNEL_CAPACITY};
use runtime::DockerConnector;
use sinks::{CacheSync, DnsBatcher, HickoryResolver, NsUpdate, RedisStore, Webhook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    // Redis TLS and the webhook client share the ring provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cfg = Config::load()?;
    cfg.validate()?;
    info!(
        "Starting labeld: {} nodes, poll every {}s, ping every {}s",
        cfg.nodes.len(),
        cfg.poll.interval,
        cfg.ping.interval
    );

    let store = RedisStore::connect(&cfg.cache.url).await?;
    let cache = CacheSync::new(Arc::new(store), cfg.cache_ttl());

    let dns_timeout = Duration::from_secs(cfg.rfc2136.timeout);
    let dns = DnsBatcher::new(
        Arc::new(HickoryResolver::new(dns_timeout)),
        Arc::new(NsUpdate::new(cfg.rfc2136.nsupdate.clone(), dns_timeout)),
        cfg.rfc2136.verify,
    );

    let webhook = match &cfg.webhook {
        Some(hook) => {
            info!("Webhook notifications enabled");
            Some(Webhook::new(hook)?)
        }
        None => None,
    };

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut orchestrator = Orchestrator::new(
        Arc::new(DockerConnector),
        Box::new(ConfigFile::from_env()),
        tx,
        cfg.supervisor_interval(),
        cfg.reload_interval(),
    );
    orchestrator.apply_nodes(cfg.node_list());

    let pipeline = Pipeline::new(dns, cache, webhook);
    let handle = tokio::spawn(async move {
        if let Err(e) = orchestrator.run(pipeline, rx).await {
            error!("Orchestrator failed: {}", e);
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    handle.abort();
    info!("Shutdown complete.");
    Ok(())
}

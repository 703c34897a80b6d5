//! Computing provider agent
//!
//! Accepts proof tasks and space deployments from the hub, places them on
//! the cluster and reports results back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cp_placement::FirstFit;
use cp_provider::{
    api,
    chain::{FileKeystore, HttpChainGateway},
    cluster::{InMemoryCluster, InMemoryImageBuilder},
    config::Config,
    dispatcher::{DispatcherSettings, UbiDispatcher},
    pipeline::{ExpiryWorker, ExpiryWorkerConfig, PipelineConfig, RollbackConfig, SpacePipeline},
    proof::{ProofJobConfig, ProofJobRunner},
    reporter::{StatusReporter, STATUS_QUEUE_CAPACITY},
    reward::RewardClient,
    state::{AppState, NodeInfo},
    store::{MemoryStore, RecordStore, SqliteStore, TaskStore},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CP_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(node_id = %config.node_id, "Starting computing provider");
    info!(listen_addr = %config.listen_addr, multi_address = %config.multi_address, "Configuration loaded");

    let records: Arc<dyn RecordStore> = match &config.db_path {
        Some(path) => {
            let store = SqliteStore::open(path).with_context(|| format!("open record store {}", path.display()))?;
            info!(path = %path.display(), "Record store opened");
            Arc::new(store)
        }
        None => {
            warn!("CP_DB_PATH unset, task records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let store = TaskStore::new(records);

    let nodes = config.load_nodes()?;
    match &config.nodes_file {
        Some(path) if !nodes.is_empty() => {
            info!(path = %path.display(), nodes = nodes.len(), "Node inventory loaded");
        }
        Some(path) => warn!(path = %path.display(), "Node inventory is empty, no task can be placed"),
        None => warn!("CP_NODES unset, cluster has no nodes and no task can be placed"),
    }
    let cluster = Arc::new(InMemoryCluster::with_nodes(nodes));
    let builder = Arc::new(InMemoryImageBuilder::new());
    let strategy = Arc::new(FirstFit);

    let mut dispatcher = UbiDispatcher::new(
        DispatcherSettings {
            node_id: config.node_id.clone(),
            engine_address: config.engine_address.clone(),
            callback_url: config.callback_url(),
            repo_path: config.cp_path.clone(),
        },
        store.clone(),
        cluster.clone(),
        Arc::new(HttpChainGateway::new(&config.chain_gateway_url)?),
        Arc::new(FileKeystore::new(&config.keystore_dir)),
        strategy.clone(),
    );
    if let Some(url) = &config.reward_url {
        dispatcher = dispatcher.with_rewards(RewardClient::new(url)?);
    }

    let (status, reporter) = StatusReporter::channel(config.status_hub_url.clone(), STATUS_QUEUE_CAPACITY);

    let pipeline = SpacePipeline::new(
        PipelineConfig {
            node_id: config.node_id.clone(),
            multi_address: config.multi_address.clone(),
            domain: config.domain.clone(),
            hub_address: config.hub_address.clone(),
            verify_sign: config.verify_sign,
            data_dir: config.data_dir.clone(),
            inference_image: config.inference_image.clone(),
            rollback: RollbackConfig::default(),
        },
        store,
        cluster.clone(),
        builder,
        strategy,
        status,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reporter_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reporter.run(shutdown_rx).await;
        }
    });

    let expiry_worker = ExpiryWorker::new(pipeline.clone(), ExpiryWorkerConfig::default());
    let expiry_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            expiry_worker.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(
        NodeInfo {
            node_id: config.node_id.clone(),
            multi_address: config.multi_address.clone(),
            ubi_task: config.ubi_task,
        },
        cluster.clone(),
        dispatcher,
        pipeline,
        ProofJobRunner::new(cluster, ProofJobConfig::default()),
    );
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reporter_handle).await {
        warn!(error = %e, "Status reporter did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, expiry_handle).await {
        warn!(error = %e, "Expiry worker did not shut down in time");
    }

    info!("Computing provider shutdown complete");
    Ok(())
}

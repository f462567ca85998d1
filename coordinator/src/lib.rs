//! Binary-crate wiring: builds the concrete `KvStore`/`OrchestratorClient`
//! adapters from [`CoordinatorConfig`], assembles a [`TaskQueueManager`], and
//! spawns every long-lived loop the core and autoscaling plane define, each
//! gated by the same cooperative shutdown signal.

use std::sync::Arc;

use anyhow::{Context, Result};
use config_manager::CoordinatorConfig;
use coordinator_metrics::CoordinatorMetrics;
use kube::core::GroupVersionKind;
use orchestrator::{K8sOrchestratorClient, OrchestratorClient};
use store::{KvStore, RedisStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use workflow_coordinator::message_bus::{InProcessMessageBus, MessageBus};
use workflow_coordinator::resource_allocator::run_resource_metrics_loop;
use workflow_coordinator::types::Priority;
use workflow_coordinator::TaskQueueManager;

/// Everything a running coordinator process needs: the assembled decision
/// engine plus the adapters it was built from, so the binary can also expose
/// one-shot CLI operations (submit/status/cancel) against the same state.
pub struct CoordinatorApp {
    pub config: CoordinatorConfig,
    pub store: Arc<dyn KvStore>,
    pub orchestrator: Arc<dyn OrchestratorClient>,
    pub metrics: Arc<CoordinatorMetrics>,
    pub manager: Arc<TaskQueueManager>,
}

/// Connect to the configured store and cluster orchestrator and assemble the
/// task queue manager. Fails fast if either backend is unreachable at
/// startup; once connected, `RedisStore`'s `ConnectionManager` and `kube`'s
/// client both reconnect transparently on transient drops.
pub async fn build(config: CoordinatorConfig) -> Result<CoordinatorApp> {
    let store: Arc<dyn KvStore> = Arc::new(
        RedisStore::connect(&config.store_url)
            .await
            .map_err(|e| anyhow::anyhow!("connect to store at {}: {e}", config.store_url))?,
    );

    let kube_client = kube::Client::try_default()
        .await
        .context("build Kubernetes client from the ambient kubeconfig")?;
    let gvk = GroupVersionKind::gvk(&config.workflow_gvk.group, &config.workflow_gvk.version, &config.workflow_gvk.kind);
    let orchestrator: Arc<dyn OrchestratorClient> =
        Arc::new(K8sOrchestratorClient::new(kube_client, config.namespace.clone(), gvk));

    let metrics = Arc::new(CoordinatorMetrics::new().context("register coordinator metrics")?);
    let bus: Arc<dyn MessageBus> = Arc::new(InProcessMessageBus::default());

    let manager = Arc::new(TaskQueueManager::new(store.clone(), orchestrator.clone(), metrics.clone(), bus, config.clone()));

    Ok(CoordinatorApp { config, store, orchestrator, metrics, manager })
}

/// Spawn every background loop the spec describes (§4.6, §4.7, §4.5),
/// returning their join handles so the caller can await them after signalling
/// shutdown. Every loop shares one `watch<bool>` shutdown signal and exits
/// within one tick of it flipping (§9).
pub fn spawn_background_loops(app: &CoordinatorApp, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for priority in Priority::ALL {
        let manager = app.manager.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            info!(priority = priority.as_str(), "starting scheduling loop");
            manager.run_priority_loop(priority, shutdown).await;
        }));
    }

    handles.push(tokio::spawn(app.manager.clone().run_cleanup_loop(shutdown.clone())));
    handles.push(tokio::spawn(app.manager.clone().run_workflow_event_loop(shutdown.clone())));

    handles.push(tokio::spawn(run_resource_metrics_loop(
        app.store.clone(),
        app.orchestrator.clone(),
        app.metrics.clone(),
        shutdown.clone(),
    )));

    handles.push(tokio::spawn(autoscaler::run_dependency_loop(
        app.store.clone(),
        app.orchestrator.clone(),
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(autoscaler::run_predictive_generate_loop(
        app.store.clone(),
        app.orchestrator.clone(),
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(autoscaler::run_predictive_apply_loop(
        app.store.clone(),
        app.orchestrator.clone(),
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(autoscaler::run_event_observer_loop(
        app.store.clone(),
        app.orchestrator.clone(),
        shutdown,
    )));

    handles
}

/// Run every background loop until `ctrl_c`, then signal shutdown and wait
/// for all loops to exit.
pub async fn serve(app: CoordinatorApp) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_background_loops(&app, shutdown_rx);

    info!("coordinator running, press Ctrl+C to shut down");
    tokio::signal::ctrl_c().await.context("listen for shutdown signal")?;
    info!("shutdown signal received, stopping background loops");

    shutdown_tx.send(true).ok();
    for handle in handles {
        let _ = handle.await;
    }
    info!("all background loops stopped");
    Ok(())
}

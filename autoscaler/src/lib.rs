//! Autoscaling plane (§4.7): three independent periodic loops layered on
//! top of the orchestrator's horizontal autoscaler objects -- a dependency
//! loop that keeps one service's floor proportional to another's replica
//! count, a predictive loop that learns load patterns and pre-scales ahead
//! of them, and a scaling-event observer that logs what actually happened
//! for later effectiveness analysis.
//!
//! Each loop is a free function over `&dyn KvStore` / `&dyn OrchestratorClient`
//! so it can be driven directly in tests; the `run_*_loop` wrappers here are
//! the `tokio::spawn`-able long-lived tasks the `coordinator` binary spawns,
//! each gated by the same cooperative-shutdown `watch<bool>` signal the task
//! queue manager uses.

pub mod dependency;
pub mod event_observer;
pub mod predictive;
pub mod storage;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use orchestrator::OrchestratorClient;
use store::KvStore;
use tokio::sync::watch;
use tracing::{error, info};

const DEPENDENCY_TICK: Duration = Duration::from_secs(60);
const PREDICTIVE_GENERATE_TICK: Duration = Duration::from_secs(3600);
const PREDICTIVE_APPLY_TICK: Duration = Duration::from_secs(300);
const EVENT_OBSERVER_TICK: Duration = Duration::from_secs(30);

/// Long-lived dependency-scaling loop: every 60 s, propagate each enabled
/// [`types::ScalingDependency`] from its source to its target.
pub async fn run_dependency_loop(
    store: Arc<dyn KvStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(DEPENDENCY_TICK);
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => continue,
            _ = ticker.tick() => {
                if let Err(err) = dependency::run_dependency_tick(store.as_ref(), orchestrator.as_ref()).await {
                    error!(%err, "dependency scaling tick failed");
                }
            }
        }
    }
}

/// Long-lived predictive-generation loop: hourly, emit a prediction for
/// every load pattern with a matching window.
pub async fn run_predictive_generate_loop(
    store: Arc<dyn KvStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PREDICTIVE_GENERATE_TICK);
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => continue,
            _ = ticker.tick() => {
                match predictive::run_predictive_tick(store.as_ref(), orchestrator.as_ref(), chrono::Utc::now()).await {
                    Ok(predictions) => info!(count = predictions.len(), "predictive generation tick complete"),
                    Err(err) => error!(%err, "predictive generation tick failed"),
                }
            }
        }
    }
}

/// Long-lived predictive-apply loop: every 5 minutes, apply pending
/// predictions whose confidence clears the threshold.
pub async fn run_predictive_apply_loop(
    store: Arc<dyn KvStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PREDICTIVE_APPLY_TICK);
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => continue,
            _ = ticker.tick() => {
                match predictive::run_apply_tick(store.as_ref(), orchestrator.as_ref()).await {
                    Ok(applied) => info!(applied, "predictive apply tick complete"),
                    Err(err) => error!(%err, "predictive apply tick failed"),
                }
            }
        }
    }
}

/// Long-lived scaling-event observer loop: every 30 s, classify and log
/// what each autoscaler just did.
pub async fn run_event_observer_loop(
    store: Arc<dyn KvStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(EVENT_OBSERVER_TICK);
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => continue,
            _ = ticker.tick() => {
                match event_observer::run_observer_tick(store.as_ref(), orchestrator.as_ref(), chrono::Utc::now()).await {
                    Ok(logged) => info!(count = logged.len(), "scaling-event observer tick complete"),
                    Err(err) => error!(%err, "scaling-event observer tick failed"),
                }
            }
        }
    }
}

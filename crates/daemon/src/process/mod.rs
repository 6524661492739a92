//! Long-lived background workers
//!
//! The drainer, the eviction walker, and the upstream keepalive probe are
//! independent loops with explicit shutdown signals, not request-scoped
//! tasks. Each loop owns its own cadence and survives individual failures.

use std::time::Duration;

use common::acm::AcmDocument;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state::ServiceState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the worker loops. Each terminates when the shutdown signal fires.
pub fn spawn_workers(
    state: ServiceState,
    shutdown_rx: watch::Receiver<()>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(drain_loop(state.clone(), shutdown_rx.clone())),
        tokio::spawn(evict_loop(state.clone(), shutdown_rx.clone())),
        tokio::spawn(keepalive_loop(state, shutdown_rx)),
    ]
}

/// Move `.uploaded` files to durable storage so the instance is disposable.
/// Picks up files left behind by a reboot as well as fresh uploads whose
/// opportunistic drain failed.
async fn drain_loop(state: ServiceState, mut shutdown_rx: watch::Receiver<()>) {
    let cache = std::sync::Arc::clone(state.cache());
    loop {
        let drained = cache.drain_once().await;
        if drained > 0 {
            tracing::info!(drained, "drained uploads to durable storage");
        }
        tokio::select! {
            _ = tokio::time::sleep(cache.walk_sleep) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Evict cold `.cached` files once usage crosses the configured watermarks
async fn evict_loop(state: ServiceState, mut shutdown_rx: watch::Receiver<()>) {
    let cache = std::sync::Arc::clone(state.cache());
    loop {
        match cache.evict_once().await {
            Ok(evicted) if evicted > 0 => {
                tracing::info!(evicted, "cache eviction pass complete");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cache eviction pass failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(cache.walk_sleep) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Probe the authorization service with a known-valid ACM every thirty
/// seconds; on failure, nudge the event bus to reconnect as well since both
/// ride the same network partition in practice.
async fn keepalive_loop(state: ServiceState, mut shutdown_rx: watch::Receiver<()>) {
    let probe = AcmDocument::parse(r#"{"classif":"U"}"#).expect("static probe acm parses");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
            _ = shutdown_rx.changed() => return,
        }
        if let Err(e) = state.access().flatten_acm(&probe).await {
            tracing::warn!(error = %e, "authorization service keepalive probe failed");
            if let Err(e) = state.bus().reconnect().await {
                tracing::warn!(error = %e, "event bus reconnect failed");
            }
        }
    }
}

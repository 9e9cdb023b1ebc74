//! Periodic background work: webhook redelivery, dunning, GL redelivery,
//! nightly aging recompute, and reconciliation. Each loop ticks on its own
//! interval, carries a per-run deadline sized to the tick, and observes the
//! shutdown signal between runs so the process can drain cleanly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use remit_retry::RunBudget;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::AppState;

pub const WEBHOOK_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const GL_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const DUNNING_INTERVAL: Duration = Duration::from_secs(3_600);
pub const AGING_INTERVAL: Duration = Duration::from_secs(86_400);
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(86_400);

fn budget_for(interval: Duration) -> RunBudget {
    let millis = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    RunBudget::until(Utc::now() + chrono::Duration::milliseconds(millis))
}

/// Spawns every background loop. Dropping the returned handles does not
/// stop them; signal `shutdown` and await the handles to drain.
pub fn spawn_all(state: Arc<AppState>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_loop(
            "webhook-retry",
            WEBHOOK_RETRY_INTERVAL,
            shutdown.clone(),
            state.clone(),
            |state| async move {
                match state
                    .retry_engine
                    .run(Utc::now(), budget_for(WEBHOOK_RETRY_INTERVAL))
                    .await
                {
                    Ok(stats) if stats.scanned > 0 => {
                        tracing::info!(
                            processed = stats.processed,
                            rescheduled = stats.rescheduled,
                            dead_lettered = stats.dead_lettered,
                            "webhook retry run finished"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "webhook retry run failed"),
                }
            },
        ),
        spawn_loop(
            "gl-retry",
            GL_RETRY_INTERVAL,
            shutdown.clone(),
            state.clone(),
            |state| async move {
                if let Err(err) = state
                    .billing
                    .gl()
                    .run_retries(Utc::now(), budget_for(GL_RETRY_INTERVAL))
                    .await
                {
                    tracing::error!(error = %err, "gl retry run failed");
                }
            },
        ),
        spawn_loop(
            "dunning",
            DUNNING_INTERVAL,
            shutdown.clone(),
            state.clone(),
            |state| async move {
                for tenant in state.config.tenants.keys() {
                    match state
                        .billing
                        .run_dunning(tenant, Utc::now(), budget_for(DUNNING_INTERVAL))
                        .await
                    {
                        Ok(stats) if stats.attempted > 0 || stats.suspended > 0 => {
                            tracing::info!(
                                tenant_id = %tenant,
                                attempted = stats.attempted,
                                collected = stats.collected,
                                suspended = stats.suspended,
                                "dunning run finished"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(tenant_id = %tenant, error = %err, "dunning run failed");
                        }
                    }
                }
            },
        ),
        spawn_loop(
            "aging-recompute",
            AGING_INTERVAL,
            shutdown.clone(),
            state.clone(),
            |state| async move {
                for tenant in state.config.tenants.keys() {
                    if let Err(err) = state
                        .billing
                        .run_aging_recompute(tenant, Utc::now(), budget_for(AGING_INTERVAL))
                        .await
                    {
                        tracing::error!(tenant_id = %tenant, error = %err, "aging recompute failed");
                    }
                }
            },
        ),
        spawn_loop(
            "reconciliation",
            RECONCILE_INTERVAL,
            shutdown,
            state,
            |state| async move {
                for tenant in state.config.tenants.keys() {
                    match state
                        .reconciler
                        .run_for_tenant(tenant, None, budget_for(RECONCILE_INTERVAL))
                        .await
                    {
                        Ok(run) if !run.divergences.is_empty() => {
                            tracing::warn!(
                                tenant_id = %tenant,
                                run_id = %run.id,
                                divergences = run.divergences.len(),
                                "reconciliation found divergences"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(tenant_id = %tenant, error = %err, "reconciliation failed");
                        }
                    }
                }
            },
        ),
    ]
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
    run: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<AppState>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup is quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run(state.clone()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(worker = name, "background worker stopping");
                        return;
                    }
                }
            }
        }
    })
}

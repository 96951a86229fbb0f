//! Background reconciliation jobs.
//!
//! Five independent interval loops, each spawned on the shared
//! [`TaskTracker`] and racing the shutdown token. Every loop body is a
//! standalone `run_*` function over [`App`] so tests drive single ticks
//! deterministically. A failing row is logged and skipped; one bad row never
//! stalls a sweep.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::app::App;
use crate::ledger::Transition;
use crate::timestamp::UnixTimestamp;
use crate::types::TransactionType;
use crate::verifier::VerifierError;

/// Spawns all reconciliation loops. They stop at the next tick boundary once
/// `shutdown` fires.
pub fn spawn(app: Arc<App>, tracker: &TaskTracker, shutdown: CancellationToken) {
    let rate_refresh = app.config.rate_refresh_interval_secs;
    let pending_poll = app.config.pending_poll_interval_secs;
    let distribution = app.config.distribution_sweep_interval_secs;
    let expiry = app.config.expiry_sweep_interval_secs;
    let cleanup = app.config.failed_cleanup_interval_secs;
    spawn_loop(tracker, app.clone(), shutdown.clone(), "rate_refresh", rate_refresh, |app| async move {
        run_rate_refresh(&app).await
    });
    spawn_loop(tracker, app.clone(), shutdown.clone(), "pending_poll", pending_poll, |app| async move {
        run_pending_poll(&app).await
    });
    spawn_loop(tracker, app.clone(), shutdown.clone(), "distribution_sweep", distribution, |app| async move {
        run_distribution_sweep(&app).await
    });
    spawn_loop(tracker, app.clone(), shutdown.clone(), "expiry_sweep", expiry, |app| async move {
        run_expiry_sweep(&app).await
    });
    spawn_loop(tracker, app, shutdown, "failed_cleanup", cleanup, |app| async move {
        run_failed_cleanup(&app).await
    });
}

fn spawn_loop<F, Fut>(
    tracker: &TaskTracker,
    app: Arc<App>,
    shutdown: CancellationToken,
    name: &'static str,
    interval_secs: u64,
    run: F,
) where
    F: Fn(Arc<App>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tracker.spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(job = name, "Job loop stopped");
                    break;
                }
                _ = interval.tick() => run(app.clone()).await,
            }
        }
    });
}

/// Re-fetches exchange rates into the cache so payment initiation never waits
/// on the feed.
#[instrument(skip_all)]
pub async fn run_rate_refresh(app: &App) {
    match app.rates.refresh().await {
        Ok(rates) => {
            tracing::debug!(xlm_to_usd = %rates.xlm_to_usd, usdc_to_usd = %rates.usdc_to_usd, "Exchange rates refreshed")
        }
        Err(e) => tracing::warn!(error = %e, "Exchange rate refresh failed; serving stale rates"),
    }
}

/// Re-verifies pending rows that already carry a network hash (refunds whose
/// verification was interrupted) and settles them.
#[instrument(skip_all)]
pub async fn run_pending_poll(app: &App) {
    for row in app.store.pending_with_hash() {
        let Some(hash) = row.transaction_hash.clone() else {
            continue;
        };
        match app.verifier.verify(&hash).await {
            Ok(facts) => match app.store.transition_to_confirmed(row.id, hash, &facts) {
                Ok(Transition::Applied(tx)) => {
                    tracing::info!(transaction_id = %tx.id, "Poller settled pending transaction");
                    if tx.transaction_type == TransactionType::Payment {
                        distribute(app, &tx).await;
                    }
                }
                Ok(Transition::AlreadyTerminal(_)) => {}
                Err(e) => tracing::error!(error = %e, transaction_id = %row.id, "Poller could not settle row"),
            },
            Err(VerifierError::Rejected(reason)) => {
                tracing::warn!(transaction_id = %row.id, %reason, "Poller failing rejected transaction");
                if let Err(e) = app.store.transition_to_failed(row.id) {
                    tracing::error!(error = %e, transaction_id = %row.id, "Could not fail row");
                }
            }
            Err(VerifierError::Unavailable(reason)) => {
                // Chain access is down; the whole sweep would fail the same way.
                tracing::warn!(%reason, "Verifier unavailable; deferring pending poll");
                return;
            }
        }
    }
}

/// Issues loyalty tokens for confirmed payments the confirmation path missed.
#[instrument(skip_all)]
pub async fn run_distribution_sweep(app: &App) {
    let batch = app
        .store
        .unclaimed_confirmed(app.config.distribution_batch_size);
    for row in batch {
        distribute(app, &row).await;
    }
}

/// Fails hashless pending payments whose window has lapsed.
#[instrument(skip_all)]
pub async fn run_expiry_sweep(app: &App) {
    for row in app.store.stale_pending(UnixTimestamp::now()) {
        match app.store.transition_to_failed(row.id) {
            Ok(Transition::Applied(tx)) => {
                tracing::info!(transaction_id = %tx.id, order_id = %tx.order_id, "Expired unpaid transaction")
            }
            Ok(Transition::AlreadyTerminal(_)) => {}
            Err(e) => tracing::error!(error = %e, transaction_id = %row.id, "Could not expire row"),
        }
    }
}

/// Reports failed rows past the retention window. Deletion stays a logged
/// no-op until an archival story exists for the audit trail.
#[instrument(skip_all)]
pub async fn run_failed_cleanup(app: &App) {
    let cutoff = UnixTimestamp::now().saturating_sub(app.config.failed_retention_days * 86_400);
    let expired = app.store.failed_before(cutoff);
    if expired.is_empty() {
        return;
    }
    tracing::info!(
        count = expired.len(),
        retention_days = app.config.failed_retention_days,
        "Failed transactions past retention; deletion deferred"
    );
    for row in &expired {
        tracing::debug!(transaction_id = %row.id, created_at = %row.created_at, "Would delete failed transaction");
    }
}

async fn distribute(app: &App, row: &crate::types::PaymentTransaction) {
    match app.store.claim_for_distribution(row.id) {
        Ok(true) => {
            if let Err(e) = app.loyalty.issue_for_confirmed_payment(row).await {
                tracing::error!(error = %e, transaction_id = %row.id, "Token distribution failed");
            }
        }
        Ok(false) => {}
        Err(e) => tracing::error!(error = %e, transaction_id = %row.id, "Could not claim distribution"),
    }
}

// src/jobs.rs

//! Background expiry sweeper. Lazy checks stay authoritative; this only
//! converges stored state and scores overdue attempts.

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{error::AppError, handlers::review, repository::instances, state::AppState};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Active instances past their deadline, now stored as Expired and scored.
    pub expired_active: usize,

    /// Never-started online instances of closed terms.
    pub expired_unstarted: usize,
    pub failed: usize,
}

/// Spawns the sweeper when an interval is configured.
pub fn spawn_expiry_sweeper(state: AppState) -> Option<JoinHandle<()>> {
    let period = state.config.sweep_interval?;

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match sweep_once(&state, Utc::now()).await {
                Ok(report) if report != SweepReport::default() => {
                    tracing::info!(
                        expired_active = report.expired_active,
                        expired_unstarted = report.expired_unstarted,
                        failed = report.failed,
                        "Expiry sweep done"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Expiry sweep failed: {}", e),
            }
        }
    }))
}

/// One sweep pass. Each overdue instance runs in its own transaction, so one
/// failure does not hold back the rest.
pub async fn sweep_once(state: &AppState, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
    let mut report = SweepReport::default();

    let overdue = {
        let mut conn = state.pool.acquire().await?;
        instances::overdue_active_ids(&mut conn, now).await?
    };

    for instance_id in overdue {
        match expire_and_score(state, instance_id, now).await {
            Ok(true) => report.expired_active += 1,
            Ok(false) => {}
            Err(e) => {
                report.failed += 1;
                tracing::error!(instance_id, "Failed to expire instance: {}", e);
            }
        }
    }

    let mut tx = state.pool.begin().await?;
    report.expired_unstarted = instances::expire_unstarted(&mut tx, now).await?.len();
    tx.commit().await?;

    Ok(report)
}

async fn expire_and_score(
    state: &AppState,
    instance_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let mut tx = state.pool.begin().await?;

    let Some(instance) = instances::lock_instance(&mut tx, instance_id).await? else {
        return Ok(false);
    };
    let expired = review::expire_and_score(&mut tx, instance, state.config.scoring, now).await?;

    tx.commit().await?;
    Ok(expired)
}

//! Cron trigger for scheduled notifications.
//!
//! Ticks on a fixed cadence regardless of how long a poll takes: each tick
//! spawns its own poll and the dispatcher skips a tick that overlaps a
//! running one.

use super::NotificationDispatcher;
use crate::config::SchedulerConfig;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// One poll, followed by the recovery sweep when enabled.
pub async fn run_once(dispatcher: &NotificationDispatcher, config: &SchedulerConfig) {
    match dispatcher.poll_due(Utc::now()).await {
        Ok(report) if report.skipped => return,
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "Scheduled poll failed, will retry on next tick");
            return;
        }
    }

    if config.recover_unsent {
        if let Err(e) = dispatcher
            .recover_unsent(Utc::now(), config.recovery_grace)
            .await
        {
            warn!(error = %e, "Recovery sweep failed");
        }
    }
}

pub fn spawn(
    dispatcher: Arc<NotificationDispatcher>,
    config: SchedulerConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = config.poll_interval.as_secs(),
            recover_unsent = config.recover_unsent,
            "Starting notification scheduler"
        );

        if config.recover_unsent {
            match dispatcher
                .recover_unsent(Utc::now(), config.recovery_grace)
                .await
            {
                Ok(0) => {}
                Ok(n) => info!(recovered = n, "Re-indexed unsent notifications at startup"),
                Err(e) => warn!(error = %e, "Startup recovery sweep failed"),
            }
        }

        let mut ticker = interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dispatcher = Arc::clone(&dispatcher);
                    let config = config.clone();
                    tokio::spawn(async move {
                        run_once(&dispatcher, &config).await;
                    });
                }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal, stopping scheduler");
                    break;
                }
            }
        }
    })
}

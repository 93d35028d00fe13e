//! Synthetic notifications for demos. Off unless `DEMO_NOTIFICATIONS_ENABLED`.

use super::NotificationDispatcher;
use crate::config::DemoConfig;
use crate::error::AppResult;
use crate::models::{NewNotification, NotificationKind};
use crate::stores::PresenceStore;
use rand::seq::SliceRandom;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const SAMPLES: &[(&str, &str)] = &[
    ("Welcome back", "You have new activity waiting for you."),
    ("Tip", "Messages are delivered instantly to every open session."),
    ("Reminder", "Don't forget to check your unread messages."),
    ("Update", "Your workspace settings were synced."),
];

pub struct DemoGenerator {
    dispatcher: Arc<NotificationDispatcher>,
    directory: Arc<dyn PresenceStore>,
}

impl DemoGenerator {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, directory: Arc<dyn PresenceStore>) -> Self {
        Self {
            dispatcher,
            directory,
        }
    }

    /// Send one random sample to one random known identity
    pub async fn send_random(&self) -> AppResult<Option<String>> {
        let identities = self.directory.list_identities().await?;
        let picked = {
            let mut rng = rand::thread_rng();
            identities
                .choose(&mut rng)
                .cloned()
                .zip(SAMPLES.choose(&mut rng).copied())
        };
        let Some((target, (title, body))) = picked else {
            return Ok(None);
        };

        self.dispatcher
            .immediate(NewNotification {
                target: target.clone(),
                title: title.to_string(),
                body: body.to_string(),
                kind: NotificationKind::System {
                    auto_generated: true,
                },
                metadata: Some(json!({ "source": "demo" })),
            })
            .await?;
        Ok(Some(target))
    }

    pub async fn send_broadcast(&self) -> AppResult<()> {
        self.dispatcher
            .broadcast_all(NewNotification {
                target: String::new(),
                title: "System announcement".to_string(),
                body: "Scheduled maintenance keeps everything running smoothly.".to_string(),
                kind: NotificationKind::broadcast(),
                metadata: Some(json!({ "source": "demo" })),
            })
            .await?;
        Ok(())
    }

    pub fn spawn(self, config: DemoConfig, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                random_secs = config.random_interval.as_secs(),
                broadcast_secs = config.broadcast_interval.as_secs(),
                "Starting demo notification generator"
            );
            let mut random_ticker = interval(config.random_interval);
            let mut broadcast_ticker = interval(config.broadcast_interval);
            random_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            broadcast_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the immediate first tick of each.
            random_ticker.tick().await;
            broadcast_ticker.tick().await;

            loop {
                tokio::select! {
                    _ = random_ticker.tick() => match self.send_random().await {
                        Ok(Some(target)) => debug!(target = %target, "Demo notification sent"),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Demo notification failed"),
                    },
                    _ = broadcast_ticker.tick() => {
                        if let Err(e) = self.send_broadcast().await {
                            warn!(error = %e, "Demo broadcast failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

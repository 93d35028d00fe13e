use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    ChannelKind, NewNotification, Notification, ScheduledEntry, BROADCAST_TARGET,
};
use crate::stores::{NotificationStore, PresenceStore, ScheduleIndex};
use crate::websocket::events::NotificationServerEvent;
use crate::websocket::Fanout;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of one scheduler poll
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    /// Another poll was still running in this process
    pub skipped: bool,
    pub identities: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Creates, persists and delivers notifications.
///
/// A record is always persisted before it is delivered. Scheduled records are
/// removed from the index before delivery; a crash after removal and before
/// `mark_sent` leaves an unsent record that [`recover_unsent`] puts back.
///
/// [`recover_unsent`]: NotificationDispatcher::recover_unsent
pub struct NotificationDispatcher {
    notifications: Arc<dyn NotificationStore>,
    schedule: Arc<dyn ScheduleIndex>,
    directory: Arc<dyn PresenceStore>,
    fanout: Fanout,
    poll_guard: Mutex<()>,
}

impl NotificationDispatcher {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        schedule: Arc<dyn ScheduleIndex>,
        directory: Arc<dyn PresenceStore>,
        fanout: Fanout,
    ) -> Self {
        Self {
            notifications,
            schedule,
            directory,
            fanout,
            poll_guard: Mutex::new(()),
        }
    }

    fn validate(req: &NewNotification) -> AppResult<()> {
        if req.target.trim().is_empty() || req.title.trim().is_empty() {
            return Err(AppError::validation("Missing required fields"));
        }
        Ok(())
    }

    async fn deliver(&self, notification: &Notification) -> AppResult<usize> {
        self.fanout
            .send_to_identity(
                &notification.target,
                ChannelKind::Notification,
                &NotificationServerEvent::Notification(notification.clone()),
            )
            .await
    }

    /// Persist as sent, then deliver.
    pub async fn immediate(&self, req: NewNotification) -> AppResult<Notification> {
        Self::validate(&req)?;
        let notification = Notification::immediate(req);
        self.notifications.insert(&notification).await?;

        let reached = self.deliver(&notification).await?;
        metrics::NOTIFICATIONS_DELIVERED
            .with_label_values(&["immediate"])
            .inc();

        debug!(
            notification_id = %notification.id,
            target = %notification.target,
            kind = notification.kind.as_str(),
            local_handles = reached,
            "Immediate notification delivered"
        );
        Ok(notification)
    }

    /// Persist as unsent and index for delivery at `due_at`.
    pub async fn schedule(
        &self,
        req: NewNotification,
        due_at: DateTime<Utc>,
    ) -> AppResult<Notification> {
        Self::validate(&req)?;
        let notification = Notification::scheduled(req, due_at);
        self.notifications.insert(&notification).await?;

        let entry = ScheduledEntry {
            identity: notification.target.clone(),
            due_at,
            notification: notification.clone(),
        };
        if let Err(e) = self.schedule.insert(&entry).await {
            // An unindexed record would be picked up by the recovery sweep
            if let Err(undo) = self
                .notifications
                .discard_unsent(notification.id, &notification.target)
                .await
            {
                error!(
                    notification_id = %notification.id,
                    error = %undo,
                    "Failed to discard unindexed notification"
                );
            }
            return Err(e);
        }

        info!(
            notification_id = %notification.id,
            target = %notification.target,
            due_at = %due_at,
            "Notification scheduled"
        );
        Ok(notification)
    }

    /// Deliver every indexed entry due at or before `now`.
    ///
    /// Overlapping calls in one process are skipped rather than queued.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> AppResult<PollReport> {
        let Ok(_guard) = self.poll_guard.try_lock() else {
            debug!("Previous poll still running; skipping");
            return Ok(PollReport {
                skipped: true,
                ..PollReport::default()
            });
        };

        let timer = metrics::SCHEDULER_POLL_SECONDS.start_timer();
        let identities = self.schedule.identities_with_entries().await?;
        let mut report = PollReport {
            identities: identities.len(),
            ..PollReport::default()
        };

        for identity in identities {
            let due = match self.schedule.pop_due_before(&identity, now).await {
                Ok(due) => due,
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Failed to pop due entries");
                    report.failed += 1;
                    continue;
                }
            };

            for entry in due {
                let mut notification = entry.notification;
                notification.is_sent = true;

                if let Err(e) = self.deliver(&notification).await {
                    warn!(notification_id = %notification.id, error = %e, "Scheduled delivery failed");
                    report.failed += 1;
                    continue;
                }
                match self
                    .notifications
                    .mark_sent(notification.id, &notification.target)
                    .await
                {
                    Ok(_) => {
                        report.delivered += 1;
                        metrics::NOTIFICATIONS_DELIVERED
                            .with_label_values(&["scheduled"])
                            .inc();
                    }
                    Err(e) => {
                        // Left unsent; the recovery sweep re-indexes it.
                        warn!(notification_id = %notification.id, error = %e, "Failed to mark notification sent");
                        report.failed += 1;
                    }
                }
            }
        }

        timer.observe_duration();
        if report.delivered > 0 || report.failed > 0 {
            info!(
                delivered = report.delivered,
                failed = report.failed,
                identities = report.identities,
                "Scheduled notifications processed"
            );
        }
        Ok(report)
    }

    /// Re-index unsent records whose due time is older than `grace`.
    ///
    /// Entries still present in the index are left alone. Returns how many
    /// were put back.
    pub async fn recover_unsent(&self, now: DateTime<Utc>, grace: Duration) -> AppResult<usize> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| AppError::Internal(format!("recovery grace out of range: {e}")))?;
        let pending = self.notifications.pending_before(now - grace).await?;

        let mut recovered = 0;
        for notification in pending {
            let Some(entry) = ScheduledEntry::for_notification(&notification) else {
                continue;
            };
            if self.schedule.insert(&entry).await? {
                recovered += 1;
                warn!(
                    notification_id = %notification.id,
                    target = %notification.target,
                    "Re-indexed overdue unsent notification"
                );
            }
        }
        Ok(recovered)
    }

    /// Persist one sent record per known identity and deliver a single
    /// deployment-wide frame. Every record shares the frame's id.
    pub async fn broadcast_all(&self, req: NewNotification) -> AppResult<Notification> {
        if req.title.trim().is_empty() {
            return Err(AppError::validation("Missing required fields"));
        }
        let identities = self.directory.list_identities().await?;
        let id = Uuid::new_v4();

        let records: Vec<Notification> = identities
            .iter()
            .map(|identity| Notification::broadcast_copy(id, identity, &req))
            .collect();
        self.notifications.insert_many(&records).await?;

        let frame = Notification::broadcast_copy(id, BROADCAST_TARGET, &req);
        self.fanout
            .broadcast(
                ChannelKind::Notification,
                &NotificationServerEvent::Notification(frame.clone()),
                None,
            )
            .await?;
        metrics::NOTIFICATIONS_DELIVERED
            .with_label_values(&["broadcast"])
            .inc();

        info!(notification_id = %id, recipients = records.len(), "Broadcast notification sent");
        Ok(frame)
    }

    pub async fn unread_count(&self, identity: &str) -> AppResult<i64> {
        self.notifications.unread_count(identity).await
    }

    /// Delivered notifications, newest first, with `has_more`
    pub async fn list(
        &self,
        identity: &str,
        limit: i64,
        offset: i64,
    ) -> AppResult<(Vec<Notification>, bool)> {
        let items = self.notifications.list(identity, limit, offset).await?;
        let has_more = items.len() as i64 == limit;
        Ok((items, has_more))
    }

    /// Returns false for an unknown or malformed id.
    pub async fn mark_read(&self, notification_id: &str, identity: &str) -> AppResult<bool> {
        let Ok(id) = Uuid::parse_str(notification_id) else {
            return Ok(false);
        };
        self.notifications.mark_read(id, identity).await
    }

    /// Bulk flag update, then `unreadCount{0}` and `allNotificationsRead`
    /// to every notification handle of the identity.
    pub async fn mark_all_read(&self, identity: &str) -> AppResult<u64> {
        let updated = self.notifications.mark_all_read(identity).await?;

        self.fanout
            .send_to_identity(
                identity,
                ChannelKind::Notification,
                &NotificationServerEvent::UnreadCount { count: 0 },
            )
            .await?;
        self.fanout
            .send_to_identity(
                identity,
                ChannelKind::Notification,
                &NotificationServerEvent::AllNotificationsRead,
            )
            .await?;

        debug!(identity = %identity, updated, "Marked all notifications read");
        Ok(updated)
    }
}

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{notifications, Cluster, FailingScheduleIndex};
use realtime_hub_service::config::SchedulerConfig;
use realtime_hub_service::error::AppError;
use realtime_hub_service::models::{NewNotification, Notification, NotificationKind};
use realtime_hub_service::services::scheduler;
use realtime_hub_service::stores::{NotificationStore, ScheduleIndex, Stores};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn reminder(target: &str, title: &str) -> NewNotification {
    NewNotification {
        target: target.to_string(),
        title: title.to_string(),
        body: "Don't forget".to_string(),
        kind: NotificationKind::Reminder {
            subject: Some("standup".to_string()),
        },
        metadata: None,
    }
}

#[tokio::test]
async fn entry_is_delivered_once_after_it_falls_due() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    let mut bob = notifications(&hub, "bob").await;
    bob.drain().await;

    let due = Utc::now() + ChronoDuration::minutes(5);
    let scheduled = hub
        .state
        .dispatcher
        .schedule(reminder("bob", "Standup"), due)
        .await
        .unwrap();
    assert!(!scheduled.is_sent);
    assert!(bob.drain().await.is_empty());

    let early = hub
        .state
        .dispatcher
        .poll_due(due - ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(early.delivered, 0);
    assert_eq!(cluster.stores.schedule.entries("bob").await.unwrap().len(), 1);
    assert!(bob.drain().await.is_empty());

    let on_time = hub
        .state
        .dispatcher
        .poll_due(due + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(on_time.delivered, 1);

    let frame = bob.recv_event("notification").await;
    assert_eq!(frame["data"]["notificationId"], scheduled.id.to_string());
    assert_eq!(frame["data"]["type"], "reminder");
    assert_eq!(frame["data"]["subject"], "standup");
    assert_eq!(frame["data"]["isSent"], true);

    let stored = cluster
        .stores
        .notifications
        .get(scheduled.id, "bob")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_sent);
    assert!(cluster.stores.schedule.entries("bob").await.unwrap().is_empty());

    let later = hub
        .state
        .dispatcher
        .poll_due(due + ChronoDuration::minutes(10))
        .await
        .unwrap();
    assert_eq!(later.delivered, 0);
    assert!(bob.drain().await.is_empty());
}

#[tokio::test]
async fn due_entries_are_delivered_in_due_order() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    let mut bob = notifications(&hub, "bob").await;
    bob.drain().await;

    let base = Utc::now() + ChronoDuration::minutes(1);
    for (offset, title) in [(30, "third"), (10, "first"), (20, "second")] {
        hub.state
            .dispatcher
            .schedule(reminder("bob", title), base + ChronoDuration::seconds(offset))
            .await
            .unwrap();
    }

    hub.state
        .dispatcher
        .poll_due(base + ChronoDuration::minutes(1))
        .await
        .unwrap();

    let titles: Vec<String> = bob
        .drain_events("notification")
        .await
        .iter()
        .map(|f| f["data"]["title"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(titles, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn overlapping_polls_deliver_each_entry_once() {
    let cluster = Cluster::new();
    let hub_a = cluster.hub("hub-a").await;
    let hub_b = cluster.hub("hub-b").await;
    let mut bob = notifications(&hub_b, "bob").await;
    bob.drain().await;

    let due = Utc::now() + ChronoDuration::seconds(30);
    for i in 0..5 {
        hub_a
            .state
            .dispatcher
            .schedule(reminder("bob", &format!("reminder {i}")), due)
            .await
            .unwrap();
    }

    let now = due + ChronoDuration::seconds(1);
    let (a, a_again, b) = tokio::join!(
        hub_a.state.dispatcher.poll_due(now),
        hub_a.state.dispatcher.poll_due(now),
        hub_b.state.dispatcher.poll_due(now),
    );
    let delivered = a.unwrap().delivered + a_again.unwrap().delivered + b.unwrap().delivered;
    assert_eq!(delivered, 5);

    let frames = bob.drain_events("notification").await;
    assert_eq!(frames.len(), 5);
}

#[tokio::test]
async fn recovery_reindexes_overdue_unsent_records_once() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    let mut bob = notifications(&hub, "bob").await;
    bob.drain().await;

    // Persisted but lost from the index, as after a crash mid-poll
    let overdue = Notification::scheduled(
        reminder("bob", "overdue"),
        Utc::now() - ChronoDuration::minutes(10),
    );
    let recent = Notification::scheduled(
        reminder("bob", "recent"),
        Utc::now() - ChronoDuration::seconds(5),
    );
    cluster.stores.notifications.insert(&overdue).await.unwrap();
    cluster.stores.notifications.insert(&recent).await.unwrap();

    let grace = Duration::from_secs(60);
    let recovered = hub
        .state
        .dispatcher
        .recover_unsent(Utc::now(), grace)
        .await
        .unwrap();
    assert_eq!(recovered, 1);
    let again = hub
        .state
        .dispatcher
        .recover_unsent(Utc::now(), grace)
        .await
        .unwrap();
    assert_eq!(again, 0);

    let report = assert_ok!(hub.state.dispatcher.poll_due(Utc::now()).await);
    assert_eq!(report.delivered, 1);
    let frame = bob.recv_event("notification").await;
    assert_eq!(frame["data"]["notificationId"], overdue.id.to_string());

    let after = hub
        .state
        .dispatcher
        .recover_unsent(Utc::now(), grace)
        .await
        .unwrap();
    assert_eq!(after, 0);
}

#[tokio::test]
async fn run_once_polls_then_sweeps() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    let mut bob = notifications(&hub, "bob").await;
    bob.drain().await;

    let lost = Notification::scheduled(
        reminder("bob", "lost"),
        Utc::now() - ChronoDuration::minutes(5),
    );
    cluster.stores.notifications.insert(&lost).await.unwrap();

    let config = SchedulerConfig {
        poll_interval: Duration::from_secs(1),
        recover_unsent: true,
        recovery_grace: Duration::from_secs(60),
    };

    // First run re-indexes, second delivers
    scheduler::run_once(&hub.state.dispatcher, &config).await;
    assert!(bob.drain().await.is_empty());
    scheduler::run_once(&hub.state.dispatcher, &config).await;
    let frame = bob.recv_event("notification").await;
    assert_eq!(frame["data"]["title"], "lost");
}

#[tokio::test]
async fn schedule_rejects_missing_fields() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;

    let err = assert_err!(
        hub.state
            .dispatcher
            .schedule(reminder("", "title"), Utc::now() + ChronoDuration::minutes(1))
            .await
    );
    assert!(matches!(err, AppError::Validation(_)));
    assert!(cluster
        .stores
        .schedule
        .identities_with_entries()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn failed_index_insert_leaves_nothing_to_deliver() {
    let mut stores = Stores::memory();
    stores.schedule = Arc::new(FailingScheduleIndex::new(1));
    let cluster = Cluster::with_stores(stores);
    let hub = cluster.hub("hub-a").await;
    let mut bob = notifications(&hub, "bob").await;
    bob.drain().await;

    let due = Utc::now() - ChronoDuration::minutes(5);
    let err = assert_err!(
        hub.state
            .dispatcher
            .schedule(reminder("bob", "rejected"), due)
            .await
    );
    assert!(matches!(err, AppError::StoreUnavailable(_)));

    let recovered = hub
        .state
        .dispatcher
        .recover_unsent(Utc::now(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(recovered, 0);
    let report = assert_ok!(hub.state.dispatcher.poll_due(Utc::now()).await);
    assert_eq!(report.delivered, 0);
    assert!(bob.drain_events("notification").await.is_empty());

    // A retry goes through and is delivered exactly once
    let retried = assert_ok!(
        hub.state
            .dispatcher
            .schedule(reminder("bob", "retried"), due)
            .await
    );
    let report = assert_ok!(hub.state.dispatcher.poll_due(Utc::now()).await);
    assert_eq!(report.delivered, 1);
    let frames = bob.drain_events("notification").await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["data"]["notificationId"], retried.id.to_string());
}

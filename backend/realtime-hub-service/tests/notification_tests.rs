mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{notifications, Cluster};
use realtime_hub_service::error::AppError;
use realtime_hub_service::models::{NewNotification, NotificationKind, BROADCAST_TARGET};
use realtime_hub_service::stores::{NotificationStore, PresenceStore};
use serde_json::json;

fn system(target: &str, title: &str) -> NewNotification {
    NewNotification {
        target: target.to_string(),
        title: title.to_string(),
        body: "body".to_string(),
        kind: NotificationKind::System {
            auto_generated: false,
        },
        metadata: Some(json!({ "source": "test" })),
    }
}

#[tokio::test]
async fn immediate_reaches_every_session_of_the_target() {
    let cluster = Cluster::new();
    let hub_a = cluster.hub("hub-a").await;
    let hub_b = cluster.hub("hub-b").await;
    let mut bob_a = notifications(&hub_a, "bob").await;
    let mut bob_b = notifications(&hub_b, "bob").await;
    let mut carol = notifications(&hub_a, "carol").await;
    bob_a.drain().await;
    bob_b.drain().await;
    carol.drain().await;

    let sent = hub_a
        .state
        .dispatcher
        .immediate(system("bob", "Hello"))
        .await
        .unwrap();
    assert!(sent.is_sent);

    for client in [&mut bob_a, &mut bob_b] {
        let frames = client.drain_events("notification").await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"]["notificationId"], sent.id.to_string());
        assert_eq!(frames[0]["data"]["metadata"]["source"], "test");
    }
    assert!(carol.drain().await.is_empty());
}

#[tokio::test]
async fn offline_target_sees_it_on_next_connect() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;

    hub.state
        .dispatcher
        .immediate(system("bob", "While you were away"))
        .await
        .unwrap();

    let mut bob = notifications(&hub, "bob").await;
    let unread = bob.recv().await;
    assert_eq!(unread["event"], "unreadCount");
    assert_eq!(unread["data"]["count"], 1);

    bob.send(json!({ "event": "getNotifications" })).await;
    let list = bob.recv_event("notificationList").await;
    assert_eq!(list["data"]["notifications"][0]["title"], "While you were away");
    assert_eq!(list["data"]["hasMore"], false);
}

#[tokio::test]
async fn immediate_rejects_missing_fields() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;

    let err = hub
        .state
        .dispatcher
        .immediate(system("bob", "  "))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(hub.state.dispatcher.unread_count("bob").await.unwrap(), 0);
}

#[tokio::test]
async fn broadcast_sends_one_frame_per_session_and_one_record_per_identity() {
    let cluster = Cluster::new();
    let hub_a = cluster.hub("hub-a").await;
    let hub_b = cluster.hub("hub-b").await;

    let mut alice = notifications(&hub_a, "alice").await;
    let mut bob = notifications(&hub_b, "bob").await;
    // Known but offline
    cluster
        .stores
        .presence
        .find_or_create("carol")
        .await
        .unwrap();
    alice.drain().await;
    bob.drain().await;

    let frame = hub_a
        .state
        .dispatcher
        .broadcast_all(NewNotification {
            target: String::new(),
            title: "Maintenance".to_string(),
            body: "Tonight at 22:00".to_string(),
            kind: NotificationKind::broadcast(),
            metadata: None,
        })
        .await
        .unwrap();
    assert_eq!(frame.target, BROADCAST_TARGET);

    for client in [&mut alice, &mut bob] {
        let frames = client.drain_events("notification").await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"]["userId"], "*");
        assert_eq!(frames[0]["data"]["type"], "broadcast");
        assert_eq!(frames[0]["data"]["audience"], "all");
        assert_eq!(frames[0]["data"]["notificationId"], frame.id.to_string());
    }

    for identity in ["alice", "bob", "carol"] {
        let stored = cluster
            .stores
            .notifications
            .get(frame.id, identity)
            .await
            .unwrap()
            .expect("record per identity");
        assert!(stored.is_sent);
        assert_eq!(
            hub_a.state.dispatcher.unread_count(identity).await.unwrap(),
            1
        );
    }
}

#[tokio::test]
async fn mark_as_read_updates_every_session() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    let mut bob_1 = notifications(&hub, "bob").await;
    let mut bob_2 = notifications(&hub, "bob").await;

    let first = hub
        .state
        .dispatcher
        .immediate(system("bob", "one"))
        .await
        .unwrap();
    hub.state
        .dispatcher
        .immediate(system("bob", "two"))
        .await
        .unwrap();
    bob_1.drain().await;
    bob_2.drain().await;

    bob_1
        .send(json!({
            "event": "markAsRead",
            "data": { "notificationId": first.id.to_string() }
        }))
        .await;

    for client in [&mut bob_1, &mut bob_2] {
        let count = client.recv().await;
        assert_eq!(count["event"], "unreadCount");
        assert_eq!(count["data"]["count"], 1);
        let read = client.recv().await;
        assert_eq!(read["event"], "notificationRead");
        assert_eq!(read["data"]["notificationId"], first.id.to_string());
    }
}

#[tokio::test]
async fn unknown_or_foreign_ids_are_ignored() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    let alice_note = hub
        .state
        .dispatcher
        .immediate(system("alice", "private"))
        .await
        .unwrap();

    let mut bob = notifications(&hub, "bob").await;
    bob.drain().await;

    bob.send(json!({
        "event": "markAsRead",
        "data": { "notificationId": "not-a-uuid" }
    }))
    .await;
    bob.send(json!({
        "event": "markAsRead",
        "data": { "notificationId": alice_note.id.to_string() }
    }))
    .await;

    assert!(bob.drain().await.is_empty());
    assert_eq!(hub.state.dispatcher.unread_count("alice").await.unwrap(), 1);
}

#[tokio::test]
async fn mark_all_as_read_resets_count() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    let mut bob = notifications(&hub, "bob").await;
    let mut sent = Vec::new();
    for title in ["a", "b", "c"] {
        sent.push(
            hub.state
                .dispatcher
                .immediate(system("bob", title))
                .await
                .unwrap(),
        );
    }
    let alice_note = hub
        .state
        .dispatcher
        .immediate(system("alice", "untouched"))
        .await
        .unwrap();
    bob.drain().await;

    bob.send(json!({ "event": "markAllAsRead" })).await;

    let count = bob.recv().await;
    assert_eq!(count["event"], "unreadCount");
    assert_eq!(count["data"]["count"], 0);
    let done = bob.recv().await;
    assert_eq!(done["event"], "allNotificationsRead");
    assert_eq!(hub.state.dispatcher.unread_count("bob").await.unwrap(), 0);

    for note in &sent {
        let stored = cluster
            .stores
            .notifications
            .get(note.id, "bob")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_read, "{}", note.title);
    }
    let other = cluster
        .stores
        .notifications
        .get(alice_note.id, "alice")
        .await
        .unwrap()
        .unwrap();
    assert!(!other.is_read);
    assert_eq!(hub.state.dispatcher.unread_count("alice").await.unwrap(), 1);
}

#[tokio::test]
async fn listing_excludes_pending_scheduled_records() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    hub.state
        .dispatcher
        .schedule(system("bob", "later"), Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    hub.state
        .dispatcher
        .immediate(system("bob", "older"))
        .await
        .unwrap();
    hub.state
        .dispatcher
        .immediate(system("bob", "newer"))
        .await
        .unwrap();

    let mut bob = notifications(&hub, "bob").await;
    let unread = bob.recv().await;
    assert_eq!(unread["data"]["count"], 2);

    bob.send(json!({ "event": "getNotifications", "data": { "limit": 1 } }))
        .await;
    let page = bob.recv_event("notificationList").await;
    let items = page["data"]["notifications"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["title"], "newer");
    assert_eq!(page["data"]["hasMore"], true);
}

#[tokio::test]
async fn unknown_client_event_gets_error_reply() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    let mut bob = notifications(&hub, "bob").await;
    bob.drain().await;

    bob.send(json!({ "event": "deleteEverything", "data": {} }))
        .await;
    let error = bob.recv().await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["message"], "Malformed event");
}

#[tokio::test]
async fn pending_scheduled_record_cannot_be_marked_read() {
    let cluster = Cluster::new();
    let hub = cluster.hub("hub-a").await;
    let mut bob = notifications(&hub, "bob").await;
    bob.drain().await;

    let due = Utc::now() + ChronoDuration::minutes(5);
    let pending = hub
        .state
        .dispatcher
        .schedule(system("bob", "later"), due)
        .await
        .unwrap();

    bob.send(json!({
        "event": "markAsRead",
        "data": { "notificationId": pending.id.to_string() }
    }))
    .await;
    assert!(bob.drain().await.is_empty());

    hub.state
        .dispatcher
        .poll_due(due + ChronoDuration::seconds(1))
        .await
        .unwrap();
    let frame = bob.recv_event("notification").await;
    assert_eq!(frame["data"]["isRead"], false);
    assert_eq!(hub.state.dispatcher.unread_count("bob").await.unwrap(), 1);
}

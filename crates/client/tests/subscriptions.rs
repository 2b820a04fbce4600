mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{advance_ms, manager, settle, test_config, MockTransport};
use futures_util::StreamExt;
use livechat_client::{Feed, SubscriptionMultiplexer};
use livechat_shared::{
    kind, ChangeKind, ChangeNotification, ChannelKey, Envelope, Filter, Payload, SubscriptionTarget,
};
use parking_lot::Mutex;
use serde_json::json;

fn targets(envelopes: &[Envelope]) -> Vec<SubscriptionTarget> {
    envelopes
        .iter()
        .filter_map(|env| match env.payload() {
            Payload::Subscribe(target) | Payload::Unsubscribe(target) => Some(target.clone()),
            _ => None,
        })
        .collect()
}

fn change(resource: &str, event: ChangeKind, data: serde_json::Value) -> Envelope {
    Envelope::change(ChangeNotification::new(resource, event, data))
}

#[tokio::test(start_paused = true)]
async fn shared_channel_costs_one_subscribe_and_one_unsubscribe() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());
    conn.connect().await.unwrap();
    let mut server = transport.server();

    let first = mux.subscribe("A", &[ChangeKind::Insert], None, |_| {});
    let second = mux.subscribe("A", &[ChangeKind::Insert], None, |_| {});

    let subscribes = server.envelopes_of(kind::SUBSCRIBE);
    assert_eq!(
        targets(&subscribes),
        vec![SubscriptionTarget {
            resource: "A".into(),
            event: ChangeKind::Insert,
            filter: None,
        }]
    );

    first.unsubscribe();
    assert!(server.envelopes().is_empty());
    second.unsubscribe();
    second.unsubscribe();

    assert_eq!(server.envelopes_of(kind::UNSUBSCRIBE).len(), 1);
    assert!(mux.active_channels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn offline_subscriptions_are_sent_on_connect() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());

    mux.subscribe(
        "sessions",
        &[ChangeKind::Update],
        Some(Filter::new("id", "S1")),
        |_| {},
    );
    assert_eq!(transport.opens(), 0);

    conn.connect().await.unwrap();
    let sent = targets(&transport.server().envelopes_of(kind::SUBSCRIBE));
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].filter, Some(Filter::new("id", "S1")));
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_every_channel_once() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());
    mux.subscribe("messages", &[ChangeKind::Insert], None, |_| {});
    mux.subscribe(
        "sessions",
        &[ChangeKind::Update],
        Some(Filter::new("id", "S1")),
        |_| {},
    );
    conn.connect().await.unwrap();

    let mut first = transport.server();
    let before: HashSet<ChannelKey> = targets(&first.envelopes_of(kind::SUBSCRIBE))
        .into_iter()
        .map(ChannelKey::from)
        .collect();
    assert_eq!(before.len(), 2);

    first.close(1006);
    settle().await;
    advance_ms(1_101).await;
    assert!(conn.is_connected());

    let replayed: Vec<ChannelKey> = targets(&transport.server().envelopes_of(kind::SUBSCRIBE))
        .into_iter()
        .map(ChannelKey::from)
        .collect();
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed.into_iter().collect::<HashSet<_>>(), before);
}

#[tokio::test(start_paused = true)]
async fn filtered_and_unfiltered_subscribers_share_a_change() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());
    let hits = Arc::new(Mutex::new(Vec::new()));

    for (label, filter) in [
        ("all", None),
        ("s1", Some(Filter::new("id", "S1"))),
        ("s2", Some(Filter::new("id", "S2"))),
    ] {
        let hits = hits.clone();
        mux.subscribe("sessions", &[ChangeKind::Update], filter, move |event| {
            hits.lock().push((label, event.new["status"].clone()));
        });
    }
    conn.connect().await.unwrap();
    let server = transport.server();

    server.push(change(
        "sessions",
        ChangeKind::Update,
        json!({ "id": "S1", "status": "closed" }),
    ));
    settle().await;

    let mut hits = hits.lock().clone();
    hits.sort_by_key(|(label, _)| *label);
    assert_eq!(
        hits,
        vec![("all", json!("closed")), ("s1", json!("closed"))]
    );
}

#[tokio::test(start_paused = true)]
async fn panicking_subscriber_does_not_block_others() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());
    let delivered = Arc::new(AtomicUsize::new(0));

    mux.subscribe("messages", &[ChangeKind::Insert], None, |_| {
        panic!("subscriber bug")
    });
    let counter = delivered.clone();
    mux.subscribe("messages", &[ChangeKind::Insert], None, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    conn.connect().await.unwrap();
    let server = transport.server();

    server.push(change("messages", ChangeKind::Insert, json!({ "id": 1 })));
    server.push(change("messages", ChangeKind::Insert, json!({ "id": 2 })));
    settle().await;

    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_after_destroy_is_a_no_op() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());
    let sub = mux.subscribe("messages", &[ChangeKind::Insert], None, |_| {});
    conn.connect().await.unwrap();
    let mut server = transport.server();
    server.frames();

    conn.destroy();
    sub.unsubscribe();
    sub.unsubscribe();

    assert!(server.envelopes_of(kind::UNSUBSCRIBE).is_empty());
    assert!(!sub.is_active());
}

#[tokio::test(start_paused = true)]
async fn stream_delivers_feed_events_and_unsubscribes_on_drop() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());
    conn.connect().await.unwrap();
    let mut server = transport.server();

    let mut stream = mux.watch_stream(&Feed::SessionMessages {
        session_id: "S1".into(),
    });
    assert_eq!(server.envelopes_of(kind::SUBSCRIBE).len(), 1);

    server.push(change(
        "messages",
        ChangeKind::Insert,
        json!({ "session_id": "S2", "body": "elsewhere" }),
    ));
    server.push(change(
        "messages",
        ChangeKind::Insert,
        json!({ "session_id": "S1", "body": "hello" }),
    ));

    let event = stream.next().await.unwrap();
    assert_eq!(event.resource, "messages");
    assert_eq!(event.event_type, ChangeKind::Insert);
    assert_eq!(event.new["body"], "hello");

    drop(stream);
    assert_eq!(server.envelopes_of(kind::UNSUBSCRIBE).len(), 1);
    assert!(mux.active_channels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn callbacks_stop_after_close() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    mux.subscribe("messages", &[ChangeKind::Insert], None, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    conn.connect().await.unwrap();
    let mut server = transport.server();

    mux.close();
    assert_eq!(server.envelopes_of(kind::UNSUBSCRIBE).len(), 1);

    server.push(change("messages", ChangeKind::Insert, json!({})));
    settle().await;
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn subscribe_from_an_earlier_connect_hook_is_sent_once() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let slot: Arc<Mutex<Option<SubscriptionMultiplexer>>> = Arc::new(Mutex::new(None));
    let held = Arc::new(Mutex::new(Vec::new()));

    // Registered before the multiplexer's own connect hook, so it runs first.
    conn.on_connect({
        let slot = slot.clone();
        let held = held.clone();
        move || {
            let Some(mux) = slot.lock().clone() else {
                return;
            };
            if held.lock().is_empty() {
                let sub = mux.subscribe("A", &[ChangeKind::Insert], None, |_| {});
                held.lock().push(sub);
            }
        }
    });
    let mux = SubscriptionMultiplexer::new(conn.clone());
    *slot.lock() = Some(mux.clone());

    conn.connect().await.unwrap();

    let sent = targets(&transport.server().envelopes_of(kind::SUBSCRIBE));
    assert_eq!(
        sent,
        vec![SubscriptionTarget {
            resource: "A".into(),
            event: ChangeKind::Insert,
            filter: None,
        }]
    );
    assert_eq!(mux.active_channels().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_reconnecting_is_sent_once() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());
    mux.subscribe("A", &[ChangeKind::Insert], None, |_| {});
    conn.connect().await.unwrap();
    let mut first = transport.server();
    assert_eq!(first.envelopes_of(kind::SUBSCRIBE).len(), 1);

    first.close(1006);
    settle().await;
    assert!(!conn.is_connected());

    mux.subscribe("B", &[ChangeKind::Insert], None, |_| {});
    advance_ms(1_101).await;
    assert!(conn.is_connected());

    let replayed = targets(&transport.server().envelopes_of(kind::SUBSCRIBE));
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed.iter().filter(|t| t.resource == "B").count(), 1);
    assert_eq!(replayed.iter().filter(|t| t.resource == "A").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn destroying_the_connection_empties_the_registry() {
    let transport = MockTransport::new();
    let conn = manager(test_config(), &transport);
    let mux = SubscriptionMultiplexer::new(conn.clone());
    let sub = mux.subscribe("messages", &[ChangeKind::Insert], None, |_| {});
    let mut stream = mux.subscribe_stream("sessions", &[ChangeKind::Update], None);
    conn.connect().await.unwrap();
    assert_eq!(mux.active_channels().len(), 2);

    conn.destroy();

    assert!(mux.active_channels().is_empty());
    assert_eq!(mux.callback_count(&ChannelKey::new("messages", ChangeKind::Insert)), 0);
    assert_eq!(mux.resubscribe_all(), 0);
    // The stream's sender went with the registry.
    assert!(stream.next().await.is_none());
    sub.unsubscribe();
}

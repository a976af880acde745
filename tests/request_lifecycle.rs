//! Registry, dispatcher and broker behaviour through the public API.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether::DeliveryError;
use tether::rpc::{
    EventEnvelope, ForwardOutcome, RequestMetadata, RequestRegistry, ResponseEnvelope,
    StreamingDispatcher, SubscriptionBroker, Topic, channel_push_fn, noop_cleanup,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

fn drain(rx: &mut mpsc::UnboundedReceiver<ResponseEnvelope>) -> Vec<ResponseEnvelope> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

#[test]
fn identifier_is_live_iff_last_operation_was_register() {
    enum Op {
        Register(&'static str),
        Unregister(&'static str),
    }

    let ops = [
        Op::Register("a"),
        Op::Register("b"),
        Op::Unregister("a"),
        Op::Unregister("a"),
        Op::Register("a"),
        Op::Register("a"),
        Op::Unregister("b"),
        Op::Unregister("c"),
        Op::Register("c"),
        Op::Unregister("a"),
    ];

    let registry = RequestRegistry::new();
    let mut model: HashSet<&str> = HashSet::new();
    for op in ops {
        match op {
            Op::Register(id) => {
                registry.register(id, noop_cleanup(), RequestMetadata::default(), None);
                model.insert(id);
            }
            Op::Unregister(id) => {
                let was_live = registry.unregister(id);
                assert_eq!(was_live, model.remove(id));
            }
        }
        for id in ["a", "b", "c"] {
            assert_eq!(registry.contains(id), model.contains(id), "id {id}");
        }
    }
}

#[test]
fn cleanup_runs_once_no_matter_how_often_unregistered() {
    let registry = RequestRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    registry.register(
        "r1",
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        RequestMetadata::default(),
        None,
    );
    assert!(registry.unregister("r1"));
    assert!(!registry.unregister("r1"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn terminal_push_is_last_delivery() {
    let registry = RequestRegistry::new();
    let dispatcher = StreamingDispatcher::new(registry.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.register(
        "s1",
        noop_cleanup(),
        RequestMetadata::default(),
        Some(channel_push_fn(tx)),
    );

    dispatcher.push("s1", json!({"n": 1}), false).unwrap();
    dispatcher.push("s1", json!({"n": 2}), false).unwrap();
    dispatcher.push("s1", json!({"n": 3}), true).unwrap();
    assert_eq!(
        dispatcher.push("s1", json!({"n": 4}), false),
        Err(DeliveryError::NotRegistered("s1".to_owned()))
    );

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 3);
    assert_eq!(messages.iter().filter(|m| m.is_last).count(), 1);
    assert!(messages.last().is_some_and(|m| m.is_last));
    let order: Vec<i64> = messages
        .iter()
        .filter_map(|m| m.payload["n"].as_i64())
        .collect();
    assert_eq!(order, vec![1, 2, 3]);
}

#[test]
fn error_push_terminates_the_exchange() {
    let registry = RequestRegistry::new();
    let dispatcher = StreamingDispatcher::new(registry.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.register(
        "e1",
        noop_cleanup(),
        RequestMetadata::default(),
        Some(channel_push_fn(tx)),
    );

    dispatcher.push_error("e1", "boom").unwrap();
    assert!(!registry.contains("e1"));
    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].ok);
    assert!(messages[0].is_last);
}

#[tokio::test]
async fn forwarded_stream_ends_with_done_marker() {
    let registry = RequestRegistry::new();
    let dispatcher = StreamingDispatcher::new(registry.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.register(
        "f1",
        noop_cleanup(),
        RequestMetadata::default(),
        Some(channel_push_fn(tx)),
    );

    let (producer, items) = mpsc::unbounded_channel::<Result<serde_json::Value, String>>();
    for n in 0..3 {
        producer.send(Ok(json!({"n": n}))).unwrap();
    }
    drop(producer);

    let outcome = dispatcher
        .forward("f1", UnboundedReceiverStream::new(items), &CancellationToken::new())
        .await;
    assert_eq!(outcome, ForwardOutcome::Completed);

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 4);
    assert!(messages[..3].iter().all(|m| !m.is_last));
    assert_eq!(messages[3].payload, json!({"done": true}));
    assert!(messages[3].is_last);
    assert!(!registry.contains("f1"));
}

#[tokio::test]
async fn unregister_stops_a_running_producer() {
    let registry = RequestRegistry::new();
    let dispatcher = StreamingDispatcher::new(registry.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let on_unregister = cancel.clone();
    registry.register(
        "p1",
        Box::new(move || on_unregister.cancel()),
        RequestMetadata::default(),
        Some(channel_push_fn(tx)),
    );

    let (producer, items) = mpsc::unbounded_channel::<Result<serde_json::Value, String>>();
    let forward = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            dispatcher
                .forward("p1", UnboundedReceiverStream::new(items), &cancel)
                .await
        })
    };

    producer.send(Ok(json!({"n": 0}))).unwrap();
    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(!first.is_last);

    registry.unregister("p1");
    let outcome = tokio::time::timeout(WAIT, forward).await.unwrap().unwrap();
    assert_eq!(outcome, ForwardOutcome::Cancelled);

    // The producer is still alive but nothing more reaches the caller.
    let _ = producer.send(Ok(json!({"n": 1})));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn failed_subscriber_is_dropped_and_others_keep_receiving() {
    let registry = RequestRegistry::new();
    let broker = SubscriptionBroker::spawn(registry.clone());

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let (tx_c, mut rx_c) = mpsc::unbounded_channel();
    for (id, tx) in [("a", tx_a), ("b", tx_b), ("c", tx_c)] {
        broker.subscribe(Topic::FilePicker, channel_push_fn(tx), Some(id.to_owned()), None);
    }
    assert_eq!(broker.subscriber_count(Topic::FilePicker).await, 3);

    drop(rx_b);
    broker.publish(EventEnvelope::new(Topic::FilePicker, None, json!({"n": 1})));
    assert_eq!(broker.subscriber_count(Topic::FilePicker).await, 2);
    assert!(!registry.contains("b"));

    broker.publish(EventEnvelope::new(Topic::FilePicker, None, json!({"n": 2})));
    assert_eq!(broker.subscriber_count(Topic::FilePicker).await, 2);

    for rx in [&mut rx_a, &mut rx_c] {
        let payloads: Vec<_> = drain(rx).into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec![json!({"n": 1}), json!({"n": 2})]);
    }
}

#[tokio::test]
async fn targeted_event_reaches_only_its_instance() {
    let registry = RequestRegistry::new();
    let broker = SubscriptionBroker::spawn(registry.clone());
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    broker.subscribe(
        Topic::FocusChatInput,
        channel_push_fn(tx_a),
        Some("sub-a".to_owned()),
        Some("panel-a".to_owned()),
    );
    broker.subscribe(
        Topic::FocusChatInput,
        channel_push_fn(tx_b),
        Some("sub-b".to_owned()),
        Some("panel-b".to_owned()),
    );

    broker.publish(EventEnvelope::new(
        Topic::FocusChatInput,
        Some("panel-b".to_owned()),
        json!({}),
    ));
    assert_eq!(broker.subscriber_count(Topic::FocusChatInput).await, 2);

    assert!(drain(&mut rx_a).is_empty());
    let received = drain(&mut rx_b);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].request_id, "sub-b");
    assert!(!received[0].is_last);
}

#[tokio::test]
async fn owner_teardown_unsubscribes() {
    let registry = RequestRegistry::new();
    let broker = SubscriptionBroker::spawn(registry.clone());
    let (tx, _rx) = mpsc::unbounded_channel();
    broker.subscribe(
        Topic::State,
        channel_push_fn(tx),
        Some("state-1".to_owned()),
        Some("panel".to_owned()),
    );
    assert_eq!(broker.subscriber_count(Topic::State).await, 1);

    assert_eq!(registry.unregister_owner("panel"), 1);
    assert_eq!(broker.subscriber_count(Topic::State).await, 0);
}

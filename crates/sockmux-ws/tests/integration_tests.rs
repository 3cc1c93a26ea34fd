//! End-to-end scenarios over the mock transport
//!
//! These tests drive the full client stack frame by frame: coalescing and
//! saturation of the connection pool, cancellation mid-handshake,
//! reconnect with resubscribe, dispose, and query/subscription routing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use sockmux_ws::{
    id_matched, MockFactory, MockHandle, Query, SocketClient, SocketError, SocketEvent,
    SocketOptions, SocketProtocol, TransportError, TransportFactory, TypedStream,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Envelope used throughout: subscriptions route by `topic`, requests carry
/// an `id` echoed back in acks.
struct TopicProtocol;

impl SocketProtocol for TopicProtocol {
    fn identify(&self, value: &serde_json::Value) -> Vec<String> {
        value["topic"]
            .as_str()
            .map(|t| vec![t.to_string()])
            .unwrap_or_default()
    }
}

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

type Sink = Arc<Mutex<Vec<serde_json::Value>>>;

/// A stream over one topic with a subscribe/unsubscribe exchange
fn stream(topic: &str, sink: Sink) -> TypedStream<serde_json::Value> {
    let topic = topic.to_string();
    let sub_topic = topic.clone();
    let unsub_topic = topic.clone();
    let request_id = next_request_id();
    TypedStream::new([topic], move |update: serde_json::Value| {
        sink.lock().push(update);
    })
    .with_subscribe(move |_conn| {
        Some(id_matched(
            json!({"op": "subscribe", "topic": sub_topic, "id": request_id}),
            request_id,
        ))
    })
    .with_unsubscribe(move || {
        Some(Query::new(
            json!({"op": "unsubscribe", "topic": unsub_topic, "id": next_request_id()}),
            |_| false,
        ))
    })
}

fn sink() -> Sink {
    Arc::new(Mutex::new(Vec::new()))
}

/// Echo an ack for every subscribe request; log everything sent
fn auto_ack(handle: Arc<MockHandle>) -> Sink {
    let log = sink();
    let task_log = Arc::clone(&log);
    tokio::spawn(async move {
        while let Some(frame) = handle.next_sent().await {
            let value: serde_json::Value = serde_json::from_str(&frame).expect("sent json");
            task_log.lock().push(value.clone());
            if value["op"] == "subscribe" {
                handle.push_frame(json!({"op": "ack", "id": value["id"]}).to_string());
            }
        }
    });
    log
}

fn count_ops(log: &Sink, op: &str) -> usize {
    log.lock().iter().filter(|v| v["op"] == op).count()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition within deadline");
}

fn base_options() -> SocketOptions {
    SocketOptions::new("wss://stream.example.com/ws")
        .with_reconnect_interval(Duration::from_millis(10))
        .with_query_timeout(Duration::from_secs(2))
        .without_keep_alive()
}

/// Per-connection subscription counts extracted from the state dump
fn subscription_spread(client: &SocketClient) -> Vec<usize> {
    let dump = client.state_dump();
    let mut counts = Vec::new();
    for line in dump.lines() {
        if line.starts_with("socket ") {
            counts.push(0usize);
        } else if line.trim_start().starts_with("subscription ") && line.contains("system=false") {
            if let Some(last) = counts.last_mut() {
                *last += 1;
            }
        }
    }
    counts.sort();
    counts
}

#[tokio::test]
async fn subscriptions_coalesce_up_to_target() {
    let factory = Arc::new(MockFactory::new());
    auto_ack(Arc::new(factory.prepare()));
    auto_ack(Arc::new(factory.prepare()));

    let client = SocketClient::builder(
        base_options().with_combine_target(3).with_max_connections(2),
        TopicProtocol,
    )
    .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
    .build();

    for i in 0..5 {
        client
            .subscribe(stream(&format!("trades.{i}"), sink()), CancellationToken::new())
            .await
            .expect("subscribe");
    }

    assert_eq!(client.current_connections(), 2);
    assert_eq!(client.current_subscriptions(), 5);
    assert_eq!(factory.created_count(), 2);
    assert_eq!(subscription_spread(&client), vec![2, 3]);
}

#[tokio::test]
async fn saturated_pool_overflows_least_loaded() {
    let factory = Arc::new(MockFactory::new());
    auto_ack(Arc::new(factory.prepare()));

    let client = SocketClient::builder(
        base_options().with_combine_target(2).with_max_connections(1),
        TopicProtocol,
    )
    .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
    .build();

    for i in 0..3 {
        client
            .subscribe(stream(&format!("book.{i}"), sink()), CancellationToken::new())
            .await
            .expect("subscribe");
    }

    // the target is exceeded because the pool is capped
    assert_eq!(client.current_connections(), 1);
    assert_eq!(client.current_subscriptions(), 3);
    assert_eq!(factory.created_count(), 1);
}

#[tokio::test]
async fn cancel_mid_handshake_sends_one_unsubscribe() {
    let factory = Arc::new(MockFactory::new());
    let handle = Arc::new(factory.prepare());

    let client = SocketClient::builder(base_options(), TopicProtocol)
        .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
        .build();

    let token = CancellationToken::new();
    let task = {
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move {
            client
                .subscribe(stream("trades.BTC", sink()), token)
                .await
        })
    };

    // the subscribe request reaches the wire, then the caller cancels
    let first = handle.next_sent().await.expect("subscribe frame");
    let first: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(first["op"], "subscribe");
    token.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, SocketError::CancellationRequested));

    // exactly one unsubscribe goes out
    let second = handle.next_sent().await.expect("unsubscribe frame");
    let second: serde_json::Value = serde_json::from_str(&second).unwrap();
    assert_eq!(second["op"], "unsubscribe");
    assert_eq!(second["topic"], "trades.BTC");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handle.try_next_sent().is_none());

    // nothing retained, connection still usable
    assert_eq!(client.current_subscriptions(), 0);
    assert_eq!(client.current_connections(), 1);

    let task = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .subscribe(stream("trades.ETH", sink()), CancellationToken::new())
                .await
        })
    };
    let resub = handle.next_sent().await.expect("next subscribe");
    let resub: serde_json::Value = serde_json::from_str(&resub).unwrap();
    handle.push_frame(json!({"op": "ack", "id": resub["id"]}).to_string());
    let sub = task.await.unwrap().expect("second subscribe");
    assert!(sub.is_confirmed());
    assert_eq!(client.current_connections(), 1);
}

#[tokio::test]
async fn reconnect_replays_subscriptions_in_order() {
    let factory = Arc::new(MockFactory::new());
    let first = Arc::new(factory.prepare());
    let second = Arc::new(factory.prepare());
    let first_log = auto_ack(Arc::clone(&first));
    let second_log = auto_ack(Arc::clone(&second));

    let client = SocketClient::builder(base_options().with_combine_target(5), TopicProtocol)
        .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
        .build();
    let mut events = client.take_event_receiver().expect("events");

    let trades = sink();
    let books = sink();
    let trade_handle = client
        .subscribe(stream("trades.BTC", Arc::clone(&trades)), CancellationToken::new())
        .await
        .expect("subscribe trades");
    let book_handle = client
        .subscribe(stream("book.BTC", Arc::clone(&books)), CancellationToken::new())
        .await
        .expect("subscribe book");
    assert!(trade_handle.is_confirmed() && book_handle.is_confirmed());

    // data flows pre-drop
    first.push_frame(json!({"topic": "trades.BTC", "seq": 1}).to_string());
    wait_until(|| trades.lock().len() == 1).await;

    // park a query that will never be answered, then drop the transport
    let parked = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .query(
                    id_matched(json!({"op": "ping", "id": next_request_id()}), u64::MAX),
                    CancellationToken::new(),
                )
                .await
        })
    };
    wait_until(|| count_ops(&first_log, "ping") == 1).await;
    first.push_error(TransportError::ReceiveFailed("wire cut".into()));

    let err = parked.await.unwrap().unwrap_err();
    assert!(matches!(err, SocketError::ConnectionLost));

    // the reconnect cycle replays both subscriptions on the new transport
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream open") {
                SocketEvent::Resubscribed { count, .. } => {
                    assert_eq!(count, 2);
                    break;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("resubscribed");

    assert!(trade_handle.is_confirmed());
    assert!(book_handle.is_confirmed());
    let replayed: Vec<String> = second_log
        .lock()
        .iter()
        .filter(|v| v["op"] == "subscribe")
        .map(|v| v["topic"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(replayed, vec!["trades.BTC", "book.BTC"]);

    // updates after the reconnect reach their handlers in order
    second.push_frame(json!({"topic": "trades.BTC", "seq": 2}).to_string());
    second.push_frame(json!({"topic": "trades.BTC", "seq": 3}).to_string());
    second.push_frame(json!({"topic": "book.BTC", "seq": 4}).to_string());
    wait_until(|| trades.lock().len() == 3 && books.lock().len() == 1).await;
    let seqs: Vec<u64> = trades.lock().iter().map(|v| v["seq"].as_u64().unwrap()).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn dispose_unsubscribes_everything_and_goes_terminal() {
    let factory = Arc::new(MockFactory::new());
    let log = auto_ack(Arc::new(factory.prepare()));

    let client = SocketClient::builder(base_options().with_combine_target(10), TopicProtocol)
        .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
        .build();

    for i in 0..4 {
        client
            .subscribe(stream(&format!("feed.{i}"), sink()), CancellationToken::new())
            .await
            .expect("subscribe");
    }

    let periodic = client.query_periodic(
        "ping",
        Duration::from_millis(20),
        |_conn| Some(id_matched(json!({"op": "ping", "id": next_request_id()}), u64::MAX)),
        |_conn, _result| {},
    );

    client.dispose().await;

    // each live stream got a best-effort unsubscribe
    wait_until(|| count_ops(&log, "unsubscribe") == 4).await;
    assert_eq!(client.current_connections(), 0);
    assert_eq!(client.current_subscriptions(), 0);
    assert!(client.is_disposed());

    // the periodic task exits rather than spinning against a dead pool
    timeout(Duration::from_secs(2), periodic)
        .await
        .expect("periodic task exit")
        .expect("periodic task join");

    let err = client
        .subscribe(stream("late", sink()), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SocketError::InvalidOperation(_)));
}

#[tokio::test]
async fn query_response_does_not_leak_to_subscriptions() {
    let factory = Arc::new(MockFactory::new());
    let handle = Arc::new(factory.prepare());
    let log = auto_ack(Arc::clone(&handle));

    let client = SocketClient::builder(base_options(), TopicProtocol)
        .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
        .build();

    let seen = sink();
    client
        .subscribe(stream("dual.topic", Arc::clone(&seen)), CancellationToken::new())
        .await
        .expect("subscribe");

    // this query's reply also carries the subscribed topic
    let query_task = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .query(
                    Query::new(json!({"op": "snapshot", "topic": "dual.topic"}), |msg| {
                        msg.value["topic"] == "dual.topic"
                    }),
                    CancellationToken::new(),
                )
                .await
        })
    };
    wait_until(|| count_ops(&log, "snapshot") == 1).await;

    handle.push_frame(json!({"topic": "dual.topic", "seq": 1}).to_string());
    let response = query_task.await.unwrap().expect("query response");
    assert_eq!(response["seq"], 1);

    // the frame completed the query only; the next one reaches the stream
    handle.push_frame(json!({"topic": "dual.topic", "seq": 2}).to_string());
    wait_until(|| seen.lock().len() == 1).await;
    assert_eq!(seen.lock()[0]["seq"], 2);
}

#[tokio::test]
async fn server_rejection_surfaces_and_sends_no_unsubscribe() {
    let factory = Arc::new(MockFactory::new());
    let handle = Arc::new(factory.prepare());

    let client = SocketClient::builder(base_options(), TopicProtocol)
        .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
        .build();

    let request_id = next_request_id();
    let rejected = TypedStream::<serde_json::Value>::new(["private.fills"], |_| {})
        .with_subscribe(move |_conn| {
            Some(
                id_matched(
                    json!({"op": "subscribe", "topic": "private.fills", "id": request_id}),
                    request_id,
                )
                .with_acceptor(|msg| match msg.value["error"].as_str() {
                    Some(reason) => Err(SocketError::ServerError(reason.to_string())),
                    None => Ok(msg.value.clone()),
                }),
            )
        });

    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.subscribe(rejected, CancellationToken::new()).await })
    };

    let frame = handle.next_sent().await.expect("subscribe frame");
    let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
    handle.push_frame(json!({"id": frame["id"], "error": "permission denied"}).to_string());

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, SocketError::ServerError(ref m) if m == "permission denied"));

    // a rejected subscription owes the server nothing
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handle.try_next_sent().is_none());
    assert_eq!(client.current_subscriptions(), 0);
}

#[tokio::test]
async fn unsubscribe_tears_down_idle_connection() {
    let factory = Arc::new(MockFactory::new());
    let log = auto_ack(Arc::new(factory.prepare()));

    let client = SocketClient::builder(base_options(), TopicProtocol)
        .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
        .build();

    let handle = client
        .subscribe(stream("solo", sink()), CancellationToken::new())
        .await
        .expect("subscribe");
    let id = handle.id();
    assert_eq!(client.current_connections(), 1);

    assert!(handle.unsubscribe().await);
    wait_until(|| count_ops(&log, "unsubscribe") == 1).await;

    // last user subscription gone, the socket goes with it
    wait_until(|| client.current_connections() == 0).await;

    // idempotent
    assert!(!client.unsubscribe(id).await);
}

#[tokio::test]
async fn cancellation_token_fires_unsubscribe_hook() {
    let factory = Arc::new(MockFactory::new());
    let log = auto_ack(Arc::new(factory.prepare()));

    let client = SocketClient::builder(base_options(), TopicProtocol)
        .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
        .build();

    let token = CancellationToken::new();
    client
        .subscribe(stream("hooked", sink()), token.clone())
        .await
        .expect("subscribe");
    assert_eq!(client.current_subscriptions(), 1);

    token.cancel();
    wait_until(|| client.current_subscriptions() == 0).await;
    wait_until(|| count_ops(&log, "unsubscribe") == 1).await;
}

#[tokio::test]
async fn keep_alive_pings_flow() {
    let factory = Arc::new(MockFactory::new());
    let handle = Arc::new(factory.prepare());
    auto_ack(Arc::clone(&handle));

    let client = SocketClient::builder(
        base_options().with_keep_alive(Duration::from_millis(10)),
        TopicProtocol,
    )
    .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
    .build();

    client
        .subscribe(stream("pinged", sink()), CancellationToken::new())
        .await
        .expect("subscribe");

    wait_until(|| handle.ping_count() >= 3).await;
}

#[tokio::test]
async fn no_data_timeout_triggers_reconnect() {
    let factory = Arc::new(MockFactory::new());
    auto_ack(Arc::new(factory.prepare()));
    auto_ack(Arc::new(factory.prepare()));

    let client = SocketClient::builder(
        base_options().with_no_data_timeout(Duration::from_millis(40)),
        TopicProtocol,
    )
    .with_shared_transport_factory(Arc::clone(&factory) as Arc<dyn TransportFactory>)
    .build();
    let mut events = client.take_event_receiver().expect("events");

    let handle = client
        .subscribe(stream("quiet.feed", sink()), CancellationToken::new())
        .await
        .expect("subscribe");

    // nothing arrives; the connection declares the link dead and redials
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream open") {
                SocketEvent::Resubscribed { count, .. } => {
                    assert_eq!(count, 1);
                    break;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("reconnect after silence");
    assert!(handle.is_confirmed());
    assert_eq!(factory.created_count(), 2);
}

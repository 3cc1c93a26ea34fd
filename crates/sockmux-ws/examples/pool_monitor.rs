//! Watch a connection pool under load: many streams, periodic pings, and
//! a state dump every few seconds
//!
//! Run with: cargo run --example pool_monitor -- wss://your-endpoint/ws

use serde_json::json;
use sockmux_ws::{id_matched, SocketClient, SocketOptions, SocketProtocol, TypedStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct TopicProtocol;

impl SocketProtocol for TopicProtocol {
    fn identify(&self, value: &serde_json::Value) -> Vec<String> {
        value["topic"]
            .as_str()
            .map(|t| vec![t.to_string()])
            .unwrap_or_default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://stream.example.com/ws".to_string());

    // three streams per socket, so nine streams spread over three sockets
    let client = SocketClient::builder(
        SocketOptions::new(endpoint)
            .with_combine_target(3)
            .with_max_connections(4)
            .with_no_data_timeout(Duration::from_secs(60)),
        TopicProtocol,
    )
    .build();

    for symbol in ["BTC-USD", "ETH-USD", "SOL-USD"] {
        for channel in ["trades", "book", "ticker"] {
            let topic = format!("{channel}.{symbol}");
            let request_id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            let sub_topic = topic.clone();
            let stream = TypedStream::<serde_json::Value>::new([topic.clone()], move |update| {
                println!("{topic}: {update}");
            })
            .with_subscribe(move |_conn| {
                Some(id_matched(
                    json!({"op": "subscribe", "topic": sub_topic, "id": request_id}),
                    request_id,
                ))
            });
            client.subscribe(stream, CancellationToken::new()).await?;
        }
    }

    let _pinger = client.query_periodic(
        "ping",
        Duration::from_secs(10),
        |_conn| {
            let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            Some(id_matched(json!({"op": "ping", "id": id}), id))
        },
        |conn, result| match result {
            Ok(_) => println!("socket {} ping ok", conn.socket_id()),
            Err(e) => println!("socket {} ping failed: {e}", conn.socket_id()),
        },
    );

    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        println!("{}", client.state_dump());
        println!("incoming: {:.1} kB/s", client.incoming_kbps());
    }
}

//! Subscribe to a trade stream and print updates
//!
//! Run with: cargo run --example trade_stream -- wss://your-endpoint/ws

use serde_json::json;
use sockmux_ws::{id_matched, SocketClient, SocketOptions, SocketProtocol, TypedStream};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Frames route by their `topic` field; requests echo an `id`.
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

    let client = SocketClient::builder(
        SocketOptions::new(endpoint)
            .with_combine_target(5)
            .with_reconnect_interval(Duration::from_secs(1)),
        TopicProtocol,
    )
    .build();

    let mut events = client.take_event_receiver().expect("first take");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("event: {event:?}");
        }
    });

    let stream = TypedStream::<serde_json::Value>::new(["trades.BTC-USD"], |update| {
        println!("trade: {update}");
    })
    .with_subscribe(|_conn| {
        Some(id_matched(
            json!({"op": "subscribe", "topic": "trades.BTC-USD", "id": 1}),
            1,
        ))
    })
    .with_unsubscribe(|| {
        Some(sockmux_ws::Query::new(
            json!({"op": "unsubscribe", "topic": "trades.BTC-USD", "id": 2}),
            |_| false,
        ))
    });

    let handle = client.subscribe(stream, CancellationToken::new()).await?;
    println!("subscribed with id {}", handle.id());

    tokio::time::sleep(Duration::from_secs(30)).await;
    println!("{}", client.state_dump());

    handle.unsubscribe().await;
    client.dispose().await;
    Ok(())
}

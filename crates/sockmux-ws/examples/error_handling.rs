//! Example: error classification and recovery
//!
//! Every subscribe and query outcome carries a `SocketError` that callers
//! can branch on instead of string-matching messages:
//! - `is_retryable` / `retry_after` drive caller-side retry loops
//! - `requires_reconnect` marks failures that take the whole socket down,
//!   where the right move is to wait for the reconnect cycle instead of
//!   hammering the endpoint
//!
//! Run with: cargo run --example error_handling

use sockmux_ws::SocketError;
use std::time::Duration;

fn main() {
    println!("=== Error Classification Example ===\n");

    demonstrate_error_kinds();
    demonstrate_retry_decisions();
}

fn demonstrate_error_kinds() {
    println!("--- Error Kinds ---\n");

    let connect_err = SocketError::cant_connect("wss://stream.example.com/ws", "connection refused");
    print_error_info("Connect", &connect_err);

    print_error_info("Transport drop", &SocketError::ConnectionLost);
    print_error_info("Cancellation / timeout", &SocketError::CancellationRequested);
    print_error_info("Server rejection", &SocketError::ServerError("subscription limit reached".into()));
    print_error_info("Authentication", &SocketError::auth_failed("invalid signature"));
    print_error_info("Missing credentials", &SocketError::NoCredentials);
}

fn print_error_info(kind: &str, error: &SocketError) {
    println!("{kind}:");
    println!("  message:            {error}");
    println!("  retryable:          {}", error.is_retryable());
    println!("  requires reconnect: {}", error.requires_reconnect());
    if let Some(delay) = error.retry_after() {
        println!("  suggested delay:    {delay:?}");
    }
    println!();
}

fn demonstrate_retry_decisions() {
    println!("--- Retry Decisions ---\n");

    let outcomes = [
        ("redial refused", SocketError::cant_connect("wss://x", "refused")),
        ("mid-exchange drop", SocketError::ConnectionLost),
        ("caller cancelled", SocketError::CancellationRequested),
        ("bad topic", SocketError::ServerError("unknown topic".into())),
        ("bad key", SocketError::auth_failed("key revoked")),
    ];

    for (label, error) in &outcomes {
        println!("{label}: {}", describe_decision(error));
    }

    println!("\nThe same branching around a real subscribe call:\n");
    println!("```rust");
    println!("match client.subscribe(stream, token.clone()).await {{");
    println!("    Ok(handle) => return Ok(handle),");
    println!("    Err(e) if e.is_retryable() => {{");
    println!("        let delay = e.retry_after().unwrap_or(Duration::from_secs(1));");
    println!("        tokio::time::sleep(delay).await;");
    println!("        // then try again");
    println!("    }}");
    println!("    Err(e) if e.requires_reconnect() => {{");
    println!("        // the connection tears itself down and redials;");
    println!("        // resubscribe once events report it healthy");
    println!("    }}");
    println!("    Err(e) => return Err(e), // surface to the caller");
    println!("}}");
    println!("```");

    println!("\n=== Example Complete ===");
}

fn describe_decision(error: &SocketError) -> String {
    if error.is_retryable() {
        let delay = error.retry_after().unwrap_or(Duration::from_secs(1));
        format!("retry after {delay:?}")
    } else if error.requires_reconnect() {
        "let the reconnect cycle run, then resubscribe".to_string()
    } else {
        "surface to the caller".to_string()
    }
}

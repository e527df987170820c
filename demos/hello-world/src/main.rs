//! Hello World example for the Mortar transport.
//!
//! Demonstrates:
//! - Implementing a `Dispatcher` for a small greeter service
//! - Starting a listener and connecting to it
//! - Concurrent requests on one connection, an error response, and an event
//!
//! Run with `RUST_LOG=debug` to see the transport's logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mortar::prelude::*;
use mortar::{BoxFuture, LayerStack, TracingLayer};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Error)]
pub enum GreetError {
    #[error("name cannot be empty")]
    EmptyName,
    #[error("name too long: {0} characters (max 100)")]
    NameTooLong(usize),
}

impl From<GreetError> for RpcError {
    fn from(err: GreetError) -> Self {
        RpcError::new(RpcError::INVALID_ARGUMENT, err.to_string())
    }
}

/// Greeter service answering `greeter.greet` and `greeter.count`.
struct Greeter {
    count: AtomicU64,
}

impl Greeter {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    fn greet(&self, name: &str) -> Result<String, GreetError> {
        if name.is_empty() {
            return Err(GreetError::EmptyName);
        }
        if name.len() > 100 {
            return Err(GreetError::NameTooLong(name.len()));
        }

        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(format!("Hello, {name}!"))
    }
}

impl Dispatcher for Greeter {
    fn dispatch(&self, request: IncomingRequest) -> BoxFuture<'_, Result<Bytes, RpcError>> {
        Box::pin(async move {
            match request.method.as_str() {
                "greeter.greet" => {
                    let name = String::from_utf8_lossy(&request.payload);
                    let greeting = self.greet(&name)?;
                    Ok(Bytes::from(greeting))
                }
                "greeter.count" => {
                    let count = self.count.load(Ordering::Relaxed);
                    Ok(Bytes::from(count.to_string()))
                }
                other => Err(RpcError::new(
                    RpcError::UNIMPLEMENTED,
                    format!("unknown method {other}"),
                )),
            }
        })
    }

    fn notify(&self, event: IncomingRequest) -> BoxFuture<'_, ()> {
        tracing::info!(
            method = %event.method,
            from = %event.remote_addr,
            payload = %String::from_utf8_lossy(&event.payload),
            "event received"
        );
        Box::pin(std::future::ready(()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let server = Transport::builder()
        .dispatcher(Greeter::new())
        .layer_stack(LayerStack::new().with(TracingLayer::new("greeter")))
        .build();
    let listener = server.make_listener("127.0.0.1:0")?;
    let addr = listener.start().await?;

    let client = Transport::builder()
        .layer_stack(LayerStack::new().with(TracingLayer::new("hello-world")))
        .keep_alive(Duration::from_secs(30), Duration::from_secs(5))
        .build();
    let conn = client.connect(&format!("mortar://{addr}")).await?;

    println!("Mortar Hello World");
    println!("==================\n");

    // Several calls in flight on the same connection
    let names = ["World", "Mortar", "Ferris"];
    let calls = names.iter().map(|name| {
        let conn = conn.clone();
        async move {
            let ctx = Context::with_timeout(Duration::from_secs(5));
            let reply = conn
                .send_request(&ctx, "greeter.greet", Bytes::from(name.to_string()))
                .await?;
            Ok::<_, MortarError>((name, reply))
        }
    });
    for result in futures::future::join_all(calls).await {
        let (name, reply) = result?;
        println!("  greet({name:?}) = {}", String::from_utf8_lossy(&reply));
    }

    match conn
        .send_request(&Context::new(), "greeter.greet", Bytes::new())
        .await
    {
        Ok(_) => println!("  Unexpected success"),
        Err(e) => println!("  greet(\"\") = Error: {e}"),
    }

    conn.send_event(&Context::new(), "greeter.log", Bytes::from_static(b"done greeting"))
        .await?;

    let count = conn
        .send_request(&Context::new(), "greeter.count", Bytes::new())
        .await?;
    println!("  count() = {}", String::from_utf8_lossy(&count));

    conn.stop().await;
    server.stop().await;

    println!("\nExample completed successfully!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greet() {
        let greeter = Greeter::new();
        assert_eq!(greeter.greet("Test").unwrap(), "Hello, Test!");
        assert_eq!(greeter.count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_greet_errors() {
        let greeter = Greeter::new();
        assert!(matches!(greeter.greet(""), Err(GreetError::EmptyName)));

        let long_name = "x".repeat(200);
        assert!(matches!(
            greeter.greet(&long_name),
            Err(GreetError::NameTooLong(200))
        ));

        let rpc = RpcError::from(GreetError::EmptyName);
        assert_eq!(rpc.code, RpcError::INVALID_ARGUMENT);
    }

    #[tokio::test]
    async fn test_over_the_wire() {
        let server = Transport::builder().dispatcher(Greeter::new()).build();
        let listener = server.make_listener("127.0.0.1:0").unwrap();
        let addr = listener.start().await.unwrap();

        let client = Transport::builder().build();
        let conn = client.connect(&format!("mortar://{addr}")).await.unwrap();

        let reply = conn
            .send_request(&Context::new(), "greeter.greet", Bytes::from_static(b"Wire"))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"Hello, Wire!"));

        server.stop().await;
    }
}

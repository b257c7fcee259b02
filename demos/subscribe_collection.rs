//! Collection subscription example.
//!
//! Connects to a realtime endpoint, subscribes to one collection, and prints
//! every payload until the stream ends or Ctrl-C is pressed.
//!
//! Before running:
//! - Replace the base URL and access token placeholders below.
//! - Set `RUST_LOG=realtime_sdk=debug` to see connection lifecycle logs.

use std::error::Error;

use realtime_sdk::{
    AuthMode, RealtimeClient, RealtimeOptions, SubscribeOptions, Subscription, SubscriptionPayload,
    WebSocketEvent, WebSocketEventKind,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let base_url = "https://REPLACE_WITH_HOST".to_string();
    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();
    let collection = "messages".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RealtimeClient::new(
            base_url,
            RealtimeOptions::default()
                .with_auth_mode(AuthMode::Handshake)
                .with_access_token(SecretString::new(access_token)),
        );
        let _closed = client.on_websocket(WebSocketEventKind::Close, |event: &WebSocketEvent| {
            println!("socket closed: {event:?}");
        });

        client.connect().await?;
        println!("connected endpoint={}", client.endpoint());

        let mut subscription: Subscription<Value> = client.subscribe(
            collection,
            SubscribeOptions::default().with_query(json!({"fields": ["*"]})),
        )?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                item = subscription.recv() => match item {
                    Some(Ok(SubscriptionPayload::Delete(ids))) => println!("deleted ids={ids:?}"),
                    Some(Ok(payload)) => println!("{:?}: {payload:?}", payload.kind()),
                    Some(Err(err)) => eprintln!("subscription error: {err}"),
                    None => break,
                },
            }
        }

        subscription.unsubscribe();
        client.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}

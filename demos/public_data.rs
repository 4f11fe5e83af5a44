// Subscribe to public market data and print pushed notifications.
//
// Usage: public_data [ws-uri]

use serde_json::json;
use tradewire::{handler_fn, CallbackClient, ClientConfig, Routed};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://ws.example-exchange.com/ws/".to_owned());
    let cfg = ClientConfig::new(uri);

    let on_notification = handler_fn(|message| {
        println!("notification: {message}");
        Ok(Routed::Handled(message))
    });

    let client = CallbackClient::new(cfg, on_notification)?;
    client.run().await?;
    client
        .send_subscribe(json!({"e": "subscribe", "rooms": ["tickers"]}))
        .await?;

    tokio::signal::ctrl_c().await?;
    client.stop().await;
    Ok(())
}

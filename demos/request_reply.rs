// Issue authenticated requests and print the resolved payloads.
//
// Usage: request_reply <ws-uri> <api-key> <api-secret>

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

    let mut args = std::env::args().skip(1);
    let uri = args
        .next()
        .unwrap_or_else(|| "wss://ws.example-exchange.com/ws/".to_owned());
    let key = args.next().unwrap_or_default();
    let secret = args.next().unwrap_or_default();

    let cfg = ClientConfig::new(uri).with_auth(key, secret);
    let on_notification = handler_fn(|message| {
        println!("notification: {message}");
        Ok(Routed::Handled(message))
    });

    let client = CallbackClient::new(cfg, on_notification)?;
    client.run().await?;

    let balance = client
        .request(CallbackClient::format_message("get-balance", None))
        .await?;
    println!("balance: {balance}");

    let ticker = client
        .request(json!({"e": "ticker", "data": ["BTC", "USD"]}))
        .await?;
    println!("ticker: {ticker}");

    client.stop().await;
    Ok(())
}

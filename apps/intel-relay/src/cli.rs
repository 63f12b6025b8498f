use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "intel-relay")]
#[command(about = "Real-time intel relay server and watch client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (default)
    Serve,

    /// Connect as a dashboard client and print every message received
    Watch {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Company to subscribe to after connecting
        #[arg(short, long)]
        company: Option<String>,

        /// Client label reported in relay stats
        #[arg(long, default_value = "intel-relay-watch")]
        client_id: String,

        /// Exit after this many messages
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

/// Relay socket URL with the client label percent-encoded into the query.
fn watch_url(base: &str, client_id: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/ws/ai", base.trim_end_matches('/')))
        .map_err(|e| anyhow!("Invalid relay URL {}: {}", base, e))?;
    url.query_pairs_mut().append_pair("client_id", client_id);
    Ok(url)
}

pub async fn run_watch_client(
    url: String,
    company: Option<String>,
    client_id: String,
    limit: Option<usize>,
) -> Result<()> {
    let ws_url = watch_url(&url, &client_id)?;
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(ws_url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    if let Some(company) = company {
        let subscribe = json!({"type": "subscribe", "company_id": company});
        write.send(Message::Text(subscribe.to_string().into())).await?;
    }

    let mut received = 0usize;
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                if parsed.get("type").and_then(Value::as_str) == Some("ping") {
                    let pong = json!({"type": "pong"}).to_string();
                    write.send(Message::Text(pong.into())).await?;
                    continue;
                }
                println!("{}", text.as_str());
                received += 1;
                if limit.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
            Message::Close(frame) => {
                debug!("Relay closed connection: {:?}", frame);
                break;
            }
            _ => {}
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

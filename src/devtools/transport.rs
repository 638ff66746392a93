// =============================================================================
// DevTools Transport — raw WebSocket RPC + HTTP target discovery
// =============================================================================
//
// Two surfaces of the Chrome DevTools remote-debugging protocol:
//   - HTTP: `GET /json`, `GET /json/new`, `GET /json/close/<id>` on the
//     browser's debugging port, used to discover and open tabs.
//   - WebSocket: one connection per tab, JSON-RPC style requests correlated
//     by a numeric `id`, used to send `Runtime.evaluate`.
//
// Modeled on `binance/client.rs`'s signed-request builder for the HTTP side
// and on `market_data/trade_stream.rs`'s `connect_async` + split read/write
// loop for the WebSocket side, adapted here from a one-way feed into a
// request/response RPC by keeping a table of in-flight call ids.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

/// One open DevTools target, as returned by `GET /json` or `/json/new`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TargetInfo {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: String,
}

/// List every open tab on `port` via `GET /json`.
pub async fn list_targets(port: u16) -> Result<Vec<TargetInfo>> {
    let url = format!("http://127.0.0.1:{port}/json");
    let resp = reqwest::get(&url)
        .await
        .with_context(|| format!("GET {url} failed"))?;
    let targets: Vec<TargetInfo> = resp
        .json()
        .await
        .context("failed to parse /json target list")?;
    Ok(targets)
}

/// Open a new tab on `port` navigated to `url` via `GET /json/new?<url>`.
pub async fn open_tab(port: u16, url: &str) -> Result<TargetInfo> {
    let endpoint = format!("http://127.0.0.1:{port}/json/new?{url}");
    let resp = reqwest::Client::new()
        .put(&endpoint)
        .send()
        .await
        .with_context(|| format!("PUT {endpoint} failed"))?;
    let target: TargetInfo = resp
        .json()
        .await
        .context("failed to parse /json/new response")?;
    Ok(target)
}

/// A single WebSocket connection to one tab's DevTools endpoint, able to
/// issue correlated `Runtime.evaluate` requests.
pub struct DevToolsConnection {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    outbound: tokio::sync::Mutex<futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >>,
}

impl DevToolsConnection {
    /// Connect to `ws_url` (a tab's `webSocketDebuggerUrl`) and spawn the
    /// background read loop that demultiplexes responses by `id`.
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        let (stream, _response) = tokio_tungstenite::connect_async(ws_url)
            .await
            .with_context(|| format!("failed to connect to devtools websocket {ws_url}"))?;
        let (write, mut read) = stream.split();

        let conn = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: tokio::sync::Mutex::new(write),
        });

        let reader_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        reader_conn.dispatch_incoming(&text);
                    }
                    Ok(Message::Close(_)) => {
                        debug!("devtools websocket closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "devtools websocket read error");
                        break;
                    }
                }
            }
            // Fail every still-pending call so callers don't hang forever on
            // a connection that just died.
            let mut pending = reader_conn.pending.lock();
            for (_, tx) in pending.drain() {
                let _ = tx.send(json!({ "__transport_closed": true }));
            }
        });

        Ok(conn)
    }

    fn dispatch_incoming(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            warn!("devtools websocket sent non-JSON frame, dropping");
            return;
        };
        let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
            // An unsolicited event notification (we don't subscribe to any),
            // ignore.
            return;
        };
        let tx = self.pending.lock().remove(&id);
        if let Some(tx) = tx {
            let _ = tx.send(value);
        }
    }

    /// Send `Runtime.evaluate` with `expression`, waiting up to `timeout` for
    /// a correlated response. Returns the raw JSON-RPC envelope (the caller
    /// classifies it via [`crate::devtools::classifier::classify`]).
    pub async fn evaluate(&self, expression: &str, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = json!({
            "id": id,
            "method": "Runtime.evaluate",
            "params": {
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": true,
            }
        });

        {
            let mut sink = self.outbound.lock().await;
            sink.send(Message::Text(request.to_string()))
                .await
                .context("failed to send Runtime.evaluate over devtools websocket")?;
        }

        let response = tokio::time::timeout(timeout, rx)
            .await
            .context("devtools evaluate timed out waiting for response")?
            .context("devtools connection closed before a response arrived")?;

        if response.get("__transport_closed").is_some() {
            anyhow::bail!("devtools websocket transport closed mid-call");
        }

        // A JSON-RPC error envelope (protocol-level failure, not a JS
        // exception) surfaces as `{"error": {...}}` instead of `{"result": ...}`.
        if let Some(err) = response.get("error") {
            anyhow::bail!("devtools protocol error: {err}");
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_info_deserializes_expected_shape() {
        let json = r#"{"id":"abc","url":"https://trader.tradovate.com/","webSocketDebuggerUrl":"ws://127.0.0.1:9222/devtools/page/abc"}"#;
        let t: TargetInfo = serde_json::from_str(json).unwrap();
        assert_eq!(t.id, "abc");
        assert!(t.ws_url.starts_with("ws://"));
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use crate::adapter::{with_retry, ChainAdapter};
use crate::error::AdapterError;
use crate::models::{ChainKey, Network, NormalizedBlock, NormalizedTx, TxPayload, XrpAmount};

const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// XRP Ledger adapter speaking the rippled WebSocket API. A single
/// connection is kept open and shared; commands are matched to responses by
/// id. The connection is dropped and re-dialed on any transport error.
pub struct XrpAdapter {
    network: Network,
    url: String,
    next_id: AtomicU64,
    conn: Mutex<Option<WsStream>>,
}

impl XrpAdapter {
    pub fn new(network: Network, url: String) -> Self {
        Self {
            network,
            url,
            next_id: AtomicU64::new(1),
            conn: Mutex::new(None),
        }
    }

    /// Send one command and await the response carrying the same id. Returns
    /// the full response object; callers inspect `status`/`error`.
    async fn command(&self, mut body: Value) -> Result<Value, AdapterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        body["id"] = json!(id);

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let (ws, _) = connect_async(self.url.as_str()).await?;
            *guard = Some(ws);
        }
        let Some(ws) = guard.as_mut() else {
            return Err(AdapterError::Ws(tungstenite::Error::ConnectionClosed));
        };

        let result = Self::exchange(ws, id, body).await;
        if result.is_err() {
            // a failed or timed-out exchange leaves unread frames behind;
            // start clean next time
            *guard = None;
        }
        result
    }

    async fn exchange(ws: &mut WsStream, id: u64, body: Value) -> Result<Value, AdapterError> {
        ws.send(tungstenite::Message::Text(body.to_string()))
            .await?;
        loop {
            let msg = tokio::time::timeout(RPC_TIMEOUT, ws.next())
                .await
                .map_err(|_| AdapterError::Timeout)?
                .ok_or(AdapterError::Ws(tungstenite::Error::ConnectionClosed))??;
            match msg {
                tungstenite::Message::Text(text) => {
                    let v: Value = serde_json::from_str(&text)
                        .map_err(|e| AdapterError::Malformed(format!("{e}")))?;
                    if v.get("id").and_then(Value::as_u64) == Some(id) {
                        return Ok(v);
                    }
                    // stray stream messages (ledger closes etc.) are ignored
                }
                tungstenite::Message::Close(_) => {
                    return Err(AdapterError::Ws(tungstenite::Error::ConnectionClosed))
                }
                _ => {}
            }
        }
    }
}

impl ChainAdapter for XrpAdapter {
    fn chain(&self) -> ChainKey {
        ChainKey::Xrp
    }

    fn network(&self) -> Network {
        self.network
    }

    async fn tip_height(&self) -> Result<u64, AdapterError> {
        let resp = with_retry(ChainKey::Xrp, self.network, "server_info", || {
            self.command(json!({ "command": "server_info" }))
        })
        .await?;
        let resp = expect_success(resp)?;
        resp.pointer("/info/validated_ledger/seq")
            .and_then(Value::as_u64)
            .ok_or_else(|| AdapterError::Malformed("server_info: no validated ledger".into()))
    }

    async fn fetch_block(&self, height: u64) -> Result<Option<NormalizedBlock>, AdapterError> {
        let resp = with_retry(ChainKey::Xrp, self.network, "ledger", || {
            self.command(json!({
                "command": "ledger",
                "ledger_index": height,
                "transactions": true,
                "expand": true,
            }))
        })
        .await?;

        if resp.get("error").and_then(Value::as_str) == Some("lgrNotFound") {
            return Ok(None);
        }
        let result = expect_success(resp)?;
        let ledger = result
            .get("ledger")
            .ok_or_else(|| AdapterError::Malformed("ledger: missing ledger object".into()))?;
        let hash = ledger
            .get("ledger_hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let txs = ledger
            .get("transactions")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(normalize_payment).collect())
            .unwrap_or_default();

        Ok(Some(NormalizedBlock { height, hash, txs }))
    }
}

fn expect_success(resp: Value) -> Result<Value, AdapterError> {
    match resp.get("status").and_then(Value::as_str) {
        Some("success") => Ok(resp.get("result").cloned().unwrap_or(Value::Null)),
        _ => {
            let err = resp
                .get("error_message")
                .or_else(|| resp.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(AdapterError::Rpc(err.to_string()))
        }
    }
}

/// Normalize one expanded ledger transaction. Everything that is not a
/// Payment is dropped here; the `Amount` keeps its native drops-vs-issued
/// distinction for the deposit writer to resolve.
fn normalize_payment(tx: &Value) -> Option<NormalizedTx> {
    if tx.get("TransactionType")?.as_str()? != "Payment" {
        return None;
    }
    let hash = tx.get("hash")?.as_str()?.to_string();
    let from = tx.get("Account")?.as_str()?.to_string();
    let to = tx.get("Destination")?.as_str()?.to_string();
    let amount = match tx.get("Amount")? {
        Value::String(drops) => XrpAmount::Drops(drops.clone()),
        Value::Object(o) => XrpAmount::Issued {
            currency: o.get("currency")?.as_str()?.to_string(),
            value: o.get("value")?.as_str()?.to_string(),
        },
        _ => return None,
    };

    Some(NormalizedTx {
        hash,
        payload: TxPayload::Payment { from, to, amount },
    })
}

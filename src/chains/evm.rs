use ethers::types::U256;
use ethers::utils::keccak256;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::adapter::{with_retry, ChainAdapter};
use crate::error::AdapterError;
use crate::models::{ChainKey, Network, NetworkVersion, NormalizedBlock, NormalizedTx, TxPayload};

const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const RESUBSCRIBE_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// JSON-RPC adapter for Ethereum-family chains (eth, bsc). Native transfers
/// come straight off the block; ERC-20/BEP-20 transfers are decoded from
/// receipt logs against the `Transfer(address,address,uint256)` topic.
pub struct EvmAdapter {
    chain: ChainKey,
    network: Network,
    client: reqwest::Client,
    http_url: String,
    ws_url: Option<String>,
    transfer_topic: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawBlock {
    hash: String,
    #[serde(default)]
    transactions: Vec<RawTx>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTx {
    hash: String,
    from: String,
    to: Option<String>,
    value: String,
    #[serde(default)]
    input: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawReceipt {
    #[serde(default)]
    logs: Vec<RawLog>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    data: String,
}

impl EvmAdapter {
    pub fn new(
        chain: ChainKey,
        network: Network,
        http_url: String,
        ws_url: Option<String>,
    ) -> Result<Self, AdapterError> {
        // HTTP/1.1 only: some RPC providers fail h2 ALPN negotiation
        let client = reqwest::ClientBuilder::new()
            .http1_only()
            .timeout(RPC_TIMEOUT)
            .build()?;
        let transfer_topic = format!(
            "0x{}",
            hex::encode(keccak256(b"Transfer(address,address,uint256)"))
        );
        Ok(Self {
            chain,
            network,
            client,
            http_url,
            ws_url,
            transfer_topic,
        })
    }

    async fn rpc_request(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let resp = self
            .client
            .post(&self.http_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(AdapterError::RateLimited);
        }
        if !status.is_success() {
            return Err(AdapterError::Status(status));
        }

        let env: Value = resp.json().await?;
        if let Some(err) = env.get("error").filter(|e| !e.is_null()) {
            return Err(AdapterError::Rpc(err.to_string()));
        }
        Ok(env.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Receipt logs for one transaction. Empty when the receipt is not
    /// available (should not happen for a mined tx, but providers prune).
    async fn receipt_logs(&self, tx_hash: &str) -> Result<Vec<RawLog>, AdapterError> {
        let v = with_retry(self.chain, self.network, "eth_getTransactionReceipt", || {
            self.rpc_request("eth_getTransactionReceipt", json!([tx_hash]))
        })
        .await?;
        if v.is_null() {
            return Ok(Vec::new());
        }
        let receipt: RawReceipt = serde_json::from_value(v)
            .map_err(|e| AdapterError::Malformed(format!("receipt: {e}")))?;
        Ok(receipt.logs)
    }
}

impl ChainAdapter for EvmAdapter {
    fn chain(&self) -> ChainKey {
        self.chain
    }

    fn network(&self) -> Network {
        self.network
    }

    async fn tip_height(&self) -> Result<u64, AdapterError> {
        let v = with_retry(self.chain, self.network, "eth_blockNumber", || {
            self.rpc_request("eth_blockNumber", json!([]))
        })
        .await?;
        let hex_str = v
            .as_str()
            .ok_or_else(|| AdapterError::Malformed("eth_blockNumber: not a string".into()))?;
        parse_hex_u64(hex_str)
    }

    async fn fetch_block(&self, height: u64) -> Result<Option<NormalizedBlock>, AdapterError> {
        let v = with_retry(self.chain, self.network, "eth_getBlockByNumber", || {
            self.rpc_request(
                "eth_getBlockByNumber",
                json!([format!("0x{height:x}"), true]),
            )
        })
        .await?;
        if v.is_null() {
            return Ok(None);
        }
        let raw: RawBlock = serde_json::from_value(v)
            .map_err(|e| AdapterError::Malformed(format!("block {height}: {e}")))?;

        let mut txs = Vec::new();
        for tx in &raw.transactions {
            if tx.to.is_none() {
                // contract creation
                continue;
            }
            if is_native(tx) {
                match native_transfer(tx) {
                    Ok(n) => txs.push(n),
                    Err(e) => warn!(
                        chain = %self.chain,
                        network = %self.network,
                        block = height,
                        tx_hash = %tx.hash,
                        "skipping malformed transaction: {e}"
                    ),
                }
            } else {
                // calldata present: only receipt logs tell us whether this
                // was a token transfer our wallets care about
                match self.receipt_logs(&tx.hash).await {
                    Ok(logs) => {
                        txs.extend(token_transfers(self.chain, tx, &logs, &self.transfer_topic))
                    }
                    Err(e) => warn!(
                        chain = %self.chain,
                        network = %self.network,
                        block = height,
                        tx_hash = %tx.hash,
                        "skipping transaction, receipt unavailable: {e}"
                    ),
                }
            }
        }

        Ok(Some(NormalizedBlock {
            height,
            hash: raw.hash,
            txs,
        }))
    }

    async fn subscribe(&self, heights: mpsc::UnboundedSender<u64>) -> bool {
        let Some(ws_url) = self.ws_url.clone() else {
            return false;
        };
        let chain = self.chain;
        let network = self.network;
        tokio::spawn(async move {
            loop {
                match run_head_subscription(&ws_url, &heights).await {
                    Ok(()) => info!(chain = %chain, network = %network, "newHeads stream ended"),
                    Err(e) => {
                        warn!(chain = %chain, network = %network, "newHeads subscription error: {e}")
                    }
                }
                if heights.is_closed() {
                    break;
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });
        true
    }
}

async fn run_head_subscription(
    ws_url: &str,
    heights: &mpsc::UnboundedSender<u64>,
) -> Result<(), AdapterError> {
    let (mut ws, _) = connect_async(ws_url).await?;
    ws.send(Message::Text(
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"],
        })
        .to_string(),
    ))
    .await?;

    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                if let Some(height) = parse_new_head(&text) {
                    if heights.send(height).is_err() {
                        return Ok(());
                    }
                }
            }
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
    Ok(())
}

/// Extract the height from a `newHeads` notification, ignoring everything
/// else on the stream (subscription acks, pings).
fn parse_new_head(text: &str) -> Option<u64> {
    let v: Value = serde_json::from_str(text).ok()?;
    if v.get("method")?.as_str()? != "eth_subscription" {
        return None;
    }
    let number = v.get("params")?.get("result")?.get("number")?.as_str()?;
    parse_hex_u64(number).ok()
}

fn is_native(tx: &RawTx) -> bool {
    tx.input.is_empty() || tx.input == "0x"
}

fn native_transfer(tx: &RawTx) -> Result<NormalizedTx, AdapterError> {
    let to = tx.to.as_deref().unwrap_or_default();
    Ok(NormalizedTx {
        hash: tx.hash.clone(),
        payload: TxPayload::NativeTransfer {
            from: tx.from.to_lowercase(),
            to: to.to_lowercase(),
            amount_raw: hex_to_decimal(&tx.value)?,
        },
    })
}

/// Decode ERC-20 `Transfer` events emitted by the called contract. One tx
/// can carry several transfer logs; each becomes its own normalized entry.
fn token_transfers(
    chain: ChainKey,
    tx: &RawTx,
    logs: &[RawLog],
    transfer_topic: &str,
) -> Vec<NormalizedTx> {
    let Some(contract) = tx.to.as_deref() else {
        return Vec::new();
    };
    let contract = contract.to_lowercase();

    let mut out = Vec::new();
    for log in logs {
        if log.topics.len() < 3
            || !log.topics[0].eq_ignore_ascii_case(transfer_topic)
            || !log.address.eq_ignore_ascii_case(&contract)
        {
            continue;
        }
        let (Some(from), Some(to)) = (
            topic_to_address(&log.topics[1]),
            topic_to_address(&log.topics[2]),
        ) else {
            continue;
        };
        let Ok(amount_raw) = hex_to_decimal(&log.data) else {
            continue;
        };
        out.push(NormalizedTx {
            hash: tx.hash.clone(),
            payload: TxPayload::TokenTransfer {
                from,
                to,
                contract_address: Some(contract.clone()),
                asset_symbol: None,
                amount_raw,
                standard: NetworkVersion::evm_standard(chain),
            },
        });
    }
    out
}

/// Last 20 bytes of a 32-byte log topic, as a lowercase 0x-address.
fn topic_to_address(topic: &str) -> Option<String> {
    let hex_part = topic.strip_prefix("0x").unwrap_or(topic);
    if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", hex_part[24..].to_lowercase()))
}

fn parse_hex_u64(s: &str) -> Result<u64, AdapterError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| AdapterError::Malformed(format!("hex quantity {s:?}: {e}")))
}

/// 0x-prefixed hex quantity (up to 256 bits) to a decimal digit string.
fn hex_to_decimal(s: &str) -> Result<String, AdapterError> {
    let hex_part = s.trim_start_matches("0x");
    if hex_part.is_empty() {
        return Ok("0".to_string());
    }
    let bytes =
        hex::decode(pad_even(hex_part)).map_err(|e| AdapterError::Malformed(format!("{e}")))?;
    if bytes.len() > 32 {
        return Err(AdapterError::Malformed(format!(
            "quantity wider than 256 bits: {s}"
        )));
    }
    Ok(U256::from_big_endian(&bytes).to_string())
}

fn pad_even(hex_part: &str) -> String {
    if hex_part.len() % 2 == 1 {
        format!("0{hex_part}")
    } else {
        hex_part.to_string()
    }
}

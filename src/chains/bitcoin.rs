use serde::Deserialize;
use serde_json::{json, Value};

use crate::adapter::{with_retry, ChainAdapter};
use crate::error::AdapterError;
use crate::models::{ChainKey, Network, NormalizedBlock, NormalizedTx, TxOutput, TxPayload};

const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// bitcoind error codes
const ERR_OUT_OF_RANGE: i64 = -8;
const ERR_NOT_FOUND: i64 = -5;

/// Bitcoin Core JSON-RPC adapter. Blocks are fetched at verbosity 2 so each
/// transaction arrives with decoded outputs; one tx may credit several
/// wallets through its vouts.
pub struct BitcoinAdapter {
    network: Network,
    client: reqwest::Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    hash: String,
    #[serde(default)]
    tx: Vec<RawTx>,
}

#[derive(Debug, Deserialize)]
struct RawTx {
    txid: String,
    #[serde(default)]
    vin: Vec<RawVin>,
    #[serde(default)]
    vout: Vec<RawVout>,
}

#[derive(Debug, Deserialize)]
struct RawVin {
    #[serde(default)]
    prevout: Option<RawPrevout>,
}

#[derive(Debug, Deserialize)]
struct RawPrevout {
    #[serde(rename = "scriptPubKey")]
    script_pub_key: RawScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct RawVout {
    /// Decimal BTC. Kept as a JSON number so the on-wire digits survive.
    value: serde_json::Number,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: RawScriptPubKey,
}

#[derive(Debug, Default, Deserialize)]
struct RawScriptPubKey {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    addresses: Option<Vec<String>>,
}

impl RawScriptPubKey {
    /// Older nodes report `addresses`, newer ones a single `address`.
    fn all_addresses(&self) -> Vec<&str> {
        if let Some(list) = &self.addresses {
            list.iter().map(String::as_str).collect()
        } else {
            self.address.as_deref().into_iter().collect()
        }
    }
}

impl BitcoinAdapter {
    pub fn new(
        network: Network,
        url: String,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, AdapterError> {
        let client = reqwest::ClientBuilder::new()
            .http1_only()
            .timeout(RPC_TIMEOUT)
            .build()?;
        Ok(Self {
            network,
            client,
            url,
            username,
            password,
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<RpcEnvelope, AdapterError> {
        let mut req = self.client.post(&self.url).json(&json!({
            "jsonrpc": "1.0",
            "id": "deposit-tracker",
            "method": method,
            "params": params,
        }));
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        // bitcoind reports domain errors with a 500 and an error body, so
        // the body has to be inspected before the status
        match serde_json::from_str::<RpcEnvelope>(&text) {
            Ok(env) => Ok(env),
            Err(_) if !status.is_success() => Err(AdapterError::Status(status)),
            Err(e) => Err(AdapterError::Malformed(format!("{method}: {e}"))),
        }
    }

    /// Unwrap an envelope, treating not-found codes as `None`.
    fn unwrap_result(env: RpcEnvelope, method: &str) -> Result<Option<Value>, AdapterError> {
        match env.error {
            Some(e) if e.code == ERR_OUT_OF_RANGE || e.code == ERR_NOT_FOUND => Ok(None),
            Some(e) => Err(AdapterError::Rpc(format!("{method}: {} ({})", e.message, e.code))),
            None => Ok(Some(env.result)),
        }
    }
}

impl ChainAdapter for BitcoinAdapter {
    fn chain(&self) -> ChainKey {
        ChainKey::Btc
    }

    fn network(&self) -> Network {
        self.network
    }

    async fn tip_height(&self) -> Result<u64, AdapterError> {
        let env = with_retry(ChainKey::Btc, self.network, "getblockcount", || {
            self.rpc("getblockcount", json!([]))
        })
        .await?;
        let result = Self::unwrap_result(env, "getblockcount")?
            .ok_or_else(|| AdapterError::Malformed("getblockcount: no result".into()))?;
        result
            .as_u64()
            .ok_or_else(|| AdapterError::Malformed("getblockcount: not an integer".into()))
    }

    async fn fetch_block(&self, height: u64) -> Result<Option<NormalizedBlock>, AdapterError> {
        let env = with_retry(ChainKey::Btc, self.network, "getblockhash", || {
            self.rpc("getblockhash", json!([height]))
        })
        .await?;
        let Some(hash) = Self::unwrap_result(env, "getblockhash")? else {
            return Ok(None);
        };
        let hash = hash
            .as_str()
            .ok_or_else(|| AdapterError::Malformed("getblockhash: not a string".into()))?
            .to_string();

        let env = with_retry(ChainKey::Btc, self.network, "getblock", || {
            self.rpc("getblock", json!([&hash, 2]))
        })
        .await?;
        let Some(result) = Self::unwrap_result(env, "getblock")? else {
            return Ok(None);
        };
        let raw: RawBlock = serde_json::from_value(result)
            .map_err(|e| AdapterError::Malformed(format!("block {height}: {e}")))?;
        Ok(Some(normalize_block(height, raw)))
    }
}

fn normalize_block(height: u64, raw: RawBlock) -> NormalizedBlock {
    let txs = raw
        .tx
        .into_iter()
        .filter_map(|tx| {
            let outputs: Vec<TxOutput> = tx
                .vout
                .iter()
                .flat_map(|v| {
                    let amount = v.value.to_string();
                    v.script_pub_key
                        .all_addresses()
                        .into_iter()
                        .map(move |a| TxOutput {
                            address: a.to_string(),
                            amount: amount.clone(),
                        })
                })
                .collect();
            if outputs.is_empty() {
                return None;
            }
            let input_first_address = tx
                .vin
                .first()
                .and_then(|v| v.prevout.as_ref())
                .and_then(|p| p.script_pub_key.address.clone());
            Some(NormalizedTx {
                hash: tx.txid,
                payload: TxPayload::MultiOutput {
                    outputs,
                    input_first_address,
                },
            })
        })
        .collect();

    NormalizedBlock {
        height,
        hash: raw.hash,
        txs,
    }
}

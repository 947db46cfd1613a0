use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::adapter::{with_retry, ChainAdapter};
use crate::error::AdapterError;
use crate::models::{ChainKey, Network, NetworkVersion, NormalizedBlock, NormalizedTx, TxPayload};

const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Tron HTTP API adapter. Block payloads carry hex addresses (0x41-prefixed)
/// which are converted to base58check at this boundary; downstream code only
/// ever sees T-addresses.
pub struct TronAdapter {
    network: Network,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(rename = "blockID")]
    block_id: String,
    block_header: RawHeader,
    #[serde(default)]
    transactions: Vec<RawTx>,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    raw_data: RawHeaderData,
}

#[derive(Debug, Deserialize)]
struct RawHeaderData {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct RawTx {
    #[serde(rename = "txID")]
    tx_id: String,
    raw_data: RawTxData,
}

#[derive(Debug, Deserialize)]
struct RawTxData {
    #[serde(default)]
    contract: Vec<RawContract>,
}

#[derive(Debug, Deserialize)]
struct RawContract {
    #[serde(rename = "type")]
    contract_type: String,
    parameter: RawParameter,
}

#[derive(Debug, Deserialize)]
struct RawParameter {
    value: RawContractValue,
}

#[derive(Debug, Default, Deserialize)]
struct RawContractValue {
    #[serde(default)]
    owner_address: Option<String>,
    #[serde(default)]
    to_address: Option<String>,
    #[serde(default)]
    amount: Option<u64>,
    #[serde(default)]
    asset_name: Option<String>,
}

impl TronAdapter {
    pub fn new(
        network: Network,
        base_url: String,
        api_key: Option<String>,
    ) -> Result<Self, AdapterError> {
        let client = reqwest::ClientBuilder::new()
            .http1_only()
            .timeout(RPC_TIMEOUT)
            .build()?;
        Ok(Self {
            network,
            client,
            base_url,
            api_key,
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, AdapterError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("TRON-PRO-API-KEY", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        // TronGrid answers 403 when the key is over its rate budget
        if status.as_u16() == 403 || status.as_u16() == 429 {
            return Err(AdapterError::RateLimited);
        }
        if !status.is_success() {
            return Err(AdapterError::Status(status));
        }
        Ok(resp.json().await?)
    }
}

impl ChainAdapter for TronAdapter {
    fn chain(&self) -> ChainKey {
        ChainKey::Trx
    }

    fn network(&self) -> Network {
        self.network
    }

    async fn tip_height(&self) -> Result<u64, AdapterError> {
        let v = with_retry(ChainKey::Trx, self.network, "getnowblock", || {
            self.post("wallet/getnowblock", json!({}))
        })
        .await?;
        v.pointer("/block_header/raw_data/number")
            .and_then(Value::as_u64)
            .ok_or_else(|| AdapterError::Malformed("getnowblock: missing block number".into()))
    }

    async fn fetch_block(&self, height: u64) -> Result<Option<NormalizedBlock>, AdapterError> {
        let v = with_retry(ChainKey::Trx, self.network, "getblockbynum", || {
            self.post("wallet/getblockbynum", json!({ "num": height }))
        })
        .await?;
        // an empty object means the block does not exist yet
        if v.get("blockID").is_none() {
            return Ok(None);
        }
        let raw: RawBlock = serde_json::from_value(v)
            .map_err(|e| AdapterError::Malformed(format!("block {height}: {e}")))?;
        Ok(Some(normalize_block(raw)))
    }
}

fn normalize_block(raw: RawBlock) -> NormalizedBlock {
    let txs = raw.transactions.iter().filter_map(normalize_tx).collect();
    NormalizedBlock {
        height: raw.block_header.raw_data.number,
        hash: raw.block_id,
        txs,
    }
}

/// Only the first contract of a tx matters; TRX and TRC asset transfers are
/// tracked, everything else (smart contract calls, votes) is not.
fn normalize_tx(tx: &RawTx) -> Option<NormalizedTx> {
    let contract = tx.raw_data.contract.first()?;
    let value = &contract.parameter.value;
    let from = hex_to_base58(value.owner_address.as_deref()?).ok()?;
    let to = hex_to_base58(value.to_address.as_deref()?).ok()?;
    let amount_raw = value.amount?.to_string();

    let payload = match contract.contract_type.as_str() {
        "TransferContract" => TxPayload::NativeTransfer {
            from,
            to,
            amount_raw,
        },
        "TransferAssetContract" => TxPayload::TokenTransfer {
            from,
            to,
            contract_address: None,
            asset_symbol: Some(decode_asset_name(value.asset_name.as_deref()?)),
            amount_raw,
            standard: NetworkVersion::Trc20,
        },
        _ => return None,
    };

    Some(NormalizedTx {
        hash: tx.tx_id.clone(),
        payload,
    })
}

/// Convert a 0x41-prefixed 21-byte hex address to Tron base58check.
pub fn hex_to_base58(hex_addr: &str) -> Result<String, AdapterError> {
    let bytes = hex::decode(hex_addr)
        .map_err(|e| AdapterError::Malformed(format!("tron address {hex_addr:?}: {e}")))?;
    if bytes.len() != 21 || bytes[0] != 0x41 {
        return Err(AdapterError::Malformed(format!(
            "tron address {hex_addr:?}: expected 21 bytes with 0x41 prefix"
        )));
    }

    let hash1 = Sha256::digest(&bytes);
    let hash2 = Sha256::digest(hash1);

    let mut full = Vec::with_capacity(25);
    full.extend_from_slice(&bytes);
    full.extend_from_slice(&hash2[0..4]);
    Ok(bs58::encode(full).into_string())
}

/// Asset names arrive hex-encoded; fall back to the raw string when a node
/// already decoded it.
fn decode_asset_name(raw: &str) -> String {
    if let Ok(bytes) = hex::decode(raw) {
        if let Ok(name) = String::from_utf8(bytes) {
            return name;
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    // USDT contract: a well-known hex/base58 pair
    const USDT_HEX: &str = "41a614f803b6fd780986a42c78ec9c7f77e6ded13c";
    const USDT_B58: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    #[test]
    fn hex_address_converts_to_base58check() {
        assert_eq!(hex_to_base58(USDT_HEX).unwrap(), USDT_B58);
        assert!(hex_to_base58("0011").is_err());
        assert!(hex_to_base58("42a614f803b6fd780986a42c78ec9c7f77e6ded13c").is_err());
    }

    #[test]
    fn transfer_contract_becomes_native_payload() {
        let raw: RawBlock = serde_json::from_value(json!({
            "blockID": "0000000002ff6001",
            "block_header": {"raw_data": {"number": 50290689u64}},
            "transactions": [{
                "txID": "8f1a",
                "raw_data": {"contract": [{
                    "type": "TransferContract",
                    "parameter": {"value": {
                        "owner_address": USDT_HEX,
                        "to_address": USDT_HEX,
                        "amount": 2500000u64,
                    }},
                }]},
            }],
        }))
        .unwrap();

        let block = normalize_block(raw);
        assert_eq!(block.height, 50290689);
        assert_eq!(block.txs.len(), 1);
        match &block.txs[0].payload {
            TxPayload::NativeTransfer {
                from,
                to,
                amount_raw,
            } => {
                assert_eq!(from, USDT_B58);
                assert_eq!(to, USDT_B58);
                assert_eq!(amount_raw, "2500000");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn asset_transfer_decodes_symbol_and_is_trc20() {
        let raw: RawBlock = serde_json::from_value(json!({
            "blockID": "00aa",
            "block_header": {"raw_data": {"number": 7u64}},
            "transactions": [{
                "txID": "1234",
                "raw_data": {"contract": [{
                    "type": "TransferAssetContract",
                    "parameter": {"value": {
                        "owner_address": USDT_HEX,
                        "to_address": USDT_HEX,
                        "amount": 10000000u64,
                        "asset_name": "55534454",
                    }},
                }]},
            }],
        }))
        .unwrap();

        match &normalize_block(raw).txs[0].payload {
            TxPayload::TokenTransfer {
                asset_symbol,
                amount_raw,
                standard,
                contract_address,
                ..
            } => {
                assert_eq!(asset_symbol.as_deref(), Some("USDT"));
                assert_eq!(amount_raw, "10000000");
                assert_eq!(*standard, NetworkVersion::Trc20);
                assert!(contract_address.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn other_contract_types_are_skipped() {
        let raw: RawBlock = serde_json::from_value(json!({
            "blockID": "00aa",
            "block_header": {"raw_data": {"number": 8u64}},
            "transactions": [{
                "txID": "5678",
                "raw_data": {"contract": [{
                    "type": "TriggerSmartContract",
                    "parameter": {"value": {"owner_address": USDT_HEX}},
                }]},
            }],
        }))
        .unwrap();
        assert!(normalize_block(raw).txs.is_empty());
    }
}

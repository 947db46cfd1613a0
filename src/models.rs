use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Short code of a monitored chain, as used in storage keys and log lines.
///
/// The external name `bitcoin` is accepted on input and normalized to `btc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKey {
    Eth,
    Bsc,
    Btc,
    Trx,
    Xrp,
}

impl ChainKey {
    pub const ALL: [ChainKey; 5] = [
        ChainKey::Eth,
        ChainKey::Bsc,
        ChainKey::Btc,
        ChainKey::Trx,
        ChainKey::Xrp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKey::Eth => "eth",
            ChainKey::Bsc => "bsc",
            ChainKey::Btc => "btc",
            ChainKey::Trx => "trx",
            ChainKey::Xrp => "xrp",
        }
    }

    pub fn parse(s: &str) -> Option<ChainKey> {
        match s.to_ascii_lowercase().as_str() {
            "eth" | "ethereum" => Some(ChainKey::Eth),
            "bsc" => Some(ChainKey::Bsc),
            "btc" | "bitcoin" => Some(ChainKey::Btc),
            "trx" | "tron" => Some(ChainKey::Trx),
            "xrp" | "ripple" => Some(ChainKey::Xrp),
            _ => None,
        }
    }

    pub fn is_evm(&self) -> bool {
        matches!(self, ChainKey::Eth | ChainKey::Bsc)
    }
}

impl std::fmt::Display for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }

    pub fn parse(s: &str) -> Option<Network> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Some(Network::Mainnet),
            "testnet" => Some(Network::Testnet),
            _ => None,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage key under which the last fully processed height is persisted.
pub fn checkpoint_key(chain: ChainKey, network: Network) -> String {
    format!("last_processed_block_{}_{}", chain.as_str(), network.as_str())
}

/// Confirmations required before a deposit is credited.
pub fn required_confirmations(chain: ChainKey, network: Network) -> u64 {
    match (chain, network) {
        (ChainKey::Eth, Network::Mainnet) => 12,
        (ChainKey::Eth, Network::Testnet) => 5,
        (ChainKey::Bsc, Network::Mainnet) => 15,
        (ChainKey::Bsc, Network::Testnet) => 6,
        (ChainKey::Btc, Network::Mainnet) => 3,
        (ChainKey::Btc, Network::Testnet) => 2,
        (ChainKey::Trx, Network::Mainnet) => 20,
        (ChainKey::Trx, Network::Testnet) => 10,
        (ChainKey::Xrp, Network::Mainnet) => 4,
        (ChainKey::Xrp, Network::Testnet) => 2,
    }
}

/// Pause between two consecutive blocks of the same chain, in milliseconds.
pub fn default_block_delay_ms(chain: ChainKey) -> u64 {
    match chain {
        ChainKey::Eth => 1000,
        ChainKey::Bsc => 500,
        ChainKey::Btc => 2000,
        ChainKey::Trx => 5000,
        ChainKey::Xrp => 2000,
    }
}

/// Poll interval for chains without a push subscription, in milliseconds.
pub fn default_check_interval_ms(chain: ChainKey) -> u64 {
    match chain {
        ChainKey::Eth | ChainKey::Bsc => 30000,
        ChainKey::Btc => 120000,
        ChainKey::Trx => 10000,
        ChainKey::Xrp => 30000,
    }
}

/// Upper bound on blocks processed per tick. Tron stays tiny for rate-limit
/// compliance; Bitcoin works in windows; the rest drain the whole gap.
pub fn max_blocks_per_tick(chain: ChainKey) -> u64 {
    match chain {
        ChainKey::Btc => 50,
        ChainKey::Trx => 5,
        _ => u64::MAX,
    }
}

/// An exchange-owned receiving address. Read-only for the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct Wallet {
    pub id: i64,
    pub user_id: i64,
    pub address: String,
    pub chain: ChainKey,
    pub network: Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkVersion {
    #[serde(rename = "NATIVE")]
    Native,
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "BEP20")]
    Bep20,
    #[serde(rename = "TRC20")]
    Trc20,
}

impl NetworkVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkVersion::Native => "NATIVE",
            NetworkVersion::Erc20 => "ERC20",
            NetworkVersion::Bep20 => "BEP20",
            NetworkVersion::Trc20 => "TRC20",
        }
    }

    pub fn parse(s: &str) -> Option<NetworkVersion> {
        match s {
            "NATIVE" => Some(NetworkVersion::Native),
            "ERC20" => Some(NetworkVersion::Erc20),
            "BEP20" => Some(NetworkVersion::Bep20),
            "TRC20" => Some(NetworkVersion::Trc20),
            _ => None,
        }
    }

    /// Token standard of contract transfers on an EVM chain.
    pub fn evm_standard(chain: ChainKey) -> NetworkVersion {
        match chain {
            ChainKey::Bsc => NetworkVersion::Bep20,
            _ => NetworkVersion::Erc20,
        }
    }
}

impl std::fmt::Display for NetworkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked asset. Only active tokens produce deposits.
#[derive(Debug, Clone, Serialize)]
pub struct Token {
    pub id: i64,
    pub symbol: String,
    pub base_symbol: Option<String>,
    pub blockchain: ChainKey,
    pub contract_address: Option<String>,
    pub network_version: NetworkVersion,
    pub decimals: u32,
    pub is_active: bool,
}

impl Token {
    /// Symbol under which the spot balance is kept.
    pub fn credit_symbol(&self) -> &str {
        self.base_symbol.as_deref().unwrap_or(&self.symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Confirming,
    Confirmed,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Confirming => "confirming",
            DepositStatus::Confirmed => "confirmed",
        }
    }

    pub fn parse(s: &str) -> Option<DepositStatus> {
        match s {
            "pending" => Some(DepositStatus::Pending),
            "confirming" => Some(DepositStatus::Confirming),
            "confirmed" => Some(DepositStatus::Confirmed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositMetadata {
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    pub block_hash: String,
}

/// A recorded on-chain transfer into an exchange wallet.
#[derive(Debug, Clone, Serialize)]
pub struct Deposit {
    pub id: i64,
    pub user_id: i64,
    pub wallet_id: i64,
    pub token_id: i64,
    pub tx_hash: String,
    /// Human-decimal amount, exact (never passed through floats).
    pub amount: String,
    pub blockchain: ChainKey,
    pub network: Network,
    pub network_version: NetworkVersion,
    pub block_number: Option<u64>,
    pub status: DepositStatus,
    pub confirmations: u64,
    pub metadata: DepositMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert form of a deposit. Status starts at `pending` with 0 confirmations.
#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub user_id: i64,
    pub wallet_id: i64,
    pub token_id: i64,
    pub tx_hash: String,
    pub amount: String,
    pub blockchain: ChainKey,
    pub network: Network,
    pub network_version: NetworkVersion,
    pub block_number: u64,
    pub metadata: DepositMetadata,
}

/// A block normalized at the adapter boundary.
#[derive(Debug, Clone)]
pub struct NormalizedBlock {
    pub height: u64,
    pub hash: String,
    pub txs: Vec<NormalizedTx>,
}

#[derive(Debug, Clone)]
pub struct NormalizedTx {
    pub hash: String,
    pub payload: TxPayload,
}

/// Tagged union of transfer shapes the five chains produce. Downstream code
/// dispatches on the tag only.
#[derive(Debug, Clone)]
pub enum TxPayload {
    /// Value transfer of the chain's base asset. `amount_raw` is the integer
    /// amount in minimal units as a decimal string.
    NativeTransfer {
        from: String,
        to: String,
        amount_raw: String,
    },
    /// Contract-defined asset transfer. EVM transfers carry the contract
    /// address; Tron asset transfers carry the asset symbol instead.
    TokenTransfer {
        from: String,
        to: String,
        contract_address: Option<String>,
        asset_symbol: Option<String>,
        amount_raw: String,
        standard: NetworkVersion,
    },
    /// Bitcoin UTXO transaction. One tx may credit several wallets; amounts
    /// are already decimal BTC strings.
    MultiOutput {
        outputs: Vec<TxOutput>,
        input_first_address: Option<String>,
    },
    /// XRP Payment transaction.
    Payment {
        from: String,
        to: String,
        amount: XrpAmount,
    },
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    pub address: String,
    /// Decimal BTC, exactly as reported by the node.
    pub amount: String,
}

/// XRP `Amount` is a drops string for the native asset and an object for
/// issued currencies.
#[derive(Debug, Clone)]
pub enum XrpAmount {
    Drops(String),
    Issued { currency: String, value: String },
}

/// Scale an integer raw amount down by `decimals`, producing an exact decimal
/// string with at least one fractional digit. `10^18` at 18 decimals becomes
/// `"1.0"`, not `"1"` and not `"1.000000000000000000"`.
pub fn format_units(raw: &str, decimals: u32) -> anyhow::Result<String> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        anyhow::bail!("raw amount is not an unsigned integer: {raw:?}");
    }
    let raw = raw.trim_start_matches('0');
    let raw = if raw.is_empty() { "0" } else { raw };

    let decimals = decimals as usize;
    let padded = if raw.len() <= decimals {
        format!("{raw:0>width$}", width = decimals + 1)
    } else {
        raw.to_string()
    };
    let split = padded.len() - decimals;
    let (int, frac) = padded.split_at(split);
    let frac = frac.trim_end_matches('0');
    let frac = if frac.is_empty() { "0" } else { frac };
    Ok(format!("{int}.{frac}"))
}

/// Trim a decimal string the way `format_units` would, without rescaling.
/// Used for amounts the node already reports in decimal form.
pub fn normalize_decimal(s: &str) -> anyhow::Result<String> {
    let s = s.trim();
    let (int, frac) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int.is_empty() || !int.bytes().all(|b| b.is_ascii_digit()) {
        anyhow::bail!("not a non-negative decimal: {s:?}");
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        anyhow::bail!("not a non-negative decimal: {s:?}");
    }
    let int = int.trim_start_matches('0');
    let int = if int.is_empty() { "0" } else { int };
    let frac = frac.trim_end_matches('0');
    let frac = if frac.is_empty() { "0" } else { frac };
    Ok(format!("{int}.{frac}"))
}

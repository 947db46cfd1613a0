use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chains::bitcoin::BitcoinAdapter;
use crate::chains::evm::EvmAdapter;
use crate::chains::tron::TronAdapter;
use crate::chains::xrp::XrpAdapter;
use crate::config::Config;
use crate::error::AdapterError;
use crate::models::{ChainKey, Network, NormalizedBlock};

/// Capability set every chain exposes, regardless of underlying protocol.
pub trait ChainAdapter {
    fn chain(&self) -> ChainKey;

    fn network(&self) -> Network;

    /// Current best block / validated ledger index.
    async fn tip_height(&self) -> Result<u64, AdapterError>;

    /// Fetch one block in normalized form. `None` means the chain does not
    /// (yet) have a block at this height.
    async fn fetch_block(&self, height: u64) -> Result<Option<NormalizedBlock>, AdapterError>;

    /// Start a push channel feeding new tip heights into `heights`. Returns
    /// false when the chain has no push transport; the pipeline then falls
    /// back to polling `tip_height`.
    async fn subscribe(&self, heights: mpsc::UnboundedSender<u64>) -> bool {
        let _ = heights;
        false
    }
}

const RETRY_ATTEMPTS: u32 = 3;
const RATE_LIMIT_ATTEMPTS: u32 = 5;
const RATE_LIMIT_FLOOR: Duration = Duration::from_secs(2);

/// Retry a fetch with linearly increasing backoff: 1s, 2s, 3s... Transient
/// errors get 3 attempts; rate limits get 5 with a 2 s floor between tries.
pub async fn with_retry<T, F, Fut>(
    chain: ChainKey,
    network: Network,
    what: &str,
    mut op: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                attempt += 1;
                let max = if e.is_rate_limit() {
                    RATE_LIMIT_ATTEMPTS
                } else {
                    RETRY_ATTEMPTS
                };
                if attempt >= max {
                    return Err(e);
                }
                let mut delay = Duration::from_secs(attempt as u64);
                if e.is_rate_limit() && delay < RATE_LIMIT_FLOOR {
                    delay = RATE_LIMIT_FLOOR;
                }
                warn!(
                    chain = %chain,
                    network = %network,
                    attempt,
                    "{what} failed, retrying in {}s: {e}",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runtime-dispatch wrapper over the concrete adapters, used by the
/// coordinator and the health endpoint.
pub enum ChainClient {
    Evm(EvmAdapter),
    Bitcoin(BitcoinAdapter),
    Tron(TronAdapter),
    Xrp(XrpAdapter),
}

impl ChainClient {
    /// Build the adapter for a target and probe it once. A probe failure
    /// excludes the target from the run set for the process lifetime.
    pub async fn connect(
        chain: ChainKey,
        network: Network,
        config: &Config,
    ) -> Result<ChainClient, AdapterError> {
        let endpoint = config.endpoint(chain, network).ok_or_else(|| {
            AdapterError::NotConfigured(format!("no rpc endpoint for {chain} {network}"))
        })?;

        let client = match chain {
            ChainKey::Eth | ChainKey::Bsc => ChainClient::Evm(EvmAdapter::new(
                chain,
                network,
                endpoint.url,
                endpoint.ws_url,
            )?),
            ChainKey::Btc => ChainClient::Bitcoin(BitcoinAdapter::new(
                network,
                endpoint.url,
                endpoint.username,
                endpoint.password,
            )?),
            ChainKey::Trx => {
                ChainClient::Tron(TronAdapter::new(network, endpoint.url, endpoint.api_key)?)
            }
            ChainKey::Xrp => ChainClient::Xrp(XrpAdapter::new(network, endpoint.url)),
        };

        let tip = client.tip_height().await?;
        info!(chain = %chain, network = %network, tip, "chain adapter connected");
        Ok(client)
    }
}

impl ChainAdapter for ChainClient {
    fn chain(&self) -> ChainKey {
        match self {
            ChainClient::Evm(a) => a.chain(),
            ChainClient::Bitcoin(a) => a.chain(),
            ChainClient::Tron(a) => a.chain(),
            ChainClient::Xrp(a) => a.chain(),
        }
    }

    fn network(&self) -> Network {
        match self {
            ChainClient::Evm(a) => a.network(),
            ChainClient::Bitcoin(a) => a.network(),
            ChainClient::Tron(a) => a.network(),
            ChainClient::Xrp(a) => a.network(),
        }
    }

    async fn tip_height(&self) -> Result<u64, AdapterError> {
        match self {
            ChainClient::Evm(a) => a.tip_height().await,
            ChainClient::Bitcoin(a) => a.tip_height().await,
            ChainClient::Tron(a) => a.tip_height().await,
            ChainClient::Xrp(a) => a.tip_height().await,
        }
    }

    async fn fetch_block(&self, height: u64) -> Result<Option<NormalizedBlock>, AdapterError> {
        match self {
            ChainClient::Evm(a) => a.fetch_block(height).await,
            ChainClient::Bitcoin(a) => a.fetch_block(height).await,
            ChainClient::Tron(a) => a.fetch_block(height).await,
            ChainClient::Xrp(a) => a.fetch_block(height).await,
        }
    }

    async fn subscribe(&self, heights: mpsc::UnboundedSender<u64>) -> bool {
        match self {
            ChainClient::Evm(a) => a.subscribe(heights).await,
            ChainClient::Bitcoin(a) => a.subscribe(heights).await,
            ChainClient::Tron(a) => a.subscribe(heights).await,
            ChainClient::Xrp(a) => a.subscribe(heights).await,
        }
    }
}

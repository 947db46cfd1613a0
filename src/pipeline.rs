use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::adapter::ChainAdapter;
use crate::confirm;
use crate::deposits;
use crate::metrics;
use crate::models::{
    default_block_delay_ms, default_check_interval_ms, max_blocks_per_tick,
    required_confirmations, ChainKey, Network,
};
use crate::storage::Storage;

/// Per-target processing parameters, derived from the chain tables with
/// optional config overrides.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub chain: ChainKey,
    pub network: Network,
    pub block_delay: Duration,
    pub check_interval: Duration,
    pub max_blocks_per_tick: u64,
    pub required_confirmations: u64,
}

impl ChainSettings {
    pub fn new(chain: ChainKey, network: Network) -> Self {
        Self {
            chain,
            network,
            block_delay: Duration::from_millis(default_block_delay_ms(chain)),
            check_interval: Duration::from_millis(default_check_interval_ms(chain)),
            max_blocks_per_tick: max_blocks_per_tick(chain),
            required_confirmations: required_confirmations(chain, network),
        }
    }
}

/// Process a single block end to end: fetch, filter transactions into
/// deposit rows, advance and verify the checkpoint, then sweep confirmation
/// counts at this height. Any error leaves the checkpoint untouched so the
/// next tick retries the same height.
pub async fn process_block<A: ChainAdapter, S: Storage>(
    adapter: &A,
    storage: &S,
    settings: &ChainSettings,
    height: u64,
) -> anyhow::Result<()> {
    let Some(block) = adapter.fetch_block(height).await? else {
        anyhow::bail!("block {height} not found on node");
    };

    let wallets = storage
        .find_wallets(settings.chain, settings.network)
        .await?;
    let wallets = deposits::wallet_map(settings.chain, &wallets);

    for tx in &block.txs {
        if let Err(e) = deposits::record_deposits(
            storage,
            settings.chain,
            settings.network,
            &block,
            tx,
            &wallets,
        )
        .await
        {
            // a missing singleton native token is a misconfigured
            // deployment, not a bad transaction: abort the block loudly so
            // the checkpoint holds until the token row exists
            if e.downcast_ref::<deposits::MissingNativeToken>().is_some() {
                error!(
                    chain = %settings.chain,
                    network = %settings.network,
                    block = height,
                    tx_hash = %tx.hash,
                    "aborting block: {e}"
                );
                return Err(e);
            }
            // one bad transaction never takes the block down
            warn!(
                chain = %settings.chain,
                network = %settings.network,
                block = height,
                tx_hash = %tx.hash,
                "transaction skipped: {e:#}"
            );
        }
    }

    storage
        .set_checkpoint(settings.chain, settings.network, height)
        .await?;
    let persisted = storage
        .get_checkpoint(settings.chain, settings.network)
        .await?;
    if persisted != height {
        anyhow::bail!("checkpoint verify failed at {height}: read back {persisted}");
    }

    confirm::update_confirmations(storage, settings, height).await?;

    metrics::BLOCKS_PROCESSED
        .with_label_values(&[settings.chain.as_str(), settings.network.as_str()])
        .inc();
    Ok(())
}

/// Drain the gap `(last, tip]` in strictly increasing order, bounded by the
/// per-tick batch cap. Stops at the first block-level failure or when
/// shutdown is observed; returns the last fully processed height, which is
/// exactly what the checkpoint holds.
pub async fn catch_up<A: ChainAdapter, S: Storage>(
    adapter: &A,
    storage: &S,
    settings: &ChainSettings,
    mut last: u64,
    tip: u64,
    shutdown: &mut broadcast::Receiver<()>,
) -> u64 {
    if tip <= last {
        return last;
    }
    let end = tip.min(last.saturating_add(settings.max_blocks_per_tick));

    for height in (last + 1)..=end {
        if !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
            info!(
                chain = %settings.chain,
                network = %settings.network,
                block = last,
                "shutdown observed mid-tick"
            );
            return last;
        }

        match process_block(adapter, storage, settings, height).await {
            Ok(()) => last = height,
            Err(e) => {
                warn!(
                    chain = %settings.chain,
                    network = %settings.network,
                    block = height,
                    "block aborted, retrying next tick: {e:#}"
                );
                return last;
            }
        }

        if height < end {
            tokio::time::sleep(settings.block_delay).await;
        }
    }
    last
}

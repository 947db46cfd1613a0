use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::adapter::ChainAdapter;
use crate::pipeline::{catch_up, ChainSettings};
use crate::storage::Storage;

/// Drive one `(chain, network)` target until shutdown. Push-capable chains
/// feed tip heights through an unbounded queue drained here by the single
/// consumer; everything else polls on the per-chain interval. The interval
/// also runs in push mode as a safety net for a silent subscription.
///
/// Within this task blocks are strictly sequential; ordering across targets
/// does not exist.
pub async fn run_monitor<A: ChainAdapter, S: Storage>(
    adapter: A,
    storage: S,
    settings: ChainSettings,
    start_height: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut last = start_height;
    let (heights_tx, mut heights_rx) = mpsc::unbounded_channel();
    let push = adapter.subscribe(heights_tx).await;

    info!(
        chain = %settings.chain,
        network = %settings.network,
        last,
        mode = if push { "push" } else { "poll" },
        "monitor started"
    );

    let mut ticker = tokio::time::interval(settings.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            head = heights_rx.recv(), if push => {
                let Some(mut tip) = head else { break };
                // collapse queued heads; catch_up covers the whole gap anyway
                while let Ok(next) = heights_rx.try_recv() {
                    tip = tip.max(next);
                }
                last = catch_up(&adapter, &storage, &settings, last, tip, &mut shutdown).await;
            }

            _ = ticker.tick() => {
                match adapter.tip_height().await {
                    Ok(tip) => {
                        last = catch_up(&adapter, &storage, &settings, last, tip, &mut shutdown).await;
                    }
                    Err(e) => warn!(
                        chain = %settings.chain,
                        network = %settings.network,
                        "tip height unavailable, skipping tick: {e}"
                    ),
                }
            }
        }
    }

    info!(
        chain = %settings.chain,
        network = %settings.network,
        last,
        "monitor stopped"
    );
}

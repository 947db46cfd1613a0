use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapter::{ChainAdapter, ChainClient};
use crate::config::Config;
use crate::monitor::run_monitor;
use crate::storage::Storage;

/// Owns the lifecycle of all chain monitors. Targets whose adapter fails to
/// initialize are excluded for the lifetime of the process; the rest keep
/// running.
pub struct Coordinator {
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Probe every configured target, resolve its resume point and spawn its
    /// monitor. Returns once every surviving monitor is ready.
    pub async fn start<S: Storage>(config: &Config, storage: S) -> anyhow::Result<Coordinator> {
        let (shutdown, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        for (chain, network) in config.targets() {
            let client = match ChainClient::connect(chain, network, config).await {
                Ok(client) => client,
                Err(e) => {
                    error!(
                        chain = %chain,
                        network = %network,
                        "adapter init failed, target excluded for this run: {e}"
                    );
                    continue;
                }
            };

            // resolve the resume point before spawning so start() only
            // returns with every monitor ready to process
            let mut start_height = storage.get_checkpoint(chain, network).await?;
            if start_height == 0 {
                start_height = match client.tip_height().await {
                    Ok(tip) => tip,
                    Err(e) => {
                        error!(
                            chain = %chain,
                            network = %network,
                            "tip probe failed, target excluded for this run: {e}"
                        );
                        continue;
                    }
                };
                storage.set_checkpoint(chain, network, start_height).await?;
                info!(
                    chain = %chain,
                    network = %network,
                    start_height,
                    "no checkpoint, starting at the current tip"
                );
            } else {
                info!(
                    chain = %chain,
                    network = %network,
                    start_height,
                    "resuming from checkpoint"
                );
            }

            let settings = config.chain_settings(chain, network);
            let storage = storage.clone();
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                run_monitor(client, storage, settings, start_height, rx).await;
            }));
        }

        if handles.is_empty() {
            warn!("no chain targets came up, tracker is idle");
        }
        Ok(Coordinator { shutdown, handles })
    }

    pub fn monitor_count(&self) -> usize {
        self.handles.len()
    }

    /// Broadcast cancellation and wait for every monitor to drain its
    /// in-flight block and persist its checkpoint.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("all monitors stopped");
    }
}

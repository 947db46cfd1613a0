use tracing::warn;

use crate::ledger;
use crate::models::DepositStatus;
use crate::pipeline::ChainSettings;
use crate::storage::Storage;

/// Recompute confirmation counts for every open deposit of a target after a
/// block at `current_height` was processed. Deposits crossing the required
/// threshold are handed to the ledger for crediting.
pub async fn update_confirmations<S: Storage>(
    storage: &S,
    settings: &ChainSettings,
    current_height: u64,
) -> anyhow::Result<()> {
    let open = storage
        .find_pending_deposits(settings.chain, settings.network)
        .await?;

    for deposit in open {
        let Some(block_number) = deposit.block_number else {
            continue;
        };
        if current_height < block_number {
            // tip behind the deposit's block: a re-org to a shorter chain.
            // Count as zero and never credit here.
            warn!(
                chain = %settings.chain,
                network = %settings.network,
                block = block_number,
                tx_hash = %deposit.tx_hash,
                current_height,
                "deposit block is ahead of the tip"
            );
        }

        let confirmations = current_height.saturating_sub(block_number);
        if confirmations >= settings.required_confirmations {
            ledger::credit(storage, &deposit, confirmations).await?;
        } else {
            // at zero confirmations the deposit keeps its status: the
            // insertion block itself never advances it, and a shrunk tip
            // never regresses it. Confirming starts at the first
            // confirmation.
            let status = if confirmations == 0 {
                deposit.status
            } else {
                DepositStatus::Confirming
            };
            storage
                .update_deposit(deposit.id, confirmations, status)
                .await?;
        }
    }
    Ok(())
}

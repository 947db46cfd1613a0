use tracing::{error, info};

use crate::metrics;
use crate::models::Deposit;
use crate::storage::{CreditOutcome, Storage};

/// Credit a deposit that reached its required confirmation count. The status
/// flip and the balance increment happen in one storage transaction, so a
/// deposit observed by two sweeps still credits exactly once.
pub async fn credit<S: Storage>(
    storage: &S,
    deposit: &Deposit,
    confirmations: u64,
) -> anyhow::Result<()> {
    match storage.confirm_and_credit(deposit, confirmations).await? {
        CreditOutcome::Credited => {
            info!(
                chain = %deposit.blockchain,
                network = %deposit.network,
                tx_hash = %deposit.tx_hash,
                user_id = deposit.user_id,
                amount = %deposit.amount,
                confirmations,
                "deposit confirmed and credited"
            );
            metrics::DEPOSITS_CREDITED
                .with_label_values(&[deposit.blockchain.as_str(), deposit.network.as_str()])
                .inc();
        }
        CreditOutcome::AlreadyConfirmed => {}
        CreditOutcome::MissingBalanceRow => {
            // not retried: the deposit is confirmed but uncredited until an
            // operator creates the balance row
            error!(
                chain = %deposit.blockchain,
                network = %deposit.network,
                tx_hash = %deposit.tx_hash,
                user_id = deposit.user_id,
                amount = %deposit.amount,
                "no spot balance row for user, deposit confirmed but uncredited"
            );
        }
    }
    Ok(())
}

pub mod memory;
pub mod postgres;

pub use memory::MemStorage;
pub use postgres::PgStorage;

use crate::models::{
    ChainKey, Deposit, DepositStatus, Network, NetworkVersion, NewDeposit, Token, Wallet,
};

/// Filter for token lookups. All lookups are restricted to active tokens.
#[derive(Debug, Clone)]
pub struct TokenQuery {
    pub blockchain: ChainKey,
    pub network_version: Option<NetworkVersion>,
    pub contract_address: Option<String>,
    pub symbol: Option<String>,
}

impl TokenQuery {
    /// The chain's base asset.
    pub fn native(blockchain: ChainKey) -> Self {
        Self {
            blockchain,
            network_version: Some(NetworkVersion::Native),
            contract_address: None,
            symbol: None,
        }
    }

    /// EVM token by contract address (matched lowercased).
    pub fn by_contract(blockchain: ChainKey, contract_address: String) -> Self {
        Self {
            blockchain,
            network_version: None,
            contract_address: Some(contract_address.to_lowercase()),
            symbol: None,
        }
    }

    /// Token by symbol, optionally pinned to a standard.
    pub fn by_symbol(
        blockchain: ChainKey,
        symbol: String,
        network_version: Option<NetworkVersion>,
    ) -> Self {
        Self {
            blockchain,
            network_version,
            contract_address: None,
            symbol: Some(symbol),
        }
    }
}

/// Result of the transactional confirm-and-credit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    /// Status flipped to confirmed and the balance was incremented.
    Credited,
    /// The deposit was already confirmed; nothing was changed.
    AlreadyConfirmed,
    /// Status flipped to confirmed but no spot balance row exists. The
    /// deposit stays uncredited until an operator intervenes.
    MissingBalanceRow,
}

/// Persistence contract of the tracker. The gateway is the only shared
/// state between monitors; uniqueness and terminal-status invariants are
/// enforced by the backing store, not by in-memory locks.
pub trait Storage: Clone + Send + Sync + 'static {
    fn find_wallets(
        &self,
        chain: ChainKey,
        network: Network,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<Wallet>>> + Send;

    fn find_token(
        &self,
        query: &TokenQuery,
    ) -> impl std::future::Future<Output = anyhow::Result<Option<Token>>> + Send;

    /// Insert a deposit, idempotent on `(tx_hash, wallet_id, token_id)`.
    /// Returns false when the row already existed.
    fn insert_deposit(
        &self,
        row: &NewDeposit,
    ) -> impl std::future::Future<Output = anyhow::Result<bool>> + Send;

    /// Persist a confirmation update. Confirmations never decrease and a
    /// confirmed deposit is never touched again.
    fn update_deposit(
        &self,
        id: i64,
        confirmations: u64,
        status: DepositStatus,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;

    /// Deposits still moving through the confirmation state machine.
    fn find_pending_deposits(
        &self,
        chain: ChainKey,
        network: Network,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<Deposit>>> + Send;

    fn find_user_deposits(
        &self,
        user_id: i64,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<Deposit>>> + Send;

    /// Last fully processed height, or 0 when the target was never run.
    fn get_checkpoint(
        &self,
        chain: ChainKey,
        network: Network,
    ) -> impl std::future::Future<Output = anyhow::Result<u64>> + Send;

    fn set_checkpoint(
        &self,
        chain: ChainKey,
        network: Network,
        height: u64,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;

    /// Atomically flip the deposit to `confirmed` and credit the owner's
    /// spot balance. The status compare-and-set and the balance increment
    /// share one transaction, so a deposit can never credit twice.
    fn confirm_and_credit(
        &self,
        deposit: &Deposit,
        confirmations: u64,
    ) -> impl std::future::Future<Output = anyhow::Result<CreditOutcome>> + Send;
}

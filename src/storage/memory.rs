use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use bigdecimal::BigDecimal;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{CreditOutcome, Storage, TokenQuery};
use crate::models::{
    checkpoint_key, ChainKey, Deposit, DepositStatus, Network, NewDeposit, Token, Wallet,
};

/// In-memory storage gateway. Mirrors the Postgres backend's constraints
/// (deposit uniqueness, monotonic confirmations, terminal confirmed status)
/// so pipelines behave identically against either. Used by the integration
/// tests and handy for local runs without a database.
#[derive(Clone, Default)]
pub struct MemStorage {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    wallets: Vec<Wallet>,
    tokens: Vec<Token>,
    deposits: Vec<Deposit>,
    checkpoints: HashMap<String, u64>,
    balances: HashMap<(i64, String), BigDecimal>,
    next_deposit_id: i64,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_wallet(&self, wallet: Wallet) {
        self.inner.write().await.wallets.push(wallet);
    }

    pub async fn add_token(&self, token: Token) {
        self.inner.write().await.tokens.push(token);
    }

    pub async fn add_balance(&self, user_id: i64, symbol: &str, balance: BigDecimal) {
        self.inner
            .write()
            .await
            .balances
            .insert((user_id, symbol.to_string()), balance);
    }

    pub async fn balance(&self, user_id: i64, symbol: &str) -> Option<BigDecimal> {
        self.inner
            .read()
            .await
            .balances
            .get(&(user_id, symbol.to_string()))
            .cloned()
    }

    pub async fn deposits(&self) -> Vec<Deposit> {
        self.inner.read().await.deposits.clone()
    }
}

impl Storage for MemStorage {
    async fn find_wallets(
        &self,
        chain: ChainKey,
        network: Network,
    ) -> anyhow::Result<Vec<Wallet>> {
        Ok(self
            .inner
            .read()
            .await
            .wallets
            .iter()
            .filter(|w| w.chain == chain && w.network == network)
            .cloned()
            .collect())
    }

    async fn find_token(&self, query: &TokenQuery) -> anyhow::Result<Option<Token>> {
        Ok(self
            .inner
            .read()
            .await
            .tokens
            .iter()
            .find(|t| {
                t.is_active
                    && t.blockchain == query.blockchain
                    && query
                        .network_version
                        .map_or(true, |v| t.network_version == v)
                    && query.contract_address.as_deref().map_or(true, |c| {
                        t.contract_address
                            .as_deref()
                            .map_or(false, |tc| tc.eq_ignore_ascii_case(c))
                    })
                    && query.symbol.as_deref().map_or(true, |s| t.symbol == s)
            })
            .cloned())
    }

    async fn insert_deposit(&self, row: &NewDeposit) -> anyhow::Result<bool> {
        let mut inner = self.inner.write().await;
        let duplicate = inner.deposits.iter().any(|d| {
            d.tx_hash == row.tx_hash && d.wallet_id == row.wallet_id && d.token_id == row.token_id
        });
        if duplicate {
            return Ok(false);
        }
        inner.next_deposit_id += 1;
        let id = inner.next_deposit_id;
        let now = Utc::now();
        inner.deposits.push(Deposit {
            id,
            user_id: row.user_id,
            wallet_id: row.wallet_id,
            token_id: row.token_id,
            tx_hash: row.tx_hash.clone(),
            amount: row.amount.clone(),
            blockchain: row.blockchain,
            network: row.network,
            network_version: row.network_version,
            block_number: Some(row.block_number),
            status: DepositStatus::Pending,
            confirmations: 0,
            metadata: row.metadata.clone(),
            created_at: now,
            updated_at: now,
        });
        Ok(true)
    }

    async fn update_deposit(
        &self,
        id: i64,
        confirmations: u64,
        status: DepositStatus,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(d) = inner.deposits.iter_mut().find(|d| d.id == id) {
            if d.status != DepositStatus::Confirmed {
                d.confirmations = d.confirmations.max(confirmations);
                d.status = status;
                d.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn find_pending_deposits(
        &self,
        chain: ChainKey,
        network: Network,
    ) -> anyhow::Result<Vec<Deposit>> {
        Ok(self
            .inner
            .read()
            .await
            .deposits
            .iter()
            .filter(|d| {
                d.blockchain == chain
                    && d.network == network
                    && d.status != DepositStatus::Confirmed
                    && d.block_number.is_some()
            })
            .cloned()
            .collect())
    }

    async fn find_user_deposits(&self, user_id: i64) -> anyhow::Result<Vec<Deposit>> {
        Ok(self
            .inner
            .read()
            .await
            .deposits
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, chain: ChainKey, network: Network) -> anyhow::Result<u64> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .get(&checkpoint_key(chain, network))
            .copied()
            .unwrap_or(0))
    }

    async fn set_checkpoint(
        &self,
        chain: ChainKey,
        network: Network,
        height: u64,
    ) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .checkpoints
            .insert(checkpoint_key(chain, network), height);
        Ok(())
    }

    async fn confirm_and_credit(
        &self,
        deposit: &Deposit,
        confirmations: u64,
    ) -> anyhow::Result<CreditOutcome> {
        let amount = BigDecimal::from_str(&deposit.amount)
            .with_context(|| format!("deposit {} amount {:?}", deposit.id, deposit.amount))?;
        let mut inner = self.inner.write().await;

        let token = inner
            .tokens
            .iter()
            .find(|t| t.id == deposit.token_id)
            .with_context(|| format!("deposit {} references unknown token", deposit.id))?;
        let credit_symbol = token.credit_symbol().to_string();

        let d = inner
            .deposits
            .iter_mut()
            .find(|d| d.id == deposit.id)
            .with_context(|| format!("deposit {} not found", deposit.id))?;
        if d.status == DepositStatus::Confirmed {
            return Ok(CreditOutcome::AlreadyConfirmed);
        }
        d.status = DepositStatus::Confirmed;
        d.confirmations = d.confirmations.max(confirmations);
        d.updated_at = Utc::now();

        let user_id = deposit.user_id;
        match inner.balances.get_mut(&(user_id, credit_symbol)) {
            Some(balance) => {
                *balance += amount;
                Ok(CreditOutcome::Credited)
            }
            None => Ok(CreditOutcome::MissingBalanceRow),
        }
    }
}

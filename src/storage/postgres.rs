use std::str::FromStr;

use anyhow::Context;
use bigdecimal::BigDecimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::{CreditOutcome, Storage, TokenQuery};
use crate::models::{
    checkpoint_key, ChainKey, Deposit, DepositMetadata, DepositStatus, Network, NetworkVersion,
    NewDeposit, Token, Wallet,
};

/// PostgreSQL-backed storage gateway.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connect to postgres")?;
        sqlx::migrate!().run(&pool).await.context("run migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn wallet_from_row(row: &PgRow) -> anyhow::Result<Wallet> {
    let chain: String = row.try_get("chain")?;
    let network: String = row.try_get("network")?;
    Ok(Wallet {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        address: row.try_get("address")?,
        chain: ChainKey::parse(&chain).with_context(|| format!("unknown chain {chain:?}"))?,
        network: Network::parse(&network)
            .with_context(|| format!("unknown network {network:?}"))?,
    })
}

fn token_from_row(row: &PgRow) -> anyhow::Result<Token> {
    let blockchain: String = row.try_get("blockchain")?;
    let version: String = row.try_get("network_version")?;
    let decimals: i32 = row.try_get("decimals")?;
    Ok(Token {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        base_symbol: row.try_get("base_symbol")?,
        blockchain: ChainKey::parse(&blockchain)
            .with_context(|| format!("unknown chain {blockchain:?}"))?,
        contract_address: row.try_get("contract_address")?,
        network_version: NetworkVersion::parse(&version)
            .with_context(|| format!("unknown network version {version:?}"))?,
        decimals: decimals as u32,
        is_active: row.try_get("is_active")?,
    })
}

fn deposit_from_row(row: &PgRow) -> anyhow::Result<Deposit> {
    let blockchain: String = row.try_get("blockchain")?;
    let network: String = row.try_get("network")?;
    let version: String = row.try_get("network_version")?;
    let status: String = row.try_get("status")?;
    let block_number: Option<i64> = row.try_get("block_number")?;
    let confirmations: i64 = row.try_get("confirmations")?;
    let metadata: serde_json::Value = row.try_get("metadata")?;

    Ok(Deposit {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        wallet_id: row.try_get("wallet_id")?,
        token_id: row.try_get("token_id")?,
        tx_hash: row.try_get("tx_hash")?,
        amount: row.try_get("amount")?,
        blockchain: ChainKey::parse(&blockchain)
            .with_context(|| format!("unknown chain {blockchain:?}"))?,
        network: Network::parse(&network)
            .with_context(|| format!("unknown network {network:?}"))?,
        network_version: NetworkVersion::parse(&version)
            .with_context(|| format!("unknown network version {version:?}"))?,
        block_number: block_number.map(|n| n as u64),
        status: DepositStatus::parse(&status)
            .with_context(|| format!("unknown status {status:?}"))?,
        confirmations: confirmations as u64,
        metadata: serde_json::from_value(metadata).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const DEPOSIT_COLUMNS: &str = "id, user_id, wallet_id, token_id, tx_hash, amount, blockchain, \
     network, network_version, block_number, status, confirmations, metadata, created_at, \
     updated_at";

impl Storage for PgStorage {
    async fn find_wallets(
        &self,
        chain: ChainKey,
        network: Network,
    ) -> anyhow::Result<Vec<Wallet>> {
        let rows = sqlx::query(
            "SELECT id, user_id, address, chain, network FROM wallets \
             WHERE chain = $1 AND network = $2",
        )
        .bind(chain.as_str())
        .bind(network.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(wallet_from_row).collect()
    }

    async fn find_token(&self, query: &TokenQuery) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query(
            "SELECT id, symbol, base_symbol, blockchain, contract_address, network_version, \
                    decimals, is_active \
             FROM tokens \
             WHERE blockchain = $1 AND is_active = TRUE \
               AND ($2::text IS NULL OR network_version = $2) \
               AND ($3::text IS NULL OR lower(contract_address) = $3) \
               AND ($4::text IS NULL OR symbol = $4) \
             LIMIT 1",
        )
        .bind(query.blockchain.as_str())
        .bind(query.network_version.map(|v| v.as_str()))
        .bind(query.contract_address.as_deref())
        .bind(query.symbol.as_deref())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn insert_deposit(&self, row: &NewDeposit) -> anyhow::Result<bool> {
        let metadata = serde_json::to_value(&row.metadata)?;
        let result = sqlx::query(
            "INSERT INTO deposits (user_id, wallet_id, token_id, tx_hash, amount, blockchain, \
                                   network, network_version, block_number, status, confirmations, \
                                   metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0, $10) \
             ON CONFLICT (tx_hash, wallet_id, token_id) DO NOTHING",
        )
        .bind(row.user_id)
        .bind(row.wallet_id)
        .bind(row.token_id)
        .bind(&row.tx_hash)
        .bind(&row.amount)
        .bind(row.blockchain.as_str())
        .bind(row.network.as_str())
        .bind(row.network_version.as_str())
        .bind(row.block_number as i64)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_deposit(
        &self,
        id: i64,
        confirmations: u64,
        status: DepositStatus,
    ) -> anyhow::Result<()> {
        // GREATEST keeps confirmations monotonic under shrinking tips; the
        // status guard keeps confirmed terminal
        sqlx::query(
            "UPDATE deposits \
             SET confirmations = GREATEST(confirmations, $2), status = $3, updated_at = now() \
             WHERE id = $1 AND status <> 'confirmed'",
        )
        .bind(id)
        .bind(confirmations as i64)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_pending_deposits(
        &self,
        chain: ChainKey,
        network: Network,
    ) -> anyhow::Result<Vec<Deposit>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM deposits \
             WHERE blockchain = $1 AND network = $2 \
               AND status IN ('pending', 'confirming') \
               AND block_number IS NOT NULL \
             ORDER BY id",
        ))
        .bind(chain.as_str())
        .bind(network.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deposit_from_row).collect()
    }

    async fn find_user_deposits(&self, user_id: i64) -> anyhow::Result<Vec<Deposit>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM deposits \
             WHERE user_id = $1 ORDER BY created_at DESC LIMIT 200",
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deposit_from_row).collect()
    }

    async fn get_checkpoint(&self, chain: ChainKey, network: Network) -> anyhow::Result<u64> {
        let row = sqlx::query("SELECT value FROM system_settings WHERE key = $1")
            .bind(checkpoint_key(chain, network))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                value
                    .parse::<u64>()
                    .with_context(|| format!("corrupt checkpoint value {value:?}"))
            }
            None => Ok(0),
        }
    }

    async fn set_checkpoint(
        &self,
        chain: ChainKey,
        network: Network,
        height: u64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO system_settings (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(checkpoint_key(chain, network))
        .bind(height.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn confirm_and_credit(
        &self,
        deposit: &Deposit,
        confirmations: u64,
    ) -> anyhow::Result<CreditOutcome> {
        let amount = BigDecimal::from_str(&deposit.amount)
            .with_context(|| format!("deposit {} amount {:?}", deposit.id, deposit.amount))?;

        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            "UPDATE deposits \
             SET status = 'confirmed', confirmations = GREATEST(confirmations, $2), \
                 updated_at = now() \
             WHERE id = $1 AND status <> 'confirmed'",
        )
        .bind(deposit.id)
        .bind(confirmations as i64)
        .execute(&mut *tx)
        .await?;
        if flipped.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(CreditOutcome::AlreadyConfirmed);
        }

        let token = sqlx::query("SELECT symbol, base_symbol FROM tokens WHERE id = $1")
            .bind(deposit.token_id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("deposit {} references unknown token", deposit.id))?;
        let symbol: String = token.try_get("symbol")?;
        let base_symbol: Option<String> = token.try_get("base_symbol")?;
        let credit_symbol = base_symbol.unwrap_or(symbol);

        let credited = sqlx::query(
            "UPDATE wallet_balances SET balance = balance + $3 \
             WHERE user_id = $1 AND symbol = $2 AND type = 'spot'",
        )
        .bind(deposit.user_id)
        .bind(&credit_symbol)
        .bind(&amount)
        .execute(&mut *tx)
        .await?;

        // the status flip commits even without a balance row; the credit is
        // then an operator problem, not a retry loop
        tx.commit().await?;

        if credited.rows_affected() == 0 {
            Ok(CreditOutcome::MissingBalanceRow)
        } else {
            Ok(CreditOutcome::Credited)
        }
    }
}

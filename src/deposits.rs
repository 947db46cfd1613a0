use std::collections::HashMap;

use thiserror::Error;
use tracing::info;

use crate::metrics;
use crate::models::{
    format_units, normalize_decimal, ChainKey, DepositMetadata, Network, NetworkVersion,
    NewDeposit, NormalizedBlock, NormalizedTx, Token, TxPayload, Wallet, XrpAmount,
};
use crate::storage::{Storage, TokenQuery};

/// The chain's singleton native token row is missing or inactive. Unlike an
/// unmatched contract or issued currency, this is a deployment
/// configuration error: every deposit on the chain would be dropped until
/// the token row exists, so the pipeline aborts the block instead of
/// skipping the transaction.
#[derive(Debug, Error)]
#[error("no active native {chain} token configured")]
pub struct MissingNativeToken {
    pub chain: ChainKey,
}

/// Index wallets by their canonical address form: EVM lowercase hex,
/// everything else exact.
pub fn wallet_map(chain: ChainKey, wallets: &[Wallet]) -> HashMap<String, Wallet> {
    wallets
        .iter()
        .map(|w| {
            let key = if chain.is_evm() {
                w.address.to_lowercase()
            } else {
                w.address.clone()
            };
            (key, w.clone())
        })
        .collect()
}

/// Match one normalized transaction against the wallet set and write deposit
/// rows for every hit. Returns the number of rows inserted; duplicates from
/// resume replays count as zero.
pub async fn record_deposits<S: Storage>(
    storage: &S,
    chain: ChainKey,
    network: Network,
    block: &NormalizedBlock,
    tx: &NormalizedTx,
    wallets: &HashMap<String, Wallet>,
) -> anyhow::Result<u32> {
    match &tx.payload {
        TxPayload::NativeTransfer {
            from,
            to,
            amount_raw,
        } => {
            let Some(wallet) = wallets.get(to) else {
                return Ok(0);
            };
            let Some(token) = storage.find_token(&TokenQuery::native(chain)).await? else {
                // base asset not listed on this exchange
                return Ok(0);
            };
            let amount = format_units(amount_raw, token.decimals)?;
            let metadata = DepositMetadata {
                from: from.clone(),
                contract_address: None,
                block_hash: block.hash.clone(),
            };
            insert(storage, chain, network, block, &tx.hash, wallet, &token, amount, metadata)
                .await
        }

        TxPayload::TokenTransfer {
            from,
            to,
            contract_address,
            asset_symbol,
            amount_raw,
            standard,
        } => {
            let Some(wallet) = wallets.get(to) else {
                return Ok(0);
            };
            let query = match (contract_address, asset_symbol) {
                (Some(contract), _) => TokenQuery::by_contract(chain, contract.clone()),
                (None, Some(symbol)) => {
                    TokenQuery::by_symbol(chain, symbol.clone(), Some(*standard))
                }
                (None, None) => return Ok(0),
            };
            // unknown contract or asset: not a tracked token, not an error
            let Some(token) = storage.find_token(&query).await? else {
                return Ok(0);
            };
            let amount = format_units(amount_raw, token.decimals)?;
            let metadata = DepositMetadata {
                from: from.clone(),
                contract_address: contract_address.clone(),
                block_hash: block.hash.clone(),
            };
            insert(storage, chain, network, block, &tx.hash, wallet, &token, amount, metadata)
                .await
        }

        TxPayload::MultiOutput {
            outputs,
            input_first_address,
        } => {
            if !outputs.iter().any(|o| wallets.contains_key(&o.address)) {
                return Ok(0);
            }
            // the asset is always the singleton BTC token; its absence is a
            // configuration error, not an untracked transfer
            let token: Token = storage
                .find_token(&TokenQuery::by_symbol(
                    chain,
                    "BTC".to_string(),
                    Some(NetworkVersion::Native),
                ))
                .await?
                .ok_or(MissingNativeToken { chain })?;

            let mut inserted = 0;
            for output in outputs {
                let Some(wallet) = wallets.get(&output.address) else {
                    continue;
                };
                let amount = normalize_decimal(&output.amount)?;
                let metadata = DepositMetadata {
                    from: input_first_address.clone().unwrap_or_default(),
                    contract_address: None,
                    block_hash: block.hash.clone(),
                };
                inserted += insert(
                    storage, chain, network, block, &tx.hash, wallet, &token, amount, metadata,
                )
                .await?;
            }
            Ok(inserted)
        }

        TxPayload::Payment { from, to, amount } => {
            let Some(wallet) = wallets.get(to) else {
                return Ok(0);
            };
            let (token, amount) = match amount {
                XrpAmount::Drops(drops) => {
                    let token = storage
                        .find_token(&TokenQuery::by_symbol(
                            chain,
                            "XRP".to_string(),
                            Some(NetworkVersion::Native),
                        ))
                        .await?
                        .ok_or(MissingNativeToken { chain })?;
                    let amount = format_units(drops, token.decimals)?;
                    (token, amount)
                }
                XrpAmount::Issued { currency, value } => {
                    let Some(token) = storage
                        .find_token(&TokenQuery::by_symbol(chain, currency.clone(), None))
                        .await?
                    else {
                        return Ok(0);
                    };
                    (token, normalize_decimal(value)?)
                }
            };
            let metadata = DepositMetadata {
                from: from.clone(),
                contract_address: None,
                block_hash: block.hash.clone(),
            };
            insert(storage, chain, network, block, &tx.hash, wallet, &token, amount, metadata)
                .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert<S: Storage>(
    storage: &S,
    chain: ChainKey,
    network: Network,
    block: &NormalizedBlock,
    tx_hash: &str,
    wallet: &Wallet,
    token: &Token,
    amount: String,
    metadata: DepositMetadata,
) -> anyhow::Result<u32> {
    let row = NewDeposit {
        user_id: wallet.user_id,
        wallet_id: wallet.id,
        token_id: token.id,
        tx_hash: tx_hash.to_string(),
        amount,
        blockchain: chain,
        network,
        network_version: token.network_version,
        block_number: block.height,
        metadata,
    };
    if storage.insert_deposit(&row).await? {
        info!(
            chain = %chain,
            network = %network,
            block = block.height,
            tx_hash = %row.tx_hash,
            user_id = row.user_id,
            amount = %row.amount,
            symbol = %token.symbol,
            "deposit detected"
        );
        metrics::DEPOSITS_DETECTED
            .with_label_values(&[chain.as_str(), network.as_str()])
            .inc();
        Ok(1)
    } else {
        Ok(0)
    }
}

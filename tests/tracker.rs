use std::collections::HashMap;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use tokio::sync::broadcast;

use deposit_tracker::adapter::ChainAdapter;
use deposit_tracker::confirm;
use deposit_tracker::error::AdapterError;
use deposit_tracker::models::{
    ChainKey, DepositStatus, Network, NetworkVersion, NormalizedBlock, NormalizedTx, Token,
    TxOutput, TxPayload, Wallet, XrpAmount,
};
use deposit_tracker::pipeline::{catch_up, ChainSettings};
use deposit_tracker::storage::{MemStorage, Storage};

/// Scripted adapter: a fixed tip and a map of heights to blocks. Heights
/// missing from the map behave like blocks the node does not have.
struct MockAdapter {
    chain: ChainKey,
    network: Network,
    tip: u64,
    blocks: HashMap<u64, NormalizedBlock>,
}

impl MockAdapter {
    fn new(chain: ChainKey, network: Network, tip: u64) -> Self {
        Self {
            chain,
            network,
            tip,
            blocks: HashMap::new(),
        }
    }

    fn with_empty_blocks(mut self, from: u64, to: u64) -> Self {
        for height in from..=to {
            self.blocks.entry(height).or_insert(NormalizedBlock {
                height,
                hash: format!("0xblock{height}"),
                txs: Vec::new(),
            });
        }
        self
    }

    fn with_block(mut self, height: u64, txs: Vec<NormalizedTx>) -> Self {
        self.blocks.insert(
            height,
            NormalizedBlock {
                height,
                hash: format!("0xblock{height}"),
                txs,
            },
        );
        self
    }
}

impl ChainAdapter for MockAdapter {
    fn chain(&self) -> ChainKey {
        self.chain
    }

    fn network(&self) -> Network {
        self.network
    }

    async fn tip_height(&self) -> Result<u64, AdapterError> {
        Ok(self.tip)
    }

    async fn fetch_block(&self, height: u64) -> Result<Option<NormalizedBlock>, AdapterError> {
        Ok(self.blocks.get(&height).cloned())
    }
}

fn eth_wallet(id: i64, user_id: i64, address: &str) -> Wallet {
    Wallet {
        id,
        user_id,
        address: address.into(),
        chain: ChainKey::Eth,
        network: Network::Mainnet,
    }
}

fn token(
    id: i64,
    symbol: &str,
    chain: ChainKey,
    version: NetworkVersion,
    decimals: u32,
    contract: Option<&str>,
) -> Token {
    Token {
        id,
        symbol: symbol.into(),
        base_symbol: None,
        blockchain: chain,
        contract_address: contract.map(Into::into),
        network_version: version,
        decimals,
        is_active: true,
    }
}

fn native_tx(hash: &str, to: &str, amount_raw: &str) -> NormalizedTx {
    NormalizedTx {
        hash: hash.into(),
        payload: TxPayload::NativeTransfer {
            from: "0xsender".into(),
            to: to.into(),
            amount_raw: amount_raw.into(),
        },
    }
}

async fn storage_with_eth_setup() -> MemStorage {
    let storage = MemStorage::new();
    storage.add_wallet(eth_wallet(1, 7, "0xabc0000000000000000000000000000000000abc")).await;
    storage
        .add_token(token(1, "ETH", ChainKey::Eth, NetworkVersion::Native, 18, None))
        .await;
    storage.add_balance(7, "ETH", BigDecimal::from(0)).await;
    storage
}

fn shutdown_pair() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
    broadcast::channel(1)
}

// Scenario: a native ETH deposit walks pending -> confirming -> confirmed
// across twelve mainnet blocks, and the balance is credited exactly once.
#[tokio::test(start_paused = true)]
async fn eth_native_deposit_reaches_confirmed_and_credits_once() {
    let storage = storage_with_eth_setup().await;
    let settings = ChainSettings::new(ChainKey::Eth, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1000).with_block(
        1000,
        vec![native_tx(
            "0xdeposit",
            "0xabc0000000000000000000000000000000000abc",
            "1000000000000000000",
        )],
    );
    let last = catch_up(&adapter, &storage, &settings, 999, 1000, &mut shutdown).await;
    assert_eq!(last, 1000);

    // the insertion block itself leaves the deposit untouched
    let deposit = storage.deposits().await.remove(0);
    assert_eq!(deposit.user_id, 7);
    assert_eq!(deposit.amount, "1.0");
    assert_eq!(deposit.block_number, Some(1000));
    assert_eq!(deposit.status, DepositStatus::Pending);
    assert_eq!(deposit.confirmations, 0);
    assert_eq!(deposit.network_version, NetworkVersion::Native);

    // eleven more blocks: 11 confirmations, still not final
    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1011)
        .with_empty_blocks(1001, 1011);
    let last = catch_up(&adapter, &storage, &settings, 1000, 1011, &mut shutdown).await;
    assert_eq!(last, 1011);
    let deposit = storage.deposits().await.remove(0);
    assert_eq!(deposit.status, DepositStatus::Confirming);
    assert_eq!(deposit.confirmations, 11);
    assert_eq!(storage.balance(7, "ETH").await.unwrap(), BigDecimal::from(0));

    // block 1012 crosses the threshold
    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1012)
        .with_empty_blocks(1012, 1012);
    catch_up(&adapter, &storage, &settings, 1011, 1012, &mut shutdown).await;
    let deposit = storage.deposits().await.remove(0);
    assert_eq!(deposit.status, DepositStatus::Confirmed);
    assert_eq!(deposit.confirmations, 12);
    assert_eq!(
        storage.balance(7, "ETH").await.unwrap(),
        BigDecimal::from_str("1.0").unwrap()
    );

    // later blocks must not credit again
    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1020)
        .with_empty_blocks(1013, 1020);
    catch_up(&adapter, &storage, &settings, 1012, 1020, &mut shutdown).await;
    assert_eq!(
        storage.balance(7, "ETH").await.unwrap(),
        BigDecimal::from_str("1.0").unwrap()
    );
}

// Scenario: an ERC-20 transfer resolved through the token registry keeps the
// contract address in metadata and scales by the token's own decimals.
#[tokio::test(start_paused = true)]
async fn erc20_deposit_resolves_token_by_contract() {
    let storage = MemStorage::new();
    storage.add_wallet(eth_wallet(1, 7, "0xabc0000000000000000000000000000000000abc")).await;
    storage
        .add_token(token(
            2,
            "USDT",
            ChainKey::Eth,
            NetworkVersion::Erc20,
            6,
            Some("0xc000000000000000000000000000000000000000"),
        ))
        .await;
    let settings = ChainSettings::new(ChainKey::Eth, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    let transfer = NormalizedTx {
        hash: "0xtoken".into(),
        payload: TxPayload::TokenTransfer {
            from: "0x1".into(),
            to: "0xabc0000000000000000000000000000000000abc".into(),
            contract_address: Some("0xc000000000000000000000000000000000000000".into()),
            asset_symbol: None,
            amount_raw: "5000000".into(),
            standard: NetworkVersion::Erc20,
        },
    };
    let adapter =
        MockAdapter::new(ChainKey::Eth, Network::Mainnet, 2000).with_block(2000, vec![transfer]);
    catch_up(&adapter, &storage, &settings, 1999, 2000, &mut shutdown).await;

    let deposit = storage.deposits().await.remove(0);
    assert_eq!(deposit.amount, "5.0");
    assert_eq!(deposit.token_id, 2);
    assert_eq!(deposit.network_version, NetworkVersion::Erc20);
    assert_eq!(
        deposit.metadata.contract_address.as_deref(),
        Some("0xc000000000000000000000000000000000000000")
    );
}

// Scenario: one Bitcoin transaction pays three addresses; the two belonging
// to exchange wallets each get their own deposit row.
#[tokio::test(start_paused = true)]
async fn bitcoin_multi_output_credits_each_matching_wallet() {
    let storage = MemStorage::new();
    for (id, user, address) in [(1, 11, "bc1q1"), (3, 33, "bc1q3")] {
        storage
            .add_wallet(Wallet {
                id,
                user_id: user,
                address: address.into(),
                chain: ChainKey::Btc,
                network: Network::Mainnet,
            })
            .await;
    }
    storage
        .add_token(token(4, "BTC", ChainKey::Btc, NetworkVersion::Native, 8, None))
        .await;
    let settings = ChainSettings::new(ChainKey::Btc, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    let multi = NormalizedTx {
        hash: "btctx".into(),
        payload: TxPayload::MultiOutput {
            outputs: vec![
                TxOutput { address: "bc1q1".into(), amount: "0.1".into() },
                TxOutput { address: "bc1q2".into(), amount: "0.2".into() },
                TxOutput { address: "bc1q3".into(), amount: "0.3".into() },
            ],
            input_first_address: None,
        },
    };
    let adapter =
        MockAdapter::new(ChainKey::Btc, Network::Mainnet, 800000).with_block(800000, vec![multi]);
    catch_up(&adapter, &storage, &settings, 799999, 800000, &mut shutdown).await;

    let mut deposits = storage.deposits().await;
    deposits.sort_by_key(|d| d.wallet_id);
    assert_eq!(deposits.len(), 2);
    assert_eq!(deposits[0].wallet_id, 1);
    assert_eq!(deposits[0].amount, "0.1");
    assert_eq!(deposits[1].wallet_id, 3);
    assert_eq!(deposits[1].amount, "0.3");
}

// A matching Bitcoin output with no BTC token row is a misconfigured
// deployment: the block aborts and the checkpoint holds, instead of the
// deposit being silently skipped forever.
#[tokio::test(start_paused = true)]
async fn missing_native_btc_token_aborts_the_block() {
    let storage = MemStorage::new();
    storage
        .add_wallet(Wallet {
            id: 1,
            user_id: 11,
            address: "bc1q1".into(),
            chain: ChainKey::Btc,
            network: Network::Mainnet,
        })
        .await;
    // no BTC token configured
    let settings = ChainSettings::new(ChainKey::Btc, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    let multi = NormalizedTx {
        hash: "btctx".into(),
        payload: TxPayload::MultiOutput {
            outputs: vec![TxOutput { address: "bc1q1".into(), amount: "0.1".into() }],
            input_first_address: None,
        },
    };
    let adapter =
        MockAdapter::new(ChainKey::Btc, Network::Mainnet, 800000).with_block(800000, vec![multi]);
    let last = catch_up(&adapter, &storage, &settings, 799999, 800000, &mut shutdown).await;

    assert_eq!(last, 799999);
    assert_eq!(
        storage
            .get_checkpoint(ChainKey::Btc, Network::Mainnet)
            .await
            .unwrap(),
        0
    );
    assert!(storage.deposits().await.is_empty());
}

// Scenario: a TRC asset transfer resolves by symbol and lands as TRC20.
#[tokio::test(start_paused = true)]
async fn tron_asset_transfer_is_trc20() {
    let storage = MemStorage::new();
    storage
        .add_wallet(Wallet {
            id: 1,
            user_id: 5,
            address: "TWalletAddr".into(),
            chain: ChainKey::Trx,
            network: Network::Mainnet,
        })
        .await;
    storage
        .add_token(token(9, "USDT", ChainKey::Trx, NetworkVersion::Trc20, 6, None))
        .await;
    let settings = ChainSettings::new(ChainKey::Trx, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    let transfer = NormalizedTx {
        hash: "trontx".into(),
        payload: TxPayload::TokenTransfer {
            from: "TSender".into(),
            to: "TWalletAddr".into(),
            contract_address: None,
            asset_symbol: Some("USDT".into()),
            amount_raw: "10000000".into(),
            standard: NetworkVersion::Trc20,
        },
    };
    let adapter =
        MockAdapter::new(ChainKey::Trx, Network::Mainnet, 500).with_block(500, vec![transfer]);
    catch_up(&adapter, &storage, &settings, 499, 500, &mut shutdown).await;

    let deposit = storage.deposits().await.remove(0);
    assert_eq!(deposit.amount, "10.0");
    assert_eq!(deposit.network_version, NetworkVersion::Trc20);
    assert_eq!(deposit.user_id, 5);
}

// Scenario: XRP payments; drops scale by six decimals, unknown issued
// currencies are ignored.
#[tokio::test(start_paused = true)]
async fn xrp_payment_in_drops_is_scaled() {
    let storage = MemStorage::new();
    storage
        .add_wallet(Wallet {
            id: 1,
            user_id: 2,
            address: "rDest".into(),
            chain: ChainKey::Xrp,
            network: Network::Mainnet,
        })
        .await;
    storage
        .add_token(token(6, "XRP", ChainKey::Xrp, NetworkVersion::Native, 6, None))
        .await;
    let settings = ChainSettings::new(ChainKey::Xrp, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    let drops = NormalizedTx {
        hash: "xrptx1".into(),
        payload: TxPayload::Payment {
            from: "rSender".into(),
            to: "rDest".into(),
            amount: XrpAmount::Drops("25000000".into()),
        },
    };
    let unknown_issued = NormalizedTx {
        hash: "xrptx2".into(),
        payload: TxPayload::Payment {
            from: "rSender".into(),
            to: "rDest".into(),
            amount: XrpAmount::Issued {
                currency: "EUR".into(),
                value: "9.99".into(),
            },
        },
    };
    let adapter = MockAdapter::new(ChainKey::Xrp, Network::Mainnet, 90000000)
        .with_block(90000000, vec![drops, unknown_issued]);
    catch_up(&adapter, &storage, &settings, 89999999, 90000000, &mut shutdown).await;

    let deposits = storage.deposits().await;
    assert_eq!(deposits.len(), 1);
    assert_eq!(deposits[0].amount, "25.0");
}

// Restart resume: replaying an already processed block must not duplicate
// deposits, and the checkpoint only moves forward.
#[tokio::test(start_paused = true)]
async fn resume_replay_inserts_nothing_twice() {
    let storage = storage_with_eth_setup().await;
    let settings = ChainSettings::new(ChainKey::Eth, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1000).with_block(
        1000,
        vec![native_tx(
            "0xdeposit",
            "0xabc0000000000000000000000000000000000abc",
            "1000000000000000000",
        )],
    );

    catch_up(&adapter, &storage, &settings, 999, 1000, &mut shutdown).await;
    // simulated restart from the same persisted checkpoint predecessor
    catch_up(&adapter, &storage, &settings, 999, 1000, &mut shutdown).await;

    assert_eq!(storage.deposits().await.len(), 1);
    assert_eq!(
        storage
            .get_checkpoint(ChainKey::Eth, Network::Mainnet)
            .await
            .unwrap(),
        1000
    );
}

// A missing block aborts the tick without advancing the checkpoint past the
// last complete height; the next tick finishes the gap.
#[tokio::test(start_paused = true)]
async fn missing_block_stops_the_tick_and_is_retried() {
    let storage = storage_with_eth_setup().await;
    let settings = ChainSettings::new(ChainKey::Eth, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    // 1003 is absent from the node
    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1005)
        .with_empty_blocks(1000, 1002)
        .with_empty_blocks(1004, 1005);
    let last = catch_up(&adapter, &storage, &settings, 999, 1005, &mut shutdown).await;
    assert_eq!(last, 1002);
    assert_eq!(
        storage
            .get_checkpoint(ChainKey::Eth, Network::Mainnet)
            .await
            .unwrap(),
        1002
    );

    // the node caught up; the tick resumes exactly where it stopped
    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1005)
        .with_empty_blocks(1000, 1005);
    let last = catch_up(&adapter, &storage, &settings, 1002, 1005, &mut shutdown).await;
    assert_eq!(last, 1005);
}

// Tron processes at most five blocks per tick for rate-limit compliance.
#[tokio::test(start_paused = true)]
async fn tron_tick_is_capped_at_five_blocks() {
    let storage = MemStorage::new();
    let settings = ChainSettings::new(ChainKey::Trx, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    let adapter =
        MockAdapter::new(ChainKey::Trx, Network::Mainnet, 100).with_empty_blocks(1, 100);
    let last = catch_up(&adapter, &storage, &settings, 0, 100, &mut shutdown).await;
    assert_eq!(last, 5);
    assert_eq!(
        storage
            .get_checkpoint(ChainKey::Trx, Network::Mainnet)
            .await
            .unwrap(),
        5
    );
}

// Shutdown between blocks stops the tick; the checkpoint reflects the last
// complete block.
#[tokio::test(start_paused = true)]
async fn shutdown_is_observed_between_blocks() {
    let storage = storage_with_eth_setup().await;
    let settings = ChainSettings::new(ChainKey::Eth, Network::Mainnet);
    let (tx, mut shutdown) = shutdown_pair();

    tx.send(()).unwrap();
    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1010)
        .with_empty_blocks(1000, 1010);
    let last = catch_up(&adapter, &storage, &settings, 999, 1010, &mut shutdown).await;
    assert_eq!(last, 999);
    assert_eq!(
        storage
            .get_checkpoint(ChainKey::Eth, Network::Mainnet)
            .await
            .unwrap(),
        0
    );
}

// A deposit left behind by a tip that moved backwards keeps its confirmation
// count and is not credited.
#[tokio::test(start_paused = true)]
async fn shrinking_tip_never_regresses_confirmations() {
    let storage = storage_with_eth_setup().await;
    let settings = ChainSettings::new(ChainKey::Eth, Network::Mainnet);
    let (_tx, mut shutdown) = shutdown_pair();

    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1000).with_block(
        1000,
        vec![native_tx(
            "0xdeposit",
            "0xabc0000000000000000000000000000000000abc",
            "1000000000000000000",
        )],
    );
    catch_up(&adapter, &storage, &settings, 999, 1000, &mut shutdown).await;

    let adapter = MockAdapter::new(ChainKey::Eth, Network::Mainnet, 1005)
        .with_empty_blocks(1001, 1005);
    catch_up(&adapter, &storage, &settings, 1000, 1005, &mut shutdown).await;
    assert_eq!(storage.deposits().await[0].confirmations, 5);

    // sweep again at an older height, as a lagging node would report
    confirm::update_confirmations(&storage, &settings, 998)
        .await
        .unwrap();
    let deposit = storage.deposits().await.remove(0);
    assert_eq!(deposit.confirmations, 5);
    assert_eq!(deposit.status, DepositStatus::Confirming);
    assert_eq!(storage.balance(7, "ETH").await.unwrap(), BigDecimal::from(0));
}

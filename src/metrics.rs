use std::sync::LazyLock;

use prometheus::{register_int_counter_vec, IntCounterVec, TextEncoder};

pub static BLOCKS_PROCESSED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "deposit_tracker_blocks_processed_total",
        "Blocks fully processed, including checkpoint write",
        &["chain", "network"]
    )
    .expect("register blocks_processed")
});

pub static DEPOSITS_DETECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "deposit_tracker_deposits_detected_total",
        "Deposit rows inserted",
        &["chain", "network"]
    )
    .expect("register deposits_detected")
});

pub static DEPOSITS_CREDITED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "deposit_tracker_deposits_credited_total",
        "Deposits credited to spot balances",
        &["chain", "network"]
    )
    .expect("register deposits_credited")
});

pub fn render() -> String {
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

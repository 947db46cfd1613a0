pub mod bitcoin;
pub mod evm;
pub mod tron;
pub mod xrp;

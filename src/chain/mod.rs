//! Chain gateway - the only door to the network.
//!
//! The engine is a client of an external Tron node. Everything it needs from
//! the chain is on [`ChainGateway`]: heights, balances, transfer events, tx
//! results, unsigned transaction templates, and broadcast.

pub mod memory;
#[cfg(feature = "trongrid")]
pub mod trongrid;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CustodyError, CustodyResult};
use crate::keys::TronAddress;

pub use memory::MemoryChain;
#[cfg(feature = "trongrid")]
pub use trongrid::TronGridGateway;

/// What a transfer moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    /// TRX, paid in sun.
    Native,
    /// TRC-20 token at this contract.
    Token(TronAddress),
}

/// One TRC-20 `Transfer` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub tx_hash: String,
    pub token: TronAddress,
    pub from: TronAddress,
    pub to: TronAddress,
    /// Base units, before applying decimals.
    pub raw_amount: u128,
    pub block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Success { block: Option<u64> },
    Failed { reason: String },
    Pending,
}

/// Counts from one pass of a confirmation poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfirmReport {
    pub checked: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub still_pending: usize,
}

/// Node-built transaction awaiting a signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    #[serde(rename = "txID")]
    pub tx_id: String,
    pub raw_data: Value,
    pub raw_data_hex: String,
}

impl UnsignedTransaction {
    /// The bytes whose SHA-256 is signed.
    pub fn preimage(&self) -> CustodyResult<Vec<u8>> {
        hex::decode(&self.raw_data_hex).map_err(|e| CustodyError::Invariant(format!("raw_data_hex: {}", e)))
    }

    /// The node's txID must be SHA-256 of the raw data it asks us to sign.
    pub fn check_id(&self) -> CustodyResult<()> {
        let digest = hex::encode(Sha256::digest(self.preimage()?));
        if !digest.eq_ignore_ascii_case(&self.tx_id) {
            return Err(CustodyError::Invariant(format!("txID {} does not match raw data {}", self.tx_id, digest)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTransaction {
    #[serde(rename = "txID")]
    pub tx_id: String,
    pub raw_data: Value,
    pub raw_data_hex: String,
    /// Hex-encoded 65-byte signatures.
    pub signature: Vec<String>,
    #[serde(default = "visible")]
    pub visible: bool,
}

fn visible() -> bool { true }

impl SignedTransaction {
    pub fn new(unsigned: &UnsignedTransaction, signature: [u8; 65]) -> Self {
        Self {
            tx_id: unsigned.tx_id.clone(),
            raw_data: unsigned.raw_data.clone(),
            raw_data_hex: unsigned.raw_data_hex.clone(),
            signature: vec![hex::encode(signature)],
            visible: true,
        }
    }
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    async fn latest_block_height(&self) -> CustodyResult<u64>;

    /// TRX balance in whole TRX.
    async fn native_balance(&self, address: &TronAddress) -> CustodyResult<Decimal>;

    /// Token balance with the token's decimals applied.
    async fn asset_balance(&self, address: &TronAddress, asset: &TronAddress) -> CustodyResult<Decimal>;

    /// All `Transfer` events of `asset` in `[from_block, to_block]`, one batched query.
    async fn transfer_events_in_range(
        &self,
        asset: &TronAddress,
        from_block: u64,
        to_block: u64,
    ) -> CustodyResult<Vec<TransferEvent>>;

    async fn transaction_result(&self, tx_hash: &str) -> CustodyResult<TxOutcome>;

    async fn build_unsigned_transfer(
        &self,
        from: &TronAddress,
        to: &TronAddress,
        amount: Decimal,
        asset: &Asset,
    ) -> CustodyResult<UnsignedTransaction>;

    /// Returns the accepted transaction hash.
    async fn broadcast(&self, signed: &SignedTransaction) -> CustodyResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unsigned(raw: &[u8]) -> UnsignedTransaction {
        UnsignedTransaction {
            tx_id: hex::encode(Sha256::digest(raw)),
            raw_data: json!({}),
            raw_data_hex: hex::encode(raw),
        }
    }

    #[test]
    fn check_id_accepts_matching_hash() {
        assert!(unsigned(b"raw").check_id().is_ok());
    }

    #[test]
    fn check_id_rejects_substituted_raw_data() {
        let mut tx = unsigned(b"raw");
        tx.raw_data_hex = hex::encode(b"other");
        assert!(matches!(tx.check_id(), Err(CustodyError::Invariant(_))));
    }

    #[test]
    fn signed_serializes_like_the_node_expects() {
        let tx = SignedTransaction::new(&unsigned(b"raw"), [7u8; 65]);
        let value = serde_json::to_value(&tx).unwrap();
        assert!(value.get("txID").is_some());
        assert_eq!(value["signature"][0].as_str().unwrap().len(), 130);
        assert_eq!(value["visible"], json!(true));
    }
}

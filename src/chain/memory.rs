//! MemoryChain - simulated Tron node for tests and dry runs.
//!
//! Broadcasts are checked with the real signer against the sender recorded in
//! the raw data, then applied to in-memory balances. Tests script failures,
//! hold results pending, and mine blocks.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{Asset, ChainGateway, SignedTransaction, TransferEvent, TxOutcome, UnsignedTransaction};
use crate::error::{CustodyError, CustodyResult};
use crate::keys::TronAddress;
use crate::signer;
use crate::units::{to_base_units, USDT_DECIMALS};

#[derive(Debug, Clone)]
struct PendingTransfer {
    from: TronAddress,
    to: TronAddress,
    amount: Decimal,
    asset: Asset,
}

#[derive(Default)]
struct ChainState {
    height: u64,
    nonce: u64,
    native: HashMap<TronAddress, Decimal>,
    tokens: HashMap<(TronAddress, TronAddress), Decimal>,
    events: Vec<TransferEvent>,
    built: HashMap<String, PendingTransfer>,
    results: HashMap<String, TxOutcome>,
    broadcasts: Vec<SignedTransaction>,
    scripted_failures: VecDeque<String>,
    hold_results: bool,
    /// TRX burned by every token transfer.
    token_fee: Decimal,
}

pub struct MemoryChain {
    state: Mutex<ChainState>,
}

impl Default for MemoryChain {
    fn default() -> Self { Self::new(1_000) }
}

impl MemoryChain {
    pub fn new(height: u64) -> Self {
        Self { state: Mutex::new(ChainState { height, ..Default::default() }) }
    }

    fn lock(&self) -> CustodyResult<std::sync::MutexGuard<'_, ChainState>> {
        self.state.lock().map_err(|_| CustodyError::Rpc("memory chain lock".into()))
    }

    fn with<T>(&self, f: impl FnOnce(&mut ChainState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn height(&self) -> u64 { self.with(|s| s.height) }

    /// Advance the tip by `blocks`.
    pub fn mine(&self, blocks: u64) -> u64 {
        self.with(|s| {
            s.height += blocks;
            s.height
        })
    }

    pub fn set_native(&self, address: &TronAddress, amount: Decimal) {
        self.with(|s| s.native.insert(*address, amount));
    }

    pub fn set_token(&self, address: &TronAddress, token: &TronAddress, amount: Decimal) {
        self.with(|s| s.tokens.insert((*address, *token), amount));
    }

    pub fn native_of(&self, address: &TronAddress) -> Decimal {
        self.with(|s| s.native.get(address).copied().unwrap_or_default())
    }

    pub fn token_of(&self, address: &TronAddress, token: &TronAddress) -> Decimal {
        self.with(|s| s.tokens.get(&(*address, *token)).copied().unwrap_or_default())
    }

    /// TRX deducted from the sender of every token transfer.
    pub fn set_token_fee(&self, fee: Decimal) { self.with(|s| s.token_fee = fee); }

    /// An external deposit: credits `to` and records a `Transfer` event in the
    /// next block. Returns the transaction hash.
    pub fn deposit(&self, token: &TronAddress, from: &TronAddress, to: &TronAddress, amount: Decimal) -> String {
        self.with(|s| {
            s.height += 1;
            s.nonce += 1;
            let tx_hash = hex::encode(Sha256::digest(format!("deposit-{}-{}", s.nonce, to)));
            let raw_amount = to_base_units(amount, USDT_DECIMALS).unwrap_or_default();
            *s.tokens.entry((*to, *token)).or_default() += amount;
            s.events.push(TransferEvent {
                tx_hash: tx_hash.clone(),
                token: *token,
                from: *from,
                to: *to,
                raw_amount,
                block: s.height,
            });
            tx_hash
        })
    }

    /// Push a raw event without touching balances.
    pub fn push_event(&self, event: TransferEvent) { self.with(|s| s.events.push(event)); }

    /// The next `n` broadcasts are refused with `reason`.
    pub fn fail_next_broadcasts(&self, n: usize, reason: &str) {
        self.with(|s| s.scripted_failures.extend(std::iter::repeat(reason.to_string()).take(n)));
    }

    /// While held, accepted transactions report `Pending`.
    pub fn hold_results(&self, hold: bool) { self.with(|s| s.hold_results = hold); }

    pub fn set_outcome(&self, tx_hash: &str, outcome: TxOutcome) {
        self.with(|s| s.results.insert(tx_hash.to_string(), outcome));
    }

    pub fn broadcasts(&self) -> Vec<SignedTransaction> { self.with(|s| s.broadcasts.clone()) }
}

#[async_trait]
impl ChainGateway for MemoryChain {
    async fn latest_block_height(&self) -> CustodyResult<u64> { Ok(self.lock()?.height) }

    async fn native_balance(&self, address: &TronAddress) -> CustodyResult<Decimal> {
        Ok(self.lock()?.native.get(address).copied().unwrap_or_default())
    }

    async fn asset_balance(&self, address: &TronAddress, asset: &TronAddress) -> CustodyResult<Decimal> {
        Ok(self.lock()?.tokens.get(&(*address, *asset)).copied().unwrap_or_default())
    }

    async fn transfer_events_in_range(
        &self,
        asset: &TronAddress,
        from_block: u64,
        to_block: u64,
    ) -> CustodyResult<Vec<TransferEvent>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| &e.token == asset && e.block >= from_block && e.block <= to_block)
            .cloned()
            .collect())
    }

    async fn transaction_result(&self, tx_hash: &str) -> CustodyResult<TxOutcome> {
        let state = self.lock()?;
        match state.results.get(tx_hash) {
            Some(TxOutcome::Success { .. }) if state.hold_results => Ok(TxOutcome::Pending),
            Some(outcome) => Ok(outcome.clone()),
            None => Ok(TxOutcome::Pending),
        }
    }

    async fn build_unsigned_transfer(
        &self,
        from: &TronAddress,
        to: &TronAddress,
        amount: Decimal,
        asset: &Asset,
    ) -> CustodyResult<UnsignedTransaction> {
        let mut state = self.lock()?;
        state.nonce += 1;
        let asset_json = match asset {
            Asset::Native => json!("TRX"),
            Asset::Token(contract) => json!(contract.to_string()),
        };
        let raw_data = json!({
            "owner_address": from.to_string(),
            "to_address": to.to_string(),
            "amount": amount.to_string(),
            "asset": asset_json,
            "ref_block": state.height,
            "nonce": state.nonce,
        });
        let raw = serde_json::to_vec(&raw_data)?;
        let tx_id = hex::encode(Sha256::digest(&raw));
        state.built.insert(tx_id.clone(), PendingTransfer { from: *from, to: *to, amount, asset: *asset });
        Ok(UnsignedTransaction { tx_id, raw_data, raw_data_hex: hex::encode(raw) })
    }

    async fn broadcast(&self, signed: &SignedTransaction) -> CustodyResult<String> {
        let mut state = self.lock()?;
        if let Some(reason) = state.scripted_failures.pop_front() {
            return Err(CustodyError::BroadcastRejected(reason));
        }
        let transfer = state
            .built
            .get(&signed.tx_id)
            .cloned()
            .ok_or_else(|| CustodyError::BroadcastRejected(format!("unknown transaction {}", signed.tx_id)))?;
        if state.results.contains_key(&signed.tx_id) {
            return Err(CustodyError::BroadcastRejected("DUP_TRANSACTION_ERROR".into()));
        }
        if !signer::verify_transaction(signed, &transfer.from) {
            return Err(CustodyError::BroadcastRejected("SIGERROR".into()));
        }

        match transfer.asset {
            Asset::Native => {
                let balance = state.native.get(&transfer.from).copied().unwrap_or_default();
                if balance < transfer.amount {
                    return Err(CustodyError::BroadcastRejected("CONTRACT_VALIDATE_ERROR: balance is not sufficient".into()));
                }
                *state.native.entry(transfer.from).or_default() -= transfer.amount;
                *state.native.entry(transfer.to).or_default() += transfer.amount;
            }
            Asset::Token(contract) => {
                let balance = state.tokens.get(&(transfer.from, contract)).copied().unwrap_or_default();
                let fee = state.token_fee;
                let gas = state.native.get(&transfer.from).copied().unwrap_or_default();
                if gas < fee {
                    return Err(CustodyError::BroadcastRejected("BANDWITH_ERROR: account resource insufficient".into()));
                }
                if balance < transfer.amount {
                    return Err(CustodyError::BroadcastRejected("REVERT opcode executed".into()));
                }
                *state.native.entry(transfer.from).or_default() -= fee;
                *state.tokens.entry((transfer.from, contract)).or_default() -= transfer.amount;
                *state.tokens.entry((transfer.to, contract)).or_default() += transfer.amount;
            }
        }

        state.height += 1;
        let block = state.height;
        state.results.insert(signed.tx_id.clone(), TxOutcome::Success { block: Some(block) });
        state.broadcasts.push(signed.clone());
        Ok(signed.tx_id.clone())
    }
}

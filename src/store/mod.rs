//! Persistence - repository traits over the relational store.
//!
//! Every multi-row write that must not be observed half-done is a single
//! trait call ([`LedgerRepository::commit_ledger`], the compare-and-set
//! updates). Implementations run each call as one transaction.

pub mod memory;
pub mod model;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::CustodyResult;
use crate::keys::TronAddress;

pub use memory::MemoryStore;
pub use model::*;

#[async_trait]
pub trait AddressRepository: Send + Sync {
    /// All or nothing; fails if any index or address already exists.
    async fn insert_addresses(&self, rows: &[DerivedAddress]) -> CustodyResult<()>;
    async fn max_index(&self) -> CustodyResult<Option<u32>>;
    /// Atomically move the lowest-index FREE address to ASSIGNED for `user`.
    async fn claim_oldest_free(&self, user: UserId) -> CustodyResult<Option<DerivedAddress>>;
    async fn address_by_owner(&self, user: UserId) -> CustodyResult<Option<DerivedAddress>>;
    async fn find_address(&self, address: &TronAddress) -> CustodyResult<Option<DerivedAddress>>;
    /// Batch lookup; unknown addresses are simply absent from the result.
    async fn find_addresses(&self, addresses: &[TronAddress]) -> CustodyResult<Vec<DerivedAddress>>;
    async fn update_address(&self, row: &DerivedAddress) -> CustodyResult<()>;
    async fn pool_stats(&self) -> CustodyResult<PoolStats>;
}

#[async_trait]
pub trait DepositRepository: Send + Sync {
    /// `None` if `tx_hash` is already recorded.
    async fn insert_deposit(&self, deposit: NewDeposit) -> CustodyResult<Option<DepositRecord>>;
    async fn deposit_exists(&self, tx_hash: &str) -> CustodyResult<bool>;
    async fn get_deposit(&self, id: u64) -> CustodyResult<Option<DepositRecord>>;
    /// PENDING and not swept, oldest first.
    async fn unswept_deposits(&self, limit: usize) -> CustodyResult<Vec<DepositRecord>>;
    async fn unswept_deposits_for(&self, address: &TronAddress) -> CustodyResult<Vec<DepositRecord>>;
    /// Set `is_swept` only if it is still false.
    async fn mark_deposit_swept(&self, id: u64, sweep_tx_hash: &str) -> CustodyResult<bool>;
    /// Clear a failed sweep so the deposit is picked up again. Refused once credited.
    async fn reset_deposit_sweep(&self, id: u64, reason: &str) -> CustodyResult<bool>;
    async fn set_deposit_status(&self, id: u64, status: DepositStatus) -> CustodyResult<()>;
    /// Set `credited_amount` only if unset and swept; marks the deposit COMPLETED.
    async fn mark_deposit_credited(&self, id: u64, amount: Decimal) -> CustodyResult<bool>;
}

#[async_trait]
pub trait SweepRepository: Send + Sync {
    async fn insert_sweep(&self, sweep: NewSweep) -> CustodyResult<SweepAttempt>;
    async fn update_sweep(&self, sweep: &SweepAttempt) -> CustodyResult<()>;
    async fn sweeps_by_status(&self, status: TransferStatus) -> CustodyResult<Vec<SweepAttempt>>;
    /// Attempts made for one deposit so far.
    async fn sweep_count_for(&self, deposit_id: u64) -> CustodyResult<u32>;
}

#[async_trait]
pub trait GasRepository: Send + Sync {
    async fn insert_gas_topup(&self, target_index: u32, target: &TronAddress, amount: Decimal) -> CustodyResult<GasTopup>;
    async fn update_gas_topup(&self, topup: &GasTopup) -> CustodyResult<()>;
    async fn gas_topups_by_status(&self, status: TransferStatus) -> CustodyResult<Vec<GasTopup>>;
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn ledger_snapshot(&self, user: UserId) -> CustodyResult<LedgerSnapshot>;
    async fn entry_by_key(&self, idempotency_key: &str) -> CustodyResult<Option<LedgerEntry>>;
    /// Fails with `Conflict` if any expected version moved or any key exists.
    async fn commit_ledger(&self, commit: LedgerCommit) -> CustodyResult<Vec<LedgerEntry>>;
    /// Newest first.
    async fn entries_for(&self, user: UserId, limit: usize) -> CustodyResult<Vec<LedgerEntry>>;
}

#[async_trait]
pub trait WithdrawalRepository: Send + Sync {
    /// Stored as CREATED.
    async fn insert_withdrawal(&self, withdrawal: NewWithdrawal) -> CustodyResult<WithdrawalRequest>;
    async fn get_withdrawal(&self, id: u64) -> CustodyResult<Option<WithdrawalRequest>>;
    /// Write `row` only if the stored status is still `expected`.
    async fn update_withdrawal(&self, row: &WithdrawalRequest, expected: WithdrawalStatus) -> CustodyResult<bool>;
    async fn withdrawals_by_status(&self, status: WithdrawalStatus) -> CustodyResult<Vec<WithdrawalRequest>>;
    /// Newest first.
    async fn withdrawals_for_user(&self, user: UserId, offset: usize, limit: usize) -> CustodyResult<Vec<WithdrawalRequest>>;
    /// Gross amount requested since `since`, ignoring FAILED and CANCELLED.
    async fn withdrawn_since(&self, user: UserId, since: DateTime<Utc>) -> CustodyResult<Decimal>;
}

/// Everything the engine persists.
pub trait Store:
    AddressRepository + DepositRepository + SweepRepository + GasRepository + LedgerRepository + WithdrawalRepository
{
}

impl<T> Store for T where
    T: AddressRepository + DepositRepository + SweepRepository + GasRepository + LedgerRepository + WithdrawalRepository
{
}

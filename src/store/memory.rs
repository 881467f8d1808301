//! MemoryStore - every repository behind one mutex.
//!
//! Each trait call takes the lock once, so multi-row updates are atomic the
//! same way a database transaction would make them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::model::*;
use super::{AddressRepository, DepositRepository, GasRepository, LedgerRepository, SweepRepository, WithdrawalRepository};
use crate::error::{CustodyError, CustodyResult};
use crate::keys::TronAddress;

#[derive(Default)]
struct Inner {
    next_id: u64,
    addresses: BTreeMap<u32, DerivedAddress>,
    by_address: HashMap<TronAddress, u32>,
    deposits: BTreeMap<u64, DepositRecord>,
    deposit_hashes: HashMap<String, u64>,
    sweeps: BTreeMap<u64, SweepAttempt>,
    gas: BTreeMap<u64, GasTopup>,
    entries: BTreeMap<u64, LedgerEntry>,
    entry_keys: HashMap<String, u64>,
    versions: HashMap<UserId, u64>,
    withdrawals: BTreeMap<u64, WithdrawalRequest>,
}

impl Inner {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Make every write fail, as if the database were read-only.
    pub fn set_fail_writes(&self, fail: bool) { self.fail_writes.store(fail, Ordering::SeqCst); }

    fn read(&self) -> CustodyResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| CustodyError::Storage("store mutex poisoned".into()))
    }

    fn write(&self) -> CustodyResult<MutexGuard<'_, Inner>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CustodyError::Storage("write rejected".into()));
        }
        self.read()
    }
}

#[async_trait]
impl AddressRepository for MemoryStore {
    async fn insert_addresses(&self, rows: &[DerivedAddress]) -> CustodyResult<()> {
        let mut inner = self.write()?;
        let mut seen = HashSet::new();
        for row in rows {
            if inner.addresses.contains_key(&row.index)
                || inner.by_address.contains_key(&row.address)
                || !seen.insert(row.index)
            {
                return Err(CustodyError::Storage(format!("duplicate derived address {} at {}", row.address, row.index)));
            }
        }
        for row in rows {
            inner.by_address.insert(row.address, row.index);
            inner.addresses.insert(row.index, row.clone());
        }
        Ok(())
    }

    async fn max_index(&self) -> CustodyResult<Option<u32>> {
        Ok(self.read()?.addresses.keys().next_back().copied())
    }

    async fn claim_oldest_free(&self, user: UserId) -> CustodyResult<Option<DerivedAddress>> {
        let mut inner = self.read()?;
        let Some(row) = inner.addresses.values_mut().find(|a| a.status == AddressStatus::Free) else {
            return Ok(None);
        };
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CustodyError::Storage("write rejected".into()));
        }
        row.status = AddressStatus::Assigned;
        row.owner = Some(user);
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn address_by_owner(&self, user: UserId) -> CustodyResult<Option<DerivedAddress>> {
        Ok(self
            .read()?
            .addresses
            .values()
            .find(|a| a.owner == Some(user) && a.status != AddressStatus::Retired)
            .cloned())
    }

    async fn find_address(&self, address: &TronAddress) -> CustodyResult<Option<DerivedAddress>> {
        let inner = self.read()?;
        Ok(inner.by_address.get(address).and_then(|i| inner.addresses.get(i)).cloned())
    }

    async fn find_addresses(&self, addresses: &[TronAddress]) -> CustodyResult<Vec<DerivedAddress>> {
        let inner = self.read()?;
        let wanted: HashSet<&TronAddress> = addresses.iter().collect();
        Ok(wanted
            .into_iter()
            .filter_map(|a| inner.by_address.get(a))
            .filter_map(|i| inner.addresses.get(i))
            .cloned()
            .collect())
    }

    async fn update_address(&self, row: &DerivedAddress) -> CustodyResult<()> {
        let mut inner = self.write()?;
        let slot = inner
            .addresses
            .get_mut(&row.index)
            .ok_or_else(|| CustodyError::NotFound(format!("address index {}", row.index)))?;
        *slot = DerivedAddress { updated_at: Utc::now(), ..row.clone() };
        Ok(())
    }

    async fn pool_stats(&self) -> CustodyResult<PoolStats> {
        let inner = self.read()?;
        let mut stats = PoolStats::default();
        for row in inner.addresses.values() {
            stats.total += 1;
            match row.status {
                AddressStatus::Free => stats.free += 1,
                AddressStatus::Assigned => stats.assigned += 1,
                AddressStatus::Active => stats.active += 1,
                AddressStatus::Retired => stats.retired += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl DepositRepository for MemoryStore {
    async fn insert_deposit(&self, deposit: NewDeposit) -> CustodyResult<Option<DepositRecord>> {
        let mut inner = self.write()?;
        if inner.deposit_hashes.contains_key(&deposit.tx_hash) {
            return Ok(None);
        }
        let id = inner.id();
        let now = Utc::now();
        let record = DepositRecord {
            id,
            tx_hash: deposit.tx_hash.clone(),
            from_address: deposit.from_address,
            to_address: deposit.to_address,
            user_id: deposit.user_id,
            amount: deposit.amount,
            block: deposit.block,
            status: DepositStatus::Pending,
            is_swept: false,
            sweep_tx_hash: None,
            swept_at: None,
            credited_amount: None,
            credited_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        inner.deposit_hashes.insert(deposit.tx_hash, id);
        inner.deposits.insert(id, record.clone());
        Ok(Some(record))
    }

    async fn deposit_exists(&self, tx_hash: &str) -> CustodyResult<bool> {
        Ok(self.read()?.deposit_hashes.contains_key(tx_hash))
    }

    async fn get_deposit(&self, id: u64) -> CustodyResult<Option<DepositRecord>> {
        Ok(self.read()?.deposits.get(&id).cloned())
    }

    async fn unswept_deposits(&self, limit: usize) -> CustodyResult<Vec<DepositRecord>> {
        Ok(self
            .read()?
            .deposits
            .values()
            .filter(|d| d.status == DepositStatus::Pending && !d.is_swept)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn unswept_deposits_for(&self, address: &TronAddress) -> CustodyResult<Vec<DepositRecord>> {
        Ok(self
            .read()?
            .deposits
            .values()
            .filter(|d| &d.to_address == address && d.status == DepositStatus::Pending && !d.is_swept)
            .cloned()
            .collect())
    }

    async fn mark_deposit_swept(&self, id: u64, sweep_tx_hash: &str) -> CustodyResult<bool> {
        let mut inner = self.write()?;
        let deposit = inner.deposits.get_mut(&id).ok_or_else(|| CustodyError::NotFound(format!("deposit {}", id)))?;
        if deposit.is_swept {
            return Ok(false);
        }
        let now = Utc::now();
        deposit.is_swept = true;
        deposit.sweep_tx_hash = Some(sweep_tx_hash.to_string());
        deposit.swept_at = Some(now);
        deposit.updated_at = now;
        Ok(true)
    }

    async fn reset_deposit_sweep(&self, id: u64, reason: &str) -> CustodyResult<bool> {
        let mut inner = self.write()?;
        let deposit = inner.deposits.get_mut(&id).ok_or_else(|| CustodyError::NotFound(format!("deposit {}", id)))?;
        if deposit.credited_amount.is_some() || !deposit.is_swept {
            return Ok(false);
        }
        deposit.is_swept = false;
        deposit.sweep_tx_hash = None;
        deposit.swept_at = None;
        deposit.status = DepositStatus::Pending;
        deposit.error = Some(reason.to_string());
        deposit.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_deposit_status(&self, id: u64, status: DepositStatus) -> CustodyResult<()> {
        let mut inner = self.write()?;
        let deposit = inner.deposits.get_mut(&id).ok_or_else(|| CustodyError::NotFound(format!("deposit {}", id)))?;
        deposit.status = status;
        deposit.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_deposit_credited(&self, id: u64, amount: Decimal) -> CustodyResult<bool> {
        let mut inner = self.write()?;
        let deposit = inner.deposits.get_mut(&id).ok_or_else(|| CustodyError::NotFound(format!("deposit {}", id)))?;
        if deposit.credited_amount.is_some() || !deposit.is_swept {
            return Ok(false);
        }
        let now = Utc::now();
        deposit.credited_amount = Some(amount);
        deposit.credited_at = Some(now);
        deposit.status = DepositStatus::Completed;
        deposit.updated_at = now;
        Ok(true)
    }
}

#[async_trait]
impl SweepRepository for MemoryStore {
    async fn insert_sweep(&self, sweep: NewSweep) -> CustodyResult<SweepAttempt> {
        let mut inner = self.write()?;
        let id = inner.id();
        let now = Utc::now();
        let row = SweepAttempt {
            id,
            deposit_id: sweep.deposit_id,
            source_index: sweep.source_index,
            source: sweep.source,
            destination: sweep.destination,
            amount: sweep.amount,
            tx_hash: None,
            status: TransferStatus::Pending,
            retry_count: sweep.retry_count,
            error: None,
            created_at: now,
            updated_at: now,
        };
        inner.sweeps.insert(id, row.clone());
        Ok(row)
    }

    async fn update_sweep(&self, sweep: &SweepAttempt) -> CustodyResult<()> {
        let mut inner = self.write()?;
        let slot = inner.sweeps.get_mut(&sweep.id).ok_or_else(|| CustodyError::NotFound(format!("sweep {}", sweep.id)))?;
        *slot = SweepAttempt { updated_at: Utc::now(), ..sweep.clone() };
        Ok(())
    }

    async fn sweeps_by_status(&self, status: TransferStatus) -> CustodyResult<Vec<SweepAttempt>> {
        Ok(self.read()?.sweeps.values().filter(|s| s.status == status).cloned().collect())
    }

    async fn sweep_count_for(&self, deposit_id: u64) -> CustodyResult<u32> {
        Ok(self.read()?.sweeps.values().filter(|s| s.deposit_id == deposit_id).count() as u32)
    }
}

#[async_trait]
impl GasRepository for MemoryStore {
    async fn insert_gas_topup(&self, target_index: u32, target: &TronAddress, amount: Decimal) -> CustodyResult<GasTopup> {
        let mut inner = self.write()?;
        let id = inner.id();
        let now = Utc::now();
        let row = GasTopup {
            id,
            target_index,
            target: *target,
            amount,
            tx_hash: None,
            status: TransferStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };
        inner.gas.insert(id, row.clone());
        Ok(row)
    }

    async fn update_gas_topup(&self, topup: &GasTopup) -> CustodyResult<()> {
        let mut inner = self.write()?;
        let slot = inner.gas.get_mut(&topup.id).ok_or_else(|| CustodyError::NotFound(format!("gas topup {}", topup.id)))?;
        *slot = GasTopup { updated_at: Utc::now(), ..topup.clone() };
        Ok(())
    }

    async fn gas_topups_by_status(&self, status: TransferStatus) -> CustodyResult<Vec<GasTopup>> {
        Ok(self.read()?.gas.values().filter(|g| g.status == status).cloned().collect())
    }
}

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn ledger_snapshot(&self, user: UserId) -> CustodyResult<LedgerSnapshot> {
        let inner = self.read()?;
        let mut snapshot = LedgerSnapshot { version: inner.versions.get(&user).copied().unwrap_or(0), ..Default::default() };
        for entry in inner.entries.values().filter(|e| e.user_id == user) {
            match entry.status {
                EntryStatus::Completed => snapshot.balance = entry.balance_after,
                EntryStatus::Pending => snapshot.pending_locks += entry.amount,
                EntryStatus::Cancelled => {}
            }
        }
        Ok(snapshot)
    }

    async fn entry_by_key(&self, idempotency_key: &str) -> CustodyResult<Option<LedgerEntry>> {
        let inner = self.read()?;
        Ok(inner.entry_keys.get(idempotency_key).and_then(|id| inner.entries.get(id)).cloned())
    }

    async fn commit_ledger(&self, commit: LedgerCommit) -> CustodyResult<Vec<LedgerEntry>> {
        let mut inner = self.write()?;

        // Validate everything before touching anything.
        for (user, expected) in &commit.expected_versions {
            let current = inner.versions.get(user).copied().unwrap_or(0);
            if current != *expected {
                return Err(CustodyError::Conflict(format!("ledger of {} at version {}, expected {}", user, current, expected)));
            }
        }
        let mut keys = HashSet::new();
        for entry in &commit.inserts {
            if inner.entry_keys.contains_key(&entry.idempotency_key) || !keys.insert(entry.idempotency_key.as_str()) {
                return Err(CustodyError::Conflict(format!("idempotency key {} exists", entry.idempotency_key)));
            }
        }
        let mut cancel_ids = Vec::with_capacity(commit.cancel_keys.len());
        for key in &commit.cancel_keys {
            let id = inner
                .entry_keys
                .get(key)
                .copied()
                .filter(|id| inner.entries.get(id).map(|e| e.status == EntryStatus::Pending).unwrap_or(false))
                .ok_or_else(|| CustodyError::Conflict(format!("no pending entry {}", key)))?;
            cancel_ids.push(id);
        }

        let mut touched: HashSet<UserId> = HashSet::new();
        for id in cancel_ids {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.status = EntryStatus::Cancelled;
                touched.insert(entry.user_id);
            }
        }
        let now = Utc::now();
        let mut written = Vec::with_capacity(commit.inserts.len());
        for new in commit.inserts {
            let id = inner.id();
            let entry = LedgerEntry {
                id,
                user_id: new.user_id,
                kind: new.kind,
                amount: new.amount,
                balance_before: new.balance_before,
                balance_after: new.balance_after,
                status: new.status,
                idempotency_key: new.idempotency_key,
                reference_id: new.reference_id,
                counterparty: new.counterparty,
                description: new.description,
                created_at: now,
            };
            touched.insert(entry.user_id);
            inner.entry_keys.insert(entry.idempotency_key.clone(), id);
            inner.entries.insert(id, entry.clone());
            written.push(entry);
        }
        for user in touched {
            *inner.versions.entry(user).or_insert(0) += 1;
        }
        Ok(written)
    }

    async fn entries_for(&self, user: UserId, limit: usize) -> CustodyResult<Vec<LedgerEntry>> {
        Ok(self
            .read()?
            .entries
            .values()
            .rev()
            .filter(|e| e.user_id == user)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WithdrawalRepository for MemoryStore {
    async fn insert_withdrawal(&self, withdrawal: NewWithdrawal) -> CustodyResult<WithdrawalRequest> {
        let mut inner = self.write()?;
        let id = inner.id();
        let now = Utc::now();
        let row = WithdrawalRequest {
            id,
            user_id: withdrawal.user_id,
            to_address: withdrawal.to_address,
            amount: withdrawal.amount,
            fee: withdrawal.fee,
            net_amount: withdrawal.net_amount,
            status: WithdrawalStatus::Created,
            tx_hash: None,
            block: None,
            confirmations: 0,
            failure_reason: None,
            retry_count: 0,
            max_retries: withdrawal.max_retries,
            processed_at: None,
            confirmed_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.withdrawals.insert(id, row.clone());
        Ok(row)
    }

    async fn get_withdrawal(&self, id: u64) -> CustodyResult<Option<WithdrawalRequest>> {
        Ok(self.read()?.withdrawals.get(&id).cloned())
    }

    async fn update_withdrawal(&self, row: &WithdrawalRequest, expected: WithdrawalStatus) -> CustodyResult<bool> {
        let mut inner = self.write()?;
        let slot = inner
            .withdrawals
            .get_mut(&row.id)
            .ok_or_else(|| CustodyError::NotFound(format!("withdrawal {}", row.id)))?;
        if slot.status != expected {
            return Ok(false);
        }
        *slot = WithdrawalRequest { updated_at: Utc::now(), ..row.clone() };
        Ok(true)
    }

    async fn withdrawals_by_status(&self, status: WithdrawalStatus) -> CustodyResult<Vec<WithdrawalRequest>> {
        Ok(self.read()?.withdrawals.values().filter(|w| w.status == status).cloned().collect())
    }

    async fn withdrawals_for_user(&self, user: UserId, offset: usize, limit: usize) -> CustodyResult<Vec<WithdrawalRequest>> {
        Ok(self
            .read()?
            .withdrawals
            .values()
            .rev()
            .filter(|w| w.user_id == user)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn withdrawn_since(&self, user: UserId, since: DateTime<Utc>) -> CustodyResult<Decimal> {
        Ok(self
            .read()?
            .withdrawals
            .values()
            .filter(|w| w.user_id == user && w.created_at >= since)
            .filter(|w| !matches!(w.status, WithdrawalStatus::Failed | WithdrawalStatus::Cancelled))
            .map(|w| w.amount)
            .sum())
    }
}

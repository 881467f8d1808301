//! Ledger - append-only balance journal, the source of truth for user balances.
//!
//! Balance is the `balance_after` of the newest COMPLETED entry. PENDING
//! entries are withdrawal locks: they reduce what is available without moving
//! the balance. Every write is one [`LedgerCommit`] checked against the
//! per-user version it was computed from; a moved version means someone else
//! wrote first and the operation is recomputed.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::error::{CustodyError, CustodyResult};
use crate::kv::{KvStore, LockGuard};
use crate::sinks::NotificationSink;
use crate::store::{
    EntryStatus, LedgerCommit, LedgerEntry, LedgerKind, LedgerSnapshot, NewLedgerEntry, Store, UserId,
};
use crate::units::USDT_DECIMALS;

pub fn deposit_key(deposit_id: u64) -> String { format!("DEPOSIT_{}", deposit_id) }
pub fn lock_key(withdrawal_id: u64) -> String { format!("WITHDRAWAL_LOCK_{}", withdrawal_id) }
pub fn debit_key(withdrawal_id: u64) -> String { format!("WITHDRAWAL_DEBIT_{}", withdrawal_id) }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReceipt {
    pub reference_id: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
}

pub struct Ledger {
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    notifier: Arc<dyn NotificationSink>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, kv: Arc<dyn KvStore>, notifier: Arc<dyn NotificationSink>, config: LedgerConfig) -> Self {
        Self { store, kv, notifier, config }
    }

    fn attempts(&self) -> u32 { self.config.commit_retries.max(1) }

    pub async fn snapshot(&self, user: UserId) -> CustodyResult<LedgerSnapshot> { self.store.ledger_snapshot(user).await }

    pub async fn balance(&self, user: UserId) -> CustodyResult<Decimal> { Ok(self.snapshot(user).await?.balance) }

    /// Balance minus open withdrawal locks.
    pub async fn available_balance(&self, user: UserId) -> CustodyResult<Decimal> {
        Ok(self.snapshot(user).await?.available())
    }

    pub async fn history(&self, user: UserId, limit: usize) -> CustodyResult<Vec<LedgerEntry>> {
        self.store.entries_for(user, limit).await
    }

    /// Credit `amount` once per `idempotency_key`. `Ok(false)` if it was already applied.
    pub async fn credit(&self, user: UserId, amount: Decimal, idempotency_key: &str, source: &str) -> CustodyResult<bool> {
        if amount <= Decimal::ZERO {
            return Err(CustodyError::InvalidAmount(format!("credit of {}", amount)));
        }
        for attempt in 1..=self.attempts() {
            if self.store.entry_by_key(idempotency_key).await?.is_some() {
                info!(user_id = %user, key = idempotency_key, "credit already applied");
                return Ok(false);
            }
            let snapshot = self.store.ledger_snapshot(user).await?;
            let commit = LedgerCommit {
                expected_versions: vec![(user, snapshot.version)],
                inserts: vec![NewLedgerEntry {
                    user_id: user,
                    kind: LedgerKind::DepositCredit,
                    amount,
                    balance_before: snapshot.balance,
                    balance_after: snapshot.balance + amount,
                    status: EntryStatus::Completed,
                    idempotency_key: idempotency_key.to_string(),
                    reference_id: Some(source.to_string()),
                    counterparty: None,
                    description: "USDT deposit credit".to_string(),
                }],
                cancel_keys: vec![],
            };
            match self.store.commit_ledger(commit).await {
                Ok(_) => {
                    let balance = snapshot.balance + amount;
                    info!(user_id = %user, %amount, %balance, key = idempotency_key, "ledger credited");
                    self.notifier.notify(user, "balance_updated", json!({ "balance": balance, "credited": amount }));
                    return Ok(true);
                }
                Err(CustodyError::Conflict(reason)) => debug!(attempt, %reason, "credit raced, retrying"),
                Err(e) => return Err(e),
            }
        }
        if self.store.entry_by_key(idempotency_key).await?.is_some() {
            return Ok(false);
        }
        Err(CustodyError::Conflict(format!("ledger of {} kept moving during credit", user)))
    }

    /// Reserve `amount` for a withdrawal. Idempotent per withdrawal.
    pub async fn lock(&self, user: UserId, amount: Decimal, withdrawal_id: u64) -> CustodyResult<()> {
        if amount <= Decimal::ZERO {
            return Err(CustodyError::InvalidAmount(format!("lock of {}", amount)));
        }
        let key = lock_key(withdrawal_id);
        for attempt in 1..=self.attempts() {
            if let Some(existing) = self.store.entry_by_key(&key).await? {
                return match existing.status {
                    EntryStatus::Pending => Ok(()),
                    _ => Err(CustodyError::Invariant(format!("lock {} already resolved", key))),
                };
            }
            let snapshot = self.store.ledger_snapshot(user).await?;
            let available = snapshot.available();
            if available < amount {
                return Err(CustodyError::InsufficientBalance { available, requested: amount });
            }
            let commit = LedgerCommit {
                expected_versions: vec![(user, snapshot.version)],
                inserts: vec![NewLedgerEntry {
                    user_id: user,
                    kind: LedgerKind::WithdrawalDebit,
                    amount: -amount,
                    balance_before: snapshot.balance,
                    balance_after: snapshot.balance,
                    status: EntryStatus::Pending,
                    idempotency_key: key.clone(),
                    reference_id: Some(withdrawal_id.to_string()),
                    counterparty: None,
                    description: "Withdrawal lock".to_string(),
                }],
                cancel_keys: vec![],
            };
            match self.store.commit_ledger(commit).await {
                Ok(_) => {
                    info!(user_id = %user, withdrawal_id, %amount, available = %(available - amount), "funds locked");
                    return Ok(());
                }
                Err(CustodyError::Conflict(reason)) => debug!(attempt, %reason, "lock raced, retrying"),
                Err(e) => return Err(e),
            }
        }
        Err(CustodyError::Conflict(format!("ledger of {} kept moving during lock", user)))
    }

    pub async fn has_open_lock(&self, withdrawal_id: u64) -> CustodyResult<bool> {
        Ok(matches!(
            self.store.entry_by_key(&lock_key(withdrawal_id)).await?,
            Some(entry) if entry.status == EntryStatus::Pending
        ))
    }

    /// Cancel an open lock. `Ok(false)` if there was nothing to cancel.
    pub async fn unlock(&self, user: UserId, withdrawal_id: u64) -> CustodyResult<bool> {
        let key = lock_key(withdrawal_id);
        for attempt in 1..=self.attempts() {
            match self.store.entry_by_key(&key).await? {
                Some(entry) if entry.status == EntryStatus::Pending => {}
                _ => return Ok(false),
            }
            let commit = LedgerCommit { expected_versions: vec![], inserts: vec![], cancel_keys: vec![key.clone()] };
            match self.store.commit_ledger(commit).await {
                Ok(_) => {
                    info!(user_id = %user, withdrawal_id, "funds unlocked");
                    return Ok(true);
                }
                Err(CustodyError::Conflict(reason)) => debug!(attempt, %reason, "unlock raced, retrying"),
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Turn the lock into a completed debit. `Ok(false)` if already finalized.
    pub async fn finalize_debit(&self, user: UserId, amount: Decimal, withdrawal_id: u64) -> CustodyResult<bool> {
        let key = debit_key(withdrawal_id);
        let lock = lock_key(withdrawal_id);
        for attempt in 1..=self.attempts() {
            if self.store.entry_by_key(&key).await?.is_some() {
                return Ok(false);
            }
            let held = self.store.entry_by_key(&lock).await?;
            let held = match held {
                Some(entry) if entry.status == EntryStatus::Pending => entry,
                other => {
                    let state = other.map(|e| format!("{:?}", e.status)).unwrap_or_else(|| "missing".into());
                    error!(user_id = %user, withdrawal_id, %state, "finalize without an open lock");
                    return Err(CustodyError::Invariant(format!("withdrawal {} lock is {}", withdrawal_id, state)));
                }
            };
            if held.amount != -amount {
                return Err(CustodyError::Invariant(format!(
                    "withdrawal {} locked {} but finalizes {}",
                    withdrawal_id, -held.amount, amount
                )));
            }
            let snapshot = self.store.ledger_snapshot(user).await?;
            let commit = LedgerCommit {
                expected_versions: vec![(user, snapshot.version)],
                inserts: vec![NewLedgerEntry {
                    user_id: user,
                    kind: LedgerKind::WithdrawalDebit,
                    amount: -amount,
                    balance_before: snapshot.balance,
                    balance_after: snapshot.balance - amount,
                    status: EntryStatus::Completed,
                    idempotency_key: key.clone(),
                    reference_id: Some(withdrawal_id.to_string()),
                    counterparty: None,
                    description: "USDT withdrawal".to_string(),
                }],
                cancel_keys: vec![lock.clone()],
            };
            match self.store.commit_ledger(commit).await {
                Ok(_) => {
                    let balance = snapshot.balance - amount;
                    info!(user_id = %user, withdrawal_id, %amount, %balance, "withdrawal debit finalized");
                    self.notifier.notify(user, "balance_updated", json!({ "balance": balance, "debited": amount }));
                    return Ok(true);
                }
                Err(CustodyError::Conflict(reason)) => debug!(attempt, %reason, "finalize raced, retrying"),
                Err(e) => return Err(e),
            }
        }
        if self.store.entry_by_key(&key).await?.is_some() {
            return Ok(false);
        }
        Err(CustodyError::Conflict(format!("ledger of {} kept moving during finalize", user)))
    }

    /// Move balance between two users. Exclusive per sender.
    pub async fn transfer(&self, from: UserId, to: UserId, amount: Decimal, description: Option<&str>) -> CustodyResult<TransferReceipt> {
        if from == to {
            return Err(CustodyError::SelfTransfer);
        }
        if amount <= Decimal::ZERO || amount.normalize().scale() > USDT_DECIMALS {
            return Err(CustodyError::InvalidAmount(format!("transfer of {}", amount)));
        }
        let Some(guard) = LockGuard::acquire(&self.kv, format!("transfer:lock:{}", from), self.config.transfer_lock_ttl).await? else {
            warn!(user_id = %from, "transfer already in progress");
            return Err(CustodyError::Busy(format!("transfer for {}", from)));
        };
        let result = self.transfer_locked(from, to, amount, description).await;
        guard.release().await;

        let receipt = result?;
        self.notifier.notify(from, "p2p_sent", json!({ "amount": amount, "reference_id": receipt.reference_id }));
        self.notifier.notify(to, "p2p_received", json!({ "amount": receipt.net_amount, "reference_id": receipt.reference_id }));
        Ok(receipt)
    }

    async fn transfer_locked(&self, from: UserId, to: UserId, amount: Decimal, description: Option<&str>) -> CustodyResult<TransferReceipt> {
        let reference_id = Uuid::new_v4().to_string();
        let fee = (amount * self.config.p2p_fee_percentage / Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(USDT_DECIMALS, RoundingStrategy::MidpointAwayFromZero);
        let net_amount = amount - fee;
        if net_amount <= Decimal::ZERO {
            return Err(CustodyError::FeeExceedsAmount { amount, fee });
        }

        for attempt in 1..=self.attempts() {
            let sender = self.store.ledger_snapshot(from).await?;
            let receiver = self.store.ledger_snapshot(to).await?;
            let available = sender.available();
            if available < amount {
                return Err(CustodyError::InsufficientBalance { available, requested: amount });
            }
            let sender_after = sender.balance - amount;
            let entry = |user, kind, amount, before, after, suffix: &str, counterparty, text: &str| NewLedgerEntry {
                user_id: user,
                kind,
                amount,
                balance_before: before,
                balance_after: after,
                status: EntryStatus::Completed,
                idempotency_key: format!("P2P_{}_{}", reference_id, suffix),
                reference_id: Some(reference_id.clone()),
                counterparty,
                description: description.unwrap_or(text).to_string(),
            };
            let mut inserts = vec![
                entry(from, LedgerKind::P2pSend, -amount, sender.balance, sender_after, "SEND", Some(to), "P2P transfer sent"),
                entry(
                    to,
                    LedgerKind::P2pReceive,
                    net_amount,
                    receiver.balance,
                    receiver.balance + net_amount,
                    "RECEIVE",
                    Some(from),
                    "P2P transfer received",
                ),
            ];
            if fee > Decimal::ZERO {
                // Informational: the fee is already inside the SEND amount.
                inserts.push(entry(from, LedgerKind::Adjustment, -fee, sender_after, sender_after, "FEE", None, "P2P transfer fee"));
            }
            let commit = LedgerCommit {
                expected_versions: vec![(from, sender.version), (to, receiver.version)],
                inserts,
                cancel_keys: vec![],
            };
            match self.store.commit_ledger(commit).await {
                Ok(_) => {
                    info!(from = %from, to = %to, %amount, %fee, %net_amount, reference_id = %reference_id, "p2p transfer completed");
                    return Ok(TransferReceipt { reference_id, amount, fee, net_amount });
                }
                Err(CustodyError::Conflict(reason)) => debug!(attempt, %reason, "transfer raced, retrying"),
                Err(e) => return Err(e),
            }
        }
        Err(CustodyError::Conflict(format!("ledger of {} kept moving during transfer", from)))
    }
}

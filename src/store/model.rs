//! Persisted entities.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CustodyError, CustodyResult};
use crate::keys::TronAddress;

pub type UserId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressStatus {
    Free,
    Assigned,
    Active,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub index: u32,
    pub address: TronAddress,
    pub status: AddressStatus,
    pub owner: Option<UserId>,
    pub first_deposit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DerivedAddress {
    pub fn free(index: u32, address: TronAddress) -> Self {
        let now = Utc::now();
        Self {
            index,
            address,
            status: AddressStatus::Free,
            owner: None,
            first_deposit_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: u64,
    pub free: u64,
    pub assigned: u64,
    pub active: u64,
    pub retired: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    Failed,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub id: u64,
    pub tx_hash: String,
    pub from_address: TronAddress,
    pub to_address: TronAddress,
    pub user_id: UserId,
    pub amount: Decimal,
    pub block: u64,
    pub status: DepositStatus,
    pub is_swept: bool,
    pub sweep_tx_hash: Option<String>,
    pub swept_at: Option<DateTime<Utc>>,
    /// Set once, after the sweep confirmed.
    pub credited_amount: Option<Decimal>,
    pub credited_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub tx_hash: String,
    pub from_address: TronAddress,
    pub to_address: TronAddress,
    pub user_id: UserId,
    pub amount: Decimal,
    pub block: u64,
}

/// Lifecycle of an outbound chain transfer we initiated (sweeps, gas top-ups).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Sent,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepAttempt {
    pub id: u64,
    pub deposit_id: u64,
    pub source_index: u32,
    pub source: TronAddress,
    pub destination: TronAddress,
    pub amount: Decimal,
    pub tx_hash: Option<String>,
    pub status: TransferStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSweep {
    pub deposit_id: u64,
    pub source_index: u32,
    pub source: TronAddress,
    pub destination: TronAddress,
    pub amount: Decimal,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasTopup {
    pub id: u64,
    pub target_index: u32,
    pub target: TronAddress,
    pub amount: Decimal,
    pub tx_hash: Option<String>,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerKind {
    DepositCredit,
    WithdrawalDebit,
    P2pSend,
    P2pReceive,
    Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    /// A lock: reduces available balance, leaves the balance alone.
    Pending,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub user_id: UserId,
    pub kind: LedgerKind,
    /// Signed: debits are negative.
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub status: EntryStatus,
    pub idempotency_key: String,
    pub reference_id: Option<String>,
    pub counterparty: Option<UserId>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub user_id: UserId,
    pub kind: LedgerKind,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub status: EntryStatus,
    pub idempotency_key: String,
    pub reference_id: Option<String>,
    pub counterparty: Option<UserId>,
    pub description: String,
}

/// A user's ledger position as of `version`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// `balance_after` of the latest COMPLETED entry.
    pub balance: Decimal,
    /// Sum of PENDING entry amounts, zero or negative.
    pub pending_locks: Decimal,
    pub version: u64,
}

impl LedgerSnapshot {
    pub fn available(&self) -> Decimal { self.balance + self.pending_locks }
}

/// One atomic ledger write. Applied in full or not at all.
#[derive(Debug, Clone, Default)]
pub struct LedgerCommit {
    /// Every user whose snapshot the commit was computed from.
    pub expected_versions: Vec<(UserId, u64)>,
    pub inserts: Vec<NewLedgerEntry>,
    /// Idempotency keys of PENDING entries to move to CANCELLED.
    pub cancel_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Created,
    Pending,
    Processing,
    Broadcasting,
    Sent,
    Confirmed,
    Failed,
    Cancelled,
}

impl WithdrawalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WithdrawalStatus::Confirmed | WithdrawalStatus::Failed | WithdrawalStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, next),
            (Created, Pending | Failed)
                | (Pending, Processing | Cancelled | Failed)
                | (Processing, Broadcasting | Pending | Failed)
                | (Broadcasting, Sent | Pending | Failed)
                | (Sent, Confirmed | Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        use WithdrawalStatus::*;
        match self {
            Created => "CREATED",
            Pending => "PENDING",
            Processing => "PROCESSING",
            Broadcasting => "BROADCASTING",
            Sent => "SENT",
            Confirmed => "CONFIRMED",
            Failed => "FAILED",
            Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: u64,
    pub user_id: UserId,
    pub to_address: TronAddress,
    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
    pub status: WithdrawalStatus,
    pub tx_hash: Option<String>,
    pub block: Option<u64>,
    pub confirmations: u64,
    pub failure_reason: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawalRequest {
    /// Move to `next`, refusing anything the state machine does not allow.
    pub fn transition(&mut self, next: WithdrawalStatus) -> CustodyResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CustodyError::InvalidTransition(format!(
                "withdrawal {} {} -> {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Cancellable only while queued and never broadcast.
    pub fn can_cancel(&self) -> bool { self.status == WithdrawalStatus::Pending && self.tx_hash.is_none() }

    pub fn can_retry(&self) -> bool { self.retry_count < self.max_retries }
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub user_id: UserId,
    pub to_address: TronAddress,
    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
    pub max_retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use WithdrawalStatus::*;

    const ALL: [WithdrawalStatus; 8] = [Created, Pending, Processing, Broadcasting, Sent, Confirmed, Failed, Cancelled];

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn cancel_only_from_pending() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Cancelled), from == Pending, "{:?}", from);
        }
    }

    #[test]
    fn happy_path_is_allowed() {
        let path = [Created, Pending, Processing, Broadcasting, Sent, Confirmed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    #[test]
    fn available_includes_locks() {
        let snapshot = LedgerSnapshot { balance: Decimal::from(100), pending_locks: Decimal::from(-60), version: 3 };
        assert_eq!(snapshot.available(), Decimal::from(40));
    }
}

//! Withdrawal pipeline.
//!
//! ```text
//! CREATED -> PENDING -> PROCESSING -> BROADCASTING -> SENT -> CONFIRMED
//!               |  ^         |              |           |
//!               |  +---------+--------------+ (retry)   +--> FAILED
//!               +--> CANCELLED                 any step +--> FAILED
//! ```
//!
//! [`WithdrawalService`] validates, locks ledger funds and enqueues.
//! [`WithdrawalProcessor`] pays out and tracks confirmations.

pub mod processor;
pub mod queue;

pub use processor::{ReconcileReport, WithdrawalProcessor};
pub use queue::{QueueStats, WithdrawalQueue};

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::WithdrawalConfig;
use crate::error::{CustodyError, CustodyResult};
use crate::keys::TronAddress;
use crate::kv::{KvStore, LockGuard};
use crate::ledger::Ledger;
use crate::sinks::{AuditSink, NotificationSink};
use crate::store::{NewWithdrawal, Store, UserId, WithdrawalRequest, WithdrawalStatus};
use crate::users::UserDirectory;

pub fn create_lock_key(user: UserId) -> String { format!("withdrawal:create:{}", user) }

/// `fixed + amount * percentage / 100`, 6 dp, half away from zero.
pub fn calculate_fee(amount: Decimal, fixed: Decimal, percentage: Decimal) -> Decimal {
    (fixed + amount * percentage / Decimal::ONE_HUNDRED).round_dp_with_strategy(6, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WithdrawalLimits {
    pub min: Decimal,
    pub max: Decimal,
    pub daily_limit: Decimal,
    pub daily_used: Decimal,
    pub remaining_daily: Decimal,
    pub fixed_fee: Decimal,
    pub fee_percentage: Decimal,
}

/// Request-side operations: create, cancel, read.
pub struct WithdrawalService {
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    ledger: Arc<Ledger>,
    queue: Arc<WithdrawalQueue>,
    users: Arc<dyn UserDirectory>,
    notifier: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditSink>,
    config: WithdrawalConfig,
}

impl WithdrawalService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        ledger: Arc<Ledger>,
        queue: Arc<WithdrawalQueue>,
        users: Arc<dyn UserDirectory>,
        notifier: Arc<dyn NotificationSink>,
        audit: Arc<dyn AuditSink>,
        config: WithdrawalConfig,
    ) -> Self {
        Self { store, kv, ledger, queue, users, notifier, audit, config }
    }

    fn fee_for(&self, amount: Decimal) -> Decimal {
        calculate_fee(amount, self.config.fixed_fee, self.config.fee_percentage)
    }

    async fn daily_used(&self, user: UserId) -> CustodyResult<Decimal> {
        let since = Utc::now() - chrono::Duration::hours(24);
        self.store.withdrawn_since(user, since).await
    }

    /// Validate, lock `amount` in the ledger and enqueue. Nothing is written
    /// unless every check passes.
    pub async fn create(&self, user: UserId, to_address: &str, amount: Decimal, password: &str) -> CustodyResult<WithdrawalRequest> {
        info!(user_id = %user, %amount, "creating withdrawal");
        let to = TronAddress::parse(to_address).map_err(|e| CustodyError::InvalidAddress(e.to_string()))?;
        if amount <= Decimal::ZERO {
            return Err(CustodyError::InvalidAmount(amount.to_string()));
        }
        if amount < self.config.min_amount {
            return Err(CustodyError::AmountBelowMinimum { amount, min: self.config.min_amount });
        }
        if amount > self.config.max_amount {
            return Err(CustodyError::AmountAboveMaximum { amount, max: self.config.max_amount });
        }
        let profile = self.users.security_profile(user).await?;
        if let Some(until) = profile.withdrawals_disabled_until.filter(|until| *until > Utc::now()) {
            return Err(CustodyError::WithdrawalsFrozen { until });
        }
        if !self.users.verify_password(user, password).await? {
            warn!(user_id = %user, "withdrawal with wrong password");
            return Err(CustodyError::InvalidPassword);
        }
        let fee = self.fee_for(amount);
        let net_amount = amount - fee;
        if net_amount <= Decimal::ZERO {
            return Err(CustodyError::FeeExceedsAmount { amount, fee });
        }

        let lock_key = create_lock_key(user);
        let Some(guard) = LockGuard::acquire(&self.kv, lock_key.as_str(), self.config.create_lock_ttl).await? else {
            return Err(CustodyError::Busy(lock_key));
        };
        let result = self.create_locked(user, to, amount, fee, net_amount).await;
        guard.release().await;
        result
    }

    async fn create_locked(
        &self,
        user: UserId,
        to: TronAddress,
        amount: Decimal,
        fee: Decimal,
        net_amount: Decimal,
    ) -> CustodyResult<WithdrawalRequest> {
        let used = self.daily_used(user).await?;
        if used + amount > self.config.daily_limit {
            return Err(CustodyError::DailyLimitExceeded { remaining: (self.config.daily_limit - used).max(Decimal::ZERO) });
        }
        let available = self.ledger.available_balance(user).await?;
        if available < amount {
            return Err(CustodyError::InsufficientBalance { available, requested: amount });
        }

        let mut row = self
            .store
            .insert_withdrawal(NewWithdrawal {
                user_id: user,
                to_address: to,
                amount,
                fee,
                net_amount,
                max_retries: self.config.max_retries,
            })
            .await?;
        if let Err(e) = self.ledger.lock(user, amount, row.id).await {
            // Lost a race with a transfer between the check and the lock.
            warn!(withdrawal_id = row.id, error = %e, "could not lock funds");
            row.failure_reason = Some(e.to_string());
            row.transition(WithdrawalStatus::Failed)?;
            self.store.update_withdrawal(&row, WithdrawalStatus::Created).await?;
            return Err(e);
        }
        row.transition(WithdrawalStatus::Pending)?;
        if !self.store.update_withdrawal(&row, WithdrawalStatus::Created).await? {
            return Err(CustodyError::Conflict(format!("withdrawal {}", row.id)));
        }
        if let Err(e) = self.queue.enqueue(row.id).await {
            // Stays PENDING; reconciliation re-enqueues it.
            warn!(withdrawal_id = row.id, error = %e, "enqueue failed");
        }

        info!(withdrawal_id = row.id, user_id = %user, %amount, %fee, to = %to, "withdrawal created");
        self.notifier.notify(
            user,
            "withdrawal_created",
            json!({ "withdrawal_id": row.id, "amount": amount, "fee": fee, "net_amount": net_amount, "to": to }),
        );
        self.audit.record(
            "withdrawal_created",
            json!({ "withdrawal_id": row.id, "user_id": user, "amount": amount, "to": to }),
        );
        Ok(row)
    }

    /// Only while PENDING and never broadcast. Releases the ledger lock.
    pub async fn cancel(&self, user: UserId, id: u64) -> CustodyResult<WithdrawalRequest> {
        let mut row = self.get(user, id).await?;
        if !row.can_cancel() {
            return Err(CustodyError::InvalidTransition(format!(
                "withdrawal {} cannot be cancelled in {}",
                id,
                row.status.as_str()
            )));
        }
        row.transition(WithdrawalStatus::Cancelled)?;
        if !self.store.update_withdrawal(&row, WithdrawalStatus::Pending).await? {
            return Err(CustodyError::InvalidTransition(format!("withdrawal {} is already being processed", id)));
        }
        self.queue.remove(id).await?;
        self.ledger.unlock(user, id).await?;

        info!(withdrawal_id = id, user_id = %user, amount = %row.amount, "withdrawal cancelled");
        self.notifier.notify(user, "withdrawal_cancelled", json!({ "withdrawal_id": id, "amount": row.amount }));
        self.audit.record("withdrawal_cancelled", json!({ "withdrawal_id": id, "user_id": user }));
        Ok(row)
    }

    /// The user's own withdrawal; someone else's reads as not found.
    pub async fn get(&self, user: UserId, id: u64) -> CustodyResult<WithdrawalRequest> {
        self.store
            .get_withdrawal(id)
            .await?
            .filter(|w| w.user_id == user)
            .ok_or_else(|| CustodyError::NotFound(format!("withdrawal {}", id)))
    }

    /// Newest first.
    pub async fn history(&self, user: UserId, page: usize, size: usize) -> CustodyResult<Vec<WithdrawalRequest>> {
        self.store.withdrawals_for_user(user, page * size, size).await
    }

    pub async fn limits(&self, user: UserId) -> CustodyResult<WithdrawalLimits> {
        let used = self.daily_used(user).await?;
        Ok(WithdrawalLimits {
            min: self.config.min_amount,
            max: self.config.max_amount,
            daily_limit: self.config.daily_limit,
            daily_used: used,
            remaining_daily: (self.config.daily_limit - used).max(Decimal::ZERO),
            fixed_fee: self.config.fixed_fee,
            fee_percentage: self.config.fee_percentage,
        })
    }

    /// Re-enqueue PENDING withdrawals that fell out of both queues.
    pub async fn recover_stuck(&self) -> CustodyResult<usize> {
        let cutoff = stuck_cutoff(self.config.stuck_after);
        let mut recovered = 0;
        for row in self.store.withdrawals_by_status(WithdrawalStatus::Pending).await? {
            if row.updated_at > cutoff || self.queue.contains(row.id).await? {
                continue;
            }
            warn!(withdrawal_id = row.id, since = %row.updated_at, "re-enqueueing stuck withdrawal");
            self.queue.enqueue(row.id).await?;
            recovered += 1;
        }
        Ok(recovered)
    }
}

fn stuck_cutoff(after: std::time::Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::keys::{KeyRing, MasterSeed};
    use crate::kv::MemoryKv;
    use crate::sinks::CollectingSink;
    use crate::store::{MemoryStore, WithdrawalRepository};
    use crate::users::StaticUsers;
    use uuid::Uuid;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    struct Rig {
        service: WithdrawalService,
        ledger: Arc<Ledger>,
        queue: Arc<WithdrawalQueue>,
        store: Arc<MemoryStore>,
        users: Arc<StaticUsers>,
        sink: Arc<CollectingSink>,
        user: Uuid,
        to: String,
    }

    async fn rig(balance: i64, config: WithdrawalConfig) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        let sink = Arc::new(CollectingSink::new());
        let ledger = Arc::new(Ledger::new(store.clone(), kv.clone(), sink.clone(), LedgerConfig::default()));
        let queue = Arc::new(WithdrawalQueue::new(kv.clone()));
        let users = Arc::new(StaticUsers::new());
        let user = Uuid::new_v4();
        users.add(user, "pw");
        if balance > 0 {
            ledger.credit(user, Decimal::from(balance), "seed", "test").await.unwrap();
        }
        let keys = KeyRing::new(MasterSeed::from_mnemonic(TEST_MNEMONIC).unwrap()).unwrap();
        let to = keys.address(42).unwrap().to_string();
        let service = WithdrawalService::new(
            store.clone(),
            kv,
            ledger.clone(),
            queue.clone(),
            users.clone(),
            sink.clone(),
            sink.clone(),
            config,
        );
        Rig { service, ledger, queue, store, users, sink, user, to }
    }

    #[test]
    fn fee_is_fixed_plus_percent_rounded() {
        let fee = calculate_fee(Decimal::from(60), Decimal::ONE, Decimal::new(1, 1));
        assert_eq!(fee, Decimal::new(106, 2));
        let fee = calculate_fee(Decimal::new(1_234_567, 6), Decimal::ZERO, Decimal::new(1, 1));
        assert_eq!(fee, Decimal::new(1_235, 6));
    }

    #[tokio::test]
    async fn second_withdrawal_sees_locked_funds() {
        let r = rig(100, WithdrawalConfig::default()).await;
        let first = r.service.create(r.user, &r.to, Decimal::from(60), "pw").await.unwrap();
        assert_eq!(first.status, WithdrawalStatus::Pending);
        assert_eq!(first.net_amount, Decimal::new(5894, 2));
        assert_eq!(r.ledger.available_balance(r.user).await.unwrap(), Decimal::from(40));
        assert_eq!(r.ledger.balance(r.user).await.unwrap(), Decimal::from(100));

        let err = r.service.create(r.user, &r.to, Decimal::from(60), "pw").await.unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientBalance { .. }));
        assert_eq!(r.queue.stats().await.unwrap().queued, 1);
        assert!(r.sink.notified(r.user, "withdrawal_created"));
    }

    #[tokio::test]
    async fn validation_writes_nothing() {
        let config = WithdrawalConfig { daily_limit: Decimal::from(50), ..Default::default() };
        let r = rig(100, config).await;
        let cases = [
            ("bogus".to_string(), Decimal::from(10), "pw"),
            (r.to.clone(), Decimal::new(5, 1), "pw"),
            (r.to.clone(), Decimal::from(200_000), "pw"),
            (r.to.clone(), Decimal::from(10), "wrong"),
            (r.to.clone(), Decimal::from(51), "pw"),
        ];
        for (to, amount, pw) in cases {
            let err = r.service.create(r.user, &to, amount, pw).await.unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Validation, "{}", err);
        }
        assert!(r.store.withdrawals_for_user(r.user, 0, 10).await.unwrap().is_empty());
        assert_eq!(r.ledger.available_balance(r.user).await.unwrap(), Decimal::from(100));
    }

    #[tokio::test]
    async fn frozen_account_cannot_withdraw() {
        let r = rig(100, WithdrawalConfig::default()).await;
        r.users.freeze_until(r.user, Utc::now() + chrono::Duration::hours(24));
        let err = r.service.create(r.user, &r.to, Decimal::from(10), "pw").await.unwrap_err();
        assert!(matches!(err, CustodyError::WithdrawalsFrozen { .. }));
    }

    #[tokio::test]
    async fn cancel_unlocks_and_is_final() {
        let r = rig(100, WithdrawalConfig::default()).await;
        let w = r.service.create(r.user, &r.to, Decimal::from(30), "pw").await.unwrap();
        let other = Uuid::new_v4();
        assert!(matches!(r.service.cancel(other, w.id).await, Err(CustodyError::NotFound(_))));

        let cancelled = r.service.cancel(r.user, w.id).await.unwrap();
        assert_eq!(cancelled.status, WithdrawalStatus::Cancelled);
        assert_eq!(r.ledger.available_balance(r.user).await.unwrap(), Decimal::from(100));
        assert!(!r.queue.contains(w.id).await.unwrap());
        assert!(r.service.cancel(r.user, w.id).await.is_err());
        // Cancelled amounts do not count against the daily cap.
        assert_eq!(r.service.limits(r.user).await.unwrap().daily_used, Decimal::ZERO);
    }

    #[tokio::test]
    async fn stuck_pending_is_requeued() {
        let config = WithdrawalConfig { stuck_after: std::time::Duration::ZERO, ..Default::default() };
        let r = rig(100, config).await;
        let w = r.service.create(r.user, &r.to, Decimal::from(10), "pw").await.unwrap();
        assert_eq!(r.service.recover_stuck().await.unwrap(), 0);
        r.queue.remove(w.id).await.unwrap();
        assert_eq!(r.service.recover_stuck().await.unwrap(), 1);
        assert!(r.queue.contains(w.id).await.unwrap());
        let page = r.service.history(r.user, 0, 10).await.unwrap();
        assert_eq!(page.len(), 1);
    }
}

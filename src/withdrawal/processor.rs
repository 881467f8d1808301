//! Withdrawal processor - pays queued withdrawals from the master wallet and
//! tracks them to confirmation.
//!
//! One worker per id at a time: the `withdrawal:processing:{id}` marker plus a
//! status compare-and-set on every transition. The txID is written before the
//! broadcast, so a retry after an ambiguous error first asks the chain whether
//! the earlier transaction landed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::queue::{processing_key, WithdrawalQueue};
use crate::chain::{Asset, ChainGateway, ConfirmReport, TxOutcome};
use crate::config::WithdrawalConfig;
use crate::error::{CustodyError, CustodyResult, ErrorKind};
use crate::keys::{KeyRing, TronAddress};
use crate::kv::{KvStore, LockGuard};
use crate::ledger::Ledger;
use crate::signer;
use crate::sinks::{AuditSink, NotificationSink};
use crate::store::{Store, WithdrawalRequest, WithdrawalStatus};

pub struct WithdrawalProcessor {
    chain: Arc<dyn ChainGateway>,
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    keys: Arc<KeyRing>,
    ledger: Arc<Ledger>,
    queue: Arc<WithdrawalQueue>,
    notifier: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditSink>,
    asset: TronAddress,
    config: WithdrawalConfig,
}

impl WithdrawalProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainGateway>,
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        keys: Arc<KeyRing>,
        ledger: Arc<Ledger>,
        queue: Arc<WithdrawalQueue>,
        notifier: Arc<dyn NotificationSink>,
        audit: Arc<dyn AuditSink>,
        asset: TronAddress,
        config: WithdrawalConfig,
    ) -> Self {
        Self { chain, store, kv, keys, ledger, queue, notifier, audit, asset, config }
    }

    /// Pop and process one withdrawal. Returns the id handled, if any.
    pub async fn process_next(&self) -> CustodyResult<Option<u64>> {
        let Some(id) = self.queue.dequeue().await? else {
            return Ok(None);
        };
        self.process(id).await?;
        Ok(Some(id))
    }

    /// Process up to `limit` queued withdrawals, one after another.
    pub async fn drain(&self, limit: usize) -> CustodyResult<usize> {
        let mut handled = 0;
        while handled < limit {
            match self.process_next().await? {
                Some(_) => handled += 1,
                None => break,
            }
        }
        Ok(handled)
    }

    pub async fn process(&self, id: u64) -> CustodyResult<()> {
        let Some(guard) = LockGuard::acquire(&self.kv, processing_key(id), self.config.processing_ttl).await? else {
            debug!(withdrawal_id = id, "already being processed elsewhere");
            return Ok(());
        };
        let result = self.process_locked(id).await;
        guard.release().await;
        result
    }

    async fn process_locked(&self, id: u64) -> CustodyResult<()> {
        let Some(mut row) = self.store.get_withdrawal(id).await? else {
            warn!(withdrawal_id = id, "queued withdrawal does not exist");
            return Ok(());
        };
        if row.status != WithdrawalStatus::Pending {
            warn!(withdrawal_id = id, status = row.status.as_str(), "queued withdrawal is not PENDING, skipping");
            return Ok(());
        }
        if let Err(e) = self.advance(&mut row, WithdrawalStatus::Processing).await {
            debug!(withdrawal_id = id, error = %e, "withdrawal changed before processing");
            return Ok(());
        }
        info!(withdrawal_id = id, amount = %row.net_amount, to = %row.to_address, attempt = row.retry_count + 1, "processing withdrawal");

        match self.pay_out(&mut row).await {
            Ok(Payout::Sent) => Ok(()),
            Ok(Payout::Deferred) => {
                self.advance(&mut row, WithdrawalStatus::Pending).await?;
                self.queue.schedule_retry(row.id, self.config.retry_delay).await
            }
            Err(e) => self.handle_failure(row, e).await,
        }
    }

    async fn pay_out(&self, row: &mut WithdrawalRequest) -> CustodyResult<Payout> {
        if let Some(previous) = row.tx_hash.clone() {
            match self.chain.transaction_result(&previous).await? {
                TxOutcome::Success { block } => {
                    warn!(withdrawal_id = row.id, tx_hash = previous, "earlier broadcast landed, adopting it");
                    row.block = block;
                    self.mark_sent(row, previous).await?;
                    return Ok(Payout::Sent);
                }
                TxOutcome::Pending if !older_than(row.processed_at, self.config.tx_expiry) => {
                    info!(withdrawal_id = row.id, tx_hash = previous, "earlier broadcast unresolved, waiting for it");
                    return Ok(Payout::Deferred);
                }
                outcome => {
                    warn!(withdrawal_id = row.id, tx_hash = previous, ?outcome, "earlier broadcast will not land");
                    row.tx_hash = None;
                    if !row.can_retry() {
                        return Err(CustodyError::TransactionFailed(format!(
                            "payout {} did not land and no retries are left",
                            previous
                        )));
                    }
                }
            }
        }

        let master = *self.keys.master_address();
        let usdt = self.chain.asset_balance(&master, &self.asset).await?;
        if usdt < row.net_amount {
            return Err(CustodyError::InsufficientOnChain {
                address: master.to_string(),
                required: row.net_amount,
                available: usdt,
            });
        }
        let trx = self.chain.native_balance(&master).await?;
        if trx < self.config.master_trx_reserve {
            return Err(CustodyError::InsufficientOnChain {
                address: master.to_string(),
                required: self.config.master_trx_reserve,
                available: trx,
            });
        }

        let unsigned = self
            .chain
            .build_unsigned_transfer(&master, &row.to_address, row.net_amount, &Asset::Token(self.asset))
            .await?;
        let key = self.keys.master_key()?;
        let signed = signer::sign_transaction(&unsigned, &key, &master)?;

        row.tx_hash = Some(signed.tx_id.clone());
        row.processed_at = Some(Utc::now());
        self.advance(row, WithdrawalStatus::Broadcasting).await?;

        let tx_hash = match self.chain.broadcast(&signed).await {
            Ok(hash) => hash,
            Err(e) => {
                if refused(&e) {
                    row.tx_hash = None;
                }
                return Err(e);
            }
        };
        self.mark_sent(row, tx_hash).await?;
        Ok(Payout::Sent)
    }

    async fn mark_sent(&self, row: &mut WithdrawalRequest, tx_hash: String) -> CustodyResult<()> {
        if row.status == WithdrawalStatus::Processing {
            self.advance(row, WithdrawalStatus::Broadcasting).await?;
        }
        row.tx_hash = Some(tx_hash.clone());
        row.processed_at = Some(Utc::now());
        row.failure_reason = None;
        self.advance(row, WithdrawalStatus::Sent).await?;

        info!(withdrawal_id = row.id, tx_hash, amount = %row.net_amount, "withdrawal broadcast");
        self.audit.record(
            "withdrawal_broadcast",
            json!({ "withdrawal_id": row.id, "tx_hash": tx_hash, "net_amount": row.net_amount }),
        );
        self.notifier.notify(row.user_id, "withdrawal_sent", json!({ "withdrawal_id": row.id, "tx_hash": tx_hash }));
        Ok(())
    }

    /// Store `row` moved to `next`. The row in hand only changes once the
    /// store has accepted the move, so its status always matches the stored one.
    async fn advance(&self, row: &mut WithdrawalRequest, next: WithdrawalStatus) -> CustodyResult<()> {
        let mut moved = row.clone();
        moved.transition(next)?;
        self.cas(&moved, row.status).await?;
        *row = moved;
        Ok(())
    }

    async fn cas(&self, row: &WithdrawalRequest, expected: WithdrawalStatus) -> CustodyResult<()> {
        if self.store.update_withdrawal(row, expected).await? {
            Ok(())
        } else {
            Err(CustodyError::Conflict(format!("withdrawal {} left {}", row.id, expected.as_str())))
        }
    }

    /// Retry with a delay while under the ceiling, otherwise FAILED and unlocked.
    /// A row still carrying a hash is always retried: the next attempt settles
    /// that hash before anything is paid or released.
    async fn handle_failure(&self, mut row: WithdrawalRequest, cause: CustodyError) -> CustodyResult<()> {
        row.retry_count += 1;
        row.failure_reason = Some(cause.to_string());
        let unresolved = row.tx_hash.is_some();

        if unresolved || (cause.kind() != ErrorKind::Invariant && row.can_retry()) {
            warn!(
                withdrawal_id = row.id,
                attempt = row.retry_count,
                max = row.max_retries,
                unresolved,
                error = %cause,
                "withdrawal attempt failed, retrying"
            );
            self.advance(&mut row, WithdrawalStatus::Pending).await?;
            self.queue.schedule_retry(row.id, self.config.retry_delay).await?;
            return Ok(());
        }

        if cause.kind() == ErrorKind::Invariant {
            error!(withdrawal_id = row.id, error = %cause, "withdrawal aborted on invariant violation");
        } else {
            error!(withdrawal_id = row.id, retries = row.retry_count, error = %cause, "withdrawal failed permanently");
        }
        self.advance(&mut row, WithdrawalStatus::Failed).await?;
        self.ledger.unlock(row.user_id, row.id).await?;
        self.report_failure(&row);
        Ok(())
    }

    fn report_failure(&self, row: &WithdrawalRequest) {
        let reason = row.failure_reason.clone().unwrap_or_default();
        self.notifier.notify(
            row.user_id,
            "withdrawal_failed",
            json!({ "withdrawal_id": row.id, "amount": row.amount, "reason": reason }),
        );
        self.audit.record(
            "withdrawal_failed",
            json!({ "withdrawal_id": row.id, "user_id": row.user_id, "tx_hash": row.tx_hash, "reason": reason }),
        );
    }

    /// Track SENT withdrawals; finalize the ledger debit at the required depth.
    pub async fn confirm_sent(&self) -> CustodyResult<ConfirmReport> {
        let sent = self.store.withdrawals_by_status(WithdrawalStatus::Sent).await?;
        let mut report = ConfirmReport::default();
        if sent.is_empty() {
            return Ok(report);
        }
        let latest = self.chain.latest_block_height().await?;
        for row in sent {
            report.checked += 1;
            match self.confirm_one(row, latest).await {
                Ok(Some(true)) => report.confirmed += 1,
                Ok(Some(false)) => report.failed += 1,
                Ok(None) => report.still_pending += 1,
                Err(e) => {
                    warn!(error = %e, "withdrawal confirmation check failed");
                    report.still_pending += 1;
                }
            }
        }
        Ok(report)
    }

    /// `Some(true)` confirmed, `Some(false)` failed, `None` still waiting.
    async fn confirm_one(&self, mut row: WithdrawalRequest, latest: u64) -> CustodyResult<Option<bool>> {
        let Some(tx_hash) = row.tx_hash.clone() else {
            return Err(CustodyError::Invariant(format!("SENT withdrawal {} has no hash", row.id)));
        };
        match self.chain.transaction_result(&tx_hash).await? {
            TxOutcome::Success { block } => {
                let block = block.or(row.block);
                row.block = block;
                row.confirmations = block.map_or(0, |b| latest.saturating_sub(b));
                if row.confirmations < self.config.required_confirmations {
                    self.cas(&row, WithdrawalStatus::Sent).await?;
                    return Ok(None);
                }
                self.ledger.finalize_debit(row.user_id, row.amount, row.id).await?;
                row.confirmed_at = Some(Utc::now());
                self.advance(&mut row, WithdrawalStatus::Confirmed).await?;
                info!(withdrawal_id = row.id, tx_hash, confirmations = row.confirmations, "withdrawal confirmed");
                self.audit.record(
                    "withdrawal_confirmed",
                    json!({ "withdrawal_id": row.id, "tx_hash": tx_hash, "confirmations": row.confirmations }),
                );
                self.notifier.notify(
                    row.user_id,
                    "withdrawal_confirmed",
                    json!({ "withdrawal_id": row.id, "tx_hash": tx_hash, "net_amount": row.net_amount }),
                );
                Ok(Some(true))
            }
            TxOutcome::Failed { reason } => {
                warn!(withdrawal_id = row.id, tx_hash, reason, "withdrawal failed on chain");
                row.failure_reason = Some(reason);
                self.advance(&mut row, WithdrawalStatus::Failed).await?;
                self.ledger.unlock(row.user_id, row.id).await?;
                self.report_failure(&row);
                Ok(Some(false))
            }
            TxOutcome::Pending => {
                if !older_than(row.processed_at.or(Some(row.updated_at)), self.config.confirm_timeout) {
                    return Ok(None);
                }
                // The payout may still land: the lock stays until `reconcile` settles it.
                error!(withdrawal_id = row.id, tx_hash, "withdrawal confirmation timed out, funds stay locked");
                row.failure_reason = Some(CONFIRM_TIMEOUT.into());
                self.advance(&mut row, WithdrawalStatus::Failed).await?;
                self.audit.record(
                    "withdrawal_timeout",
                    json!({ "withdrawal_id": row.id, "user_id": row.user_id, "tx_hash": tx_hash, "amount": row.amount }),
                );
                Ok(Some(false))
            }
        }
    }

    /// Master wallet balances available for payouts.
    pub async fn master_balances(&self) -> CustodyResult<(Decimal, Decimal)> {
        let master = self.keys.master_address();
        Ok((self.chain.asset_balance(master, &self.asset).await?, self.chain.native_balance(master).await?))
    }

    /// Settle withdrawals no worker will pick up again.
    ///
    /// Rows left in PROCESSING or BROADCASTING by an interrupted pass are
    /// adopted as SENT when their transaction landed, and otherwise go back to
    /// the queue once the transaction can no longer land. FAILED rows that
    /// still hold a ledger lock get a final debit if the payout landed after
    /// all, and are released once it is known not to.
    pub async fn reconcile(&self) -> CustodyResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for status in [WithdrawalStatus::Processing, WithdrawalStatus::Broadcasting] {
            for row in self.store.withdrawals_by_status(status).await? {
                // Workers hold the marker for the whole pass; a free marker means an orphan.
                let Some(guard) = LockGuard::acquire(&self.kv, processing_key(row.id), self.config.processing_ttl).await?
                else {
                    continue;
                };
                let result = self.resume_interrupted(row.id, &mut report).await;
                guard.release().await;
                if let Err(e) = result {
                    warn!(withdrawal_id = row.id, error = %e, "interrupted withdrawal not resumed");
                }
            }
        }
        for row in self.store.withdrawals_by_status(WithdrawalStatus::Failed).await? {
            if !self.ledger.has_open_lock(row.id).await? {
                continue;
            }
            let id = row.id;
            if let Err(e) = self.settle_failed(row, &mut report).await {
                warn!(withdrawal_id = id, error = %e, "failed withdrawal not settled");
            }
        }
        if report != ReconcileReport::default() {
            info!(?report, "withdrawals reconciled");
        }
        Ok(report)
    }

    async fn resume_interrupted(&self, id: u64, report: &mut ReconcileReport) -> CustodyResult<()> {
        let Some(mut row) = self.store.get_withdrawal(id).await? else {
            return Ok(());
        };
        if !matches!(row.status, WithdrawalStatus::Processing | WithdrawalStatus::Broadcasting) {
            return Ok(());
        }
        if let Some(tx_hash) = row.tx_hash.clone() {
            match self.chain.transaction_result(&tx_hash).await? {
                TxOutcome::Success { block } => {
                    warn!(withdrawal_id = id, tx_hash, "interrupted withdrawal was paid, adopting it");
                    row.block = block;
                    self.mark_sent(&mut row, tx_hash).await?;
                    report.adopted += 1;
                    return Ok(());
                }
                TxOutcome::Pending if !older_than(row.processed_at, self.config.tx_expiry) => return Ok(()),
                _ => row.tx_hash = None,
            }
        }
        warn!(withdrawal_id = id, status = row.status.as_str(), "requeueing interrupted withdrawal");
        self.advance(&mut row, WithdrawalStatus::Pending).await?;
        self.queue.enqueue(id).await?;
        report.requeued += 1;
        Ok(())
    }

    async fn settle_failed(&self, row: WithdrawalRequest, report: &mut ReconcileReport) -> CustodyResult<()> {
        let outcome = match row.tx_hash.as_deref() {
            Some(tx_hash) => Some(self.chain.transaction_result(tx_hash).await?),
            None => None,
        };
        let paid = match outcome {
            Some(TxOutcome::Success { .. }) => true,
            Some(TxOutcome::Pending) => {
                let settle_by = self.config.confirm_timeout + self.config.tx_expiry;
                if !older_than(row.processed_at.or(Some(row.updated_at)), settle_by) {
                    return Ok(());
                }
                false
            }
            Some(TxOutcome::Failed { .. }) | None => false,
        };

        if paid {
            self.ledger.finalize_debit(row.user_id, row.amount, row.id).await?;
            report.finalized += 1;
        } else {
            self.ledger.unlock(row.user_id, row.id).await?;
            report.released += 1;
        }
        warn!(withdrawal_id = row.id, tx_hash = ?row.tx_hash, paid, "failed withdrawal settled");
        self.audit.record(
            "withdrawal_reconciled",
            json!({ "withdrawal_id": row.id, "user_id": row.user_id, "tx_hash": row.tx_hash, "paid": paid, "amount": row.amount }),
        );
        self.notifier.notify(row.user_id, "withdrawal_reconciled", json!({ "withdrawal_id": row.id, "paid": paid }));
        Ok(())
    }
}

/// Counts from one [`WithdrawalProcessor::reconcile`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub adopted: usize,
    pub requeued: usize,
    pub finalized: usize,
    pub released: usize,
}

enum Payout {
    Sent,
    /// An earlier broadcast may still land.
    Deferred,
}

/// Failure reason on SENT withdrawals that never confirmed.
const CONFIRM_TIMEOUT: &str = "confirmation timeout";

/// The chain turned the transaction away, so its hash can never land.
fn refused(e: &CustodyError) -> bool {
    matches!(e, CustodyError::BroadcastRejected(reason) if !reason.contains("DUP_TRANSACTION"))
}

fn older_than(at: Option<DateTime<Utc>>, age: Duration) -> bool {
    let Ok(age) = chrono::Duration::from_std(age) else {
        return false;
    };
    at.map_or(true, |at| Utc::now() - at >= age)
}

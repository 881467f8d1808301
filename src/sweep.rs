//! Sweep orchestrator - moves detected deposits into the master wallet.
//!
//! A sweep signs with the deposit address's own key, so the address needs
//! TRX for fees first; the master funds it on demand and we poll until the
//! top-up shows. Credit to the ledger only happens once the sweep confirms.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::chain::{Asset, ChainGateway, ConfirmReport, TxOutcome};
use crate::config::SweepConfig;
use crate::error::{CustodyError, CustodyResult, ErrorKind};
use crate::keys::{KeyRing, TronAddress};
use crate::kv::{KvStore, LockGuard};
use crate::ledger::{deposit_key, Ledger};
use crate::signer;
use crate::sinks::{AuditSink, NotificationSink};
use crate::store::{DepositRecord, DepositStatus, GasTopup, NewSweep, Store, SweepAttempt, TransferStatus};

pub const SWEEP_LOCK: &str = "sweep:lock";
pub const STATS_KEY: &str = "sweep:stats";

pub fn address_lock_key(address: &TronAddress) -> String { format!("sweep:address:{}", address) }

/// Result of one single-deposit sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub deposit_id: u64,
    pub sweep_id: Option<u64>,
    pub source: TronAddress,
    pub amount: Decimal,
    pub tx_hash: Option<String>,
    pub gas_funded: bool,
    pub error: Option<String>,
}

impl SweepOutcome {
    pub fn is_sent(&self) -> bool { self.tx_hash.is_some() && self.error.is_none() }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepRun {
    pub attempted: usize,
    pub sent: usize,
    pub total_amount: Decimal,
    pub gas_topups: usize,
    pub outcomes: Vec<SweepOutcome>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SweepRun {
    fn push(&mut self, outcome: SweepOutcome) {
        self.attempted += 1;
        if outcome.is_sent() {
            self.sent += 1;
            self.total_amount += outcome.amount;
        }
        if outcome.gas_funded {
            self.gas_topups += 1;
        }
        self.outcomes.push(outcome);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepStats {
    pub unswept_deposits: usize,
    pub unswept_amount: Decimal,
    pub is_sweeping: bool,
    pub enabled: bool,
    pub last_run: Option<SweepRun>,
}

pub struct SweepOrchestrator {
    chain: Arc<dyn ChainGateway>,
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    keys: Arc<KeyRing>,
    ledger: Arc<Ledger>,
    notifier: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditSink>,
    asset: TronAddress,
    config: SweepConfig,
}

impl SweepOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainGateway>,
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        keys: Arc<KeyRing>,
        ledger: Arc<Ledger>,
        notifier: Arc<dyn NotificationSink>,
        audit: Arc<dyn AuditSink>,
        asset: TronAddress,
        config: SweepConfig,
    ) -> Self {
        Self { chain, store, kv, keys, ledger, notifier, audit, asset, config }
    }

    fn master(&self) -> &TronAddress { self.keys.master_address() }

    /// Scheduled pass over unswept deposits. `Ok(None)` when disabled or
    /// another pass holds `sweep:lock`.
    pub async fn sweep_pending(&self) -> CustodyResult<Option<SweepRun>> {
        if !self.config.enabled {
            debug!("sweeping disabled");
            return Ok(None);
        }
        let Some(guard) = LockGuard::acquire(&self.kv, SWEEP_LOCK, self.config.lock_ttl).await? else {
            debug!("sweep already in progress, skipping");
            return Ok(None);
        };
        let result = self.sweep_pending_locked().await;
        guard.release().await;
        result.map(Some)
    }

    async fn sweep_pending_locked(&self) -> CustodyResult<SweepRun> {
        let deposits: Vec<DepositRecord> = self
            .store
            .unswept_deposits(usize::MAX)
            .await?
            .into_iter()
            .filter(|d| d.amount >= self.config.min_sweep_amount)
            .take(self.config.batch_size)
            .collect();
        let mut run = SweepRun::default();
        if deposits.is_empty() {
            debug!("no deposits to sweep");
            return Ok(run);
        }

        let master_trx = self.chain.native_balance(self.master()).await?;
        let required = self.config.gas_amount * Decimal::from(deposits.len() as u64);
        if master_trx < required {
            error!(%master_trx, %required, "master wallet cannot fund gas for this sweep batch");
            return Err(CustodyError::InsufficientOnChain {
                address: self.master().to_string(),
                required,
                available: master_trx,
            });
        }

        info!(count = deposits.len(), "sweeping deposits");
        for deposit in &deposits {
            match self.sweep_deposit(deposit.id).await {
                Ok(outcome) => run.push(outcome),
                Err(CustodyError::Busy(key)) => debug!(deposit_id = deposit.id, key, "address busy, left for next pass"),
                Err(e) => {
                    warn!(deposit_id = deposit.id, error = %e, "sweep not attempted");
                    run.push(SweepOutcome {
                        deposit_id: deposit.id,
                        sweep_id: None,
                        source: deposit.to_address,
                        amount: deposit.amount,
                        tx_hash: None,
                        gas_funded: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        run.finished_at = Some(Utc::now());
        info!(sent = run.sent, attempted = run.attempted, total = %run.total_amount, "sweep pass completed");
        self.save_run(&run).await;
        Ok(run)
    }

    async fn save_run(&self, run: &SweepRun) {
        let saved = match serde_json::to_string(run) {
            Ok(body) => self.kv.set(STATS_KEY, &body, None).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = saved {
            warn!(error = %e, "could not store sweep stats");
        }
    }

    /// Sweep one deposit under its address lock. `Busy` if the address is being swept.
    pub async fn sweep_deposit(&self, deposit_id: u64) -> CustodyResult<SweepOutcome> {
        let deposit = self
            .store
            .get_deposit(deposit_id)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("deposit {}", deposit_id)))?;
        let lock_key = address_lock_key(&deposit.to_address);
        let Some(guard) = LockGuard::acquire(&self.kv, lock_key.as_str(), self.config.address_lock_ttl).await? else {
            return Err(CustodyError::Busy(lock_key));
        };
        let result = self.sweep_locked(deposit_id).await;
        guard.release().await;
        result
    }

    async fn sweep_locked(&self, deposit_id: u64) -> CustodyResult<SweepOutcome> {
        // Re-read under the lock: the row we were handed may be stale.
        let deposit = self
            .store
            .get_deposit(deposit_id)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("deposit {}", deposit_id)))?;
        if deposit.is_swept || deposit.status != DepositStatus::Pending {
            return Err(CustodyError::InvalidTransition(format!("deposit {} is already swept", deposit.id)));
        }
        let source = self
            .store
            .find_address(&deposit.to_address)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("pool address {}", deposit.to_address)))?;

        let retry_count = self.store.sweep_count_for(deposit.id).await?;
        if retry_count >= self.config.max_attempts {
            error!(deposit_id = deposit.id, attempts = retry_count, "sweep attempts exhausted, parking deposit");
            self.store.set_deposit_status(deposit.id, DepositStatus::Failed).await?;
            self.audit.record(
                "sweep_attempts_exhausted",
                json!({ "deposit_id": deposit.id, "address": deposit.to_address, "attempts": retry_count }),
            );
            return Err(CustodyError::InvalidTransition(format!(
                "deposit {} exhausted {} sweep attempts",
                deposit.id, retry_count
            )));
        }
        let mut sweep = self
            .store
            .insert_sweep(NewSweep {
                deposit_id: deposit.id,
                source_index: source.index,
                source: source.address,
                destination: *self.master(),
                amount: deposit.amount,
                retry_count,
            })
            .await?;
        info!(deposit_id = deposit.id, sweep_id = sweep.id, amount = %deposit.amount, from = %source.address, "sweeping deposit");

        let mut gas_funded = false;
        let attempt = self.attempt(&deposit, &mut sweep, &mut gas_funded).await;
        let mut outcome = SweepOutcome {
            deposit_id: deposit.id,
            sweep_id: Some(sweep.id),
            source: sweep.source,
            amount: sweep.amount,
            tx_hash: sweep.tx_hash.clone(),
            gas_funded,
            error: None,
        };
        if let Err(e) = attempt {
            if e.kind() == ErrorKind::Invariant {
                error!(deposit_id = deposit.id, sweep_id = sweep.id, error = %e, "sweep aborted on invariant violation");
                self.audit.record(
                    "sweep_invariant_violation",
                    json!({ "deposit_id": deposit.id, "sweep_id": sweep.id, "error": e.to_string() }),
                );
            } else {
                warn!(deposit_id = deposit.id, sweep_id = sweep.id, error = %e, "sweep failed");
            }
            sweep.status = TransferStatus::Failed;
            sweep.error = Some(e.to_string());
            self.store.update_sweep(&sweep).await?;
            outcome.error = sweep.error.clone();
        }
        Ok(outcome)
    }

    async fn attempt(&self, deposit: &DepositRecord, sweep: &mut SweepAttempt, gas_funded: &mut bool) -> CustodyResult<()> {
        self.ensure_asset_balance(&sweep.source, sweep.amount).await?;

        let trx = self.chain.native_balance(&sweep.source).await?;
        if trx < self.config.gas_threshold {
            info!(address = %sweep.source, %trx, threshold = %self.config.gas_threshold, "deposit address needs gas");
            self.fund_gas(sweep.source_index, &sweep.source).await?;
            *gas_funded = true;
            if !self.wait_for_gas(&sweep.source).await? {
                return Err(CustodyError::TransactionFailed("gas not confirmed".into()));
            }
            // Time has passed; check again right before signing.
            self.ensure_asset_balance(&sweep.source, sweep.amount).await?;
        }

        let unsigned = self
            .chain
            .build_unsigned_transfer(&sweep.source, &sweep.destination, sweep.amount, &Asset::Token(self.asset))
            .await?;
        let key = self.keys.signing_key(sweep.source_index)?;
        let signed = signer::sign_transaction(&unsigned, &key, &sweep.source)?;
        let tx_hash = self.chain.broadcast(&signed).await?;

        sweep.tx_hash = Some(tx_hash.clone());
        sweep.status = TransferStatus::Sent;
        self.store.update_sweep(sweep).await?;
        if !self.store.mark_deposit_swept(deposit.id, &tx_hash).await? {
            error!(deposit_id = deposit.id, tx_hash, "deposit was already marked swept");
            self.audit.record("double_sweep_detected", json!({ "deposit_id": deposit.id, "tx_hash": tx_hash }));
        }
        info!(deposit_id = deposit.id, sweep_id = sweep.id, tx_hash, "sweep broadcast");
        Ok(())
    }

    async fn ensure_asset_balance(&self, address: &TronAddress, amount: Decimal) -> CustodyResult<()> {
        let available = self.chain.asset_balance(address, &self.asset).await?;
        if available < amount {
            return Err(CustodyError::InsufficientOnChain { address: address.to_string(), required: amount, available });
        }
        Ok(())
    }

    async fn fund_gas(&self, target_index: u32, target: &TronAddress) -> CustodyResult<GasTopup> {
        let mut topup = self.store.insert_gas_topup(target_index, target, self.config.gas_amount).await?;
        match self.send_gas(target).await {
            Ok(tx_hash) => {
                info!(target = %target, amount = %topup.amount, tx_hash, topup_id = topup.id, "gas sent");
                topup.tx_hash = Some(tx_hash);
                topup.status = TransferStatus::Sent;
                self.store.update_gas_topup(&topup).await?;
                Ok(topup)
            }
            Err(e) => {
                warn!(target = %target, error = %e, "gas top-up failed");
                topup.status = TransferStatus::Failed;
                topup.error = Some(e.to_string());
                self.store.update_gas_topup(&topup).await?;
                Err(e)
            }
        }
    }

    async fn send_gas(&self, target: &TronAddress) -> CustodyResult<String> {
        let master = *self.master();
        let unsigned = self.chain.build_unsigned_transfer(&master, target, self.config.gas_amount, &Asset::Native).await?;
        let key = self.keys.master_key()?;
        let signed = signer::sign_transaction(&unsigned, &key, &master)?;
        self.chain.broadcast(&signed).await
    }

    async fn wait_for_gas(&self, address: &TronAddress) -> CustodyResult<bool> {
        for attempt in 1..=self.config.gas_poll_attempts {
            let trx = self.chain.native_balance(address).await?;
            if trx >= self.config.gas_threshold {
                return Ok(true);
            }
            debug!(address = %address, attempt, %trx, "waiting for gas");
            tokio::time::sleep(self.config.gas_poll_interval).await;
        }
        Ok(false)
    }

    /// Resolve SENT sweeps. A confirmed sweep credits its deposit exactly once.
    pub async fn confirm_sweeps(&self) -> CustodyResult<ConfirmReport> {
        let sent = self.store.sweeps_by_status(TransferStatus::Sent).await?;
        let mut report = ConfirmReport::default();
        for mut sweep in sent {
            report.checked += 1;
            let Some(tx_hash) = sweep.tx_hash.clone() else {
                warn!(sweep_id = sweep.id, "SENT sweep without a hash");
                continue;
            };
            let outcome = match self.chain.transaction_result(&tx_hash).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(sweep_id = sweep.id, tx_hash, error = %e, "could not check sweep");
                    report.still_pending += 1;
                    continue;
                }
            };
            match outcome {
                TxOutcome::Success { block } => {
                    // The sweep stays SENT, so the next pass credits it again.
                    if let Err(e) = self.credit_deposit(sweep.deposit_id).await {
                        error!(
                            sweep_id = sweep.id,
                            deposit_id = sweep.deposit_id,
                            tx_hash,
                            error = %e,
                            "swept deposit not credited"
                        );
                        report.still_pending += 1;
                        continue;
                    }
                    sweep.status = TransferStatus::Confirmed;
                    self.store.update_sweep(&sweep).await?;
                    info!(sweep_id = sweep.id, tx_hash, ?block, amount = %sweep.amount, "sweep confirmed");
                    report.confirmed += 1;
                }
                TxOutcome::Failed { reason } => {
                    warn!(sweep_id = sweep.id, tx_hash, reason, "sweep failed on chain");
                    self.fail_sweep(&mut sweep, reason).await?;
                    report.failed += 1;
                }
                TxOutcome::Pending if expired(sweep.updated_at, self.config.confirm_timeout) => {
                    error!(sweep_id = sweep.id, tx_hash, "sweep confirmation timed out");
                    self.fail_sweep(&mut sweep, "confirmation timeout".into()).await?;
                    report.failed += 1;
                }
                TxOutcome::Pending => report.still_pending += 1,
            }
        }
        if report.checked > 0 {
            debug!(?report, "sweep confirmation pass");
        }
        Ok(report)
    }

    async fn fail_sweep(&self, sweep: &mut SweepAttempt, reason: String) -> CustodyResult<()> {
        self.store.reset_deposit_sweep(sweep.deposit_id, &reason).await?;
        sweep.status = TransferStatus::Failed;
        sweep.error = Some(reason);
        self.store.update_sweep(sweep).await
    }

    /// Credit a swept deposit to its owner. `false` if it was already credited.
    pub async fn credit_deposit(&self, deposit_id: u64) -> CustodyResult<bool> {
        let deposit = self
            .store
            .get_deposit(deposit_id)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("deposit {}", deposit_id)))?;
        if deposit.credited_amount.is_some() {
            return Ok(false);
        }
        if !deposit.is_swept {
            return Err(CustodyError::Invariant(format!("deposit {} credited before its sweep", deposit_id)));
        }

        let fresh = self
            .ledger
            .credit(deposit.user_id, deposit.amount, &deposit_key(deposit.id), &deposit.tx_hash)
            .await?;
        let marked = self.store.mark_deposit_credited(deposit.id, deposit.amount).await?;
        if fresh && !marked {
            error!(deposit_id, "ledger credited a deposit that was already marked credited");
            self.audit.record("double_credit_detected", json!({ "deposit_id": deposit_id }));
        }
        if fresh {
            info!(user_id = %deposit.user_id, deposit_id, amount = %deposit.amount, "deposit credited");
            self.notifier.notify(
                deposit.user_id,
                "deposit_confirmed",
                json!({ "deposit_id": deposit.id, "tx_hash": deposit.tx_hash, "amount": deposit.amount }),
            );
        }
        Ok(fresh)
    }

    /// Resolve SENT gas top-ups, same pattern as sweeps.
    pub async fn confirm_gas_topups(&self) -> CustodyResult<ConfirmReport> {
        let sent = self.store.gas_topups_by_status(TransferStatus::Sent).await?;
        let mut report = ConfirmReport::default();
        for mut topup in sent {
            report.checked += 1;
            let Some(tx_hash) = topup.tx_hash.clone() else { continue };
            match self.chain.transaction_result(&tx_hash).await {
                Ok(TxOutcome::Success { .. }) => {
                    topup.status = TransferStatus::Confirmed;
                    info!(topup_id = topup.id, target = %topup.target, amount = %topup.amount, tx_hash, "gas top-up confirmed");
                    report.confirmed += 1;
                }
                Ok(TxOutcome::Failed { reason }) => {
                    warn!(topup_id = topup.id, tx_hash, reason, "gas top-up failed on chain");
                    topup.status = TransferStatus::Failed;
                    topup.error = Some(reason);
                    report.failed += 1;
                }
                Ok(TxOutcome::Pending) if expired(topup.updated_at, self.config.gas_confirm_timeout) => {
                    error!(topup_id = topup.id, tx_hash, "gas top-up confirmation timed out");
                    topup.status = TransferStatus::Failed;
                    topup.error = Some("confirmation timeout".into());
                    report.failed += 1;
                }
                Ok(TxOutcome::Pending) => {
                    report.still_pending += 1;
                    continue;
                }
                Err(e) => {
                    warn!(topup_id = topup.id, tx_hash, error = %e, "could not check gas top-up");
                    report.still_pending += 1;
                    continue;
                }
            }
            self.store.update_gas_topup(&topup).await?;
        }
        Ok(report)
    }

    /// Manual sweep of every unswept deposit on one address.
    pub async fn sweep_address(&self, address: &TronAddress) -> CustodyResult<SweepRun> {
        info!(address = %address, "manual sweep");
        let deposits = self.store.unswept_deposits_for(address).await?;
        let mut run = SweepRun::default();
        for deposit in deposits {
            run.push(self.sweep_deposit(deposit.id).await?);
        }
        run.finished_at = Some(Utc::now());
        Ok(run)
    }

    pub async fn stats(&self) -> CustodyResult<SweepStats> {
        let unswept = self.store.unswept_deposits(usize::MAX).await?;
        let last_run = match self.kv.get(STATS_KEY).await? {
            Some(body) => serde_json::from_str(&body).ok(),
            None => None,
        };
        Ok(SweepStats {
            unswept_deposits: unswept.len(),
            unswept_amount: unswept.iter().map(|d| d.amount).sum(),
            is_sweeping: self.kv.exists(SWEEP_LOCK).await?,
            enabled: self.config.enabled,
            last_run,
        })
    }
}

fn expired(since: DateTime<Utc>, timeout: std::time::Duration) -> bool {
    chrono::Duration::from_std(timeout).map_or(false, |t| Utc::now() - since > t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::config::LedgerConfig;
    use crate::keys::MasterSeed;
    use crate::kv::MemoryKv;
    use crate::sinks::CollectingSink;
    use crate::store::{
        AddressRepository, AddressStatus, DepositRepository, DerivedAddress, GasRepository, MemoryStore, NewDeposit,
        SweepRepository,
    };
    use std::time::Duration;
    use uuid::Uuid;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    struct Rig {
        chain: Arc<MemoryChain>,
        store: Arc<MemoryStore>,
        kv: Arc<MemoryKv>,
        ledger: Arc<Ledger>,
        sink: Arc<CollectingSink>,
        sweeper: Arc<SweepOrchestrator>,
        keys: Arc<KeyRing>,
        token: TronAddress,
    }

    fn rig(config: SweepConfig) -> Rig {
        let keys = Arc::new(KeyRing::new(MasterSeed::from_mnemonic(TEST_MNEMONIC).unwrap()).unwrap());
        let token = keys.address(9_999).unwrap();
        let chain = Arc::new(MemoryChain::new(100));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        let sink = Arc::new(CollectingSink::new());
        let ledger = Arc::new(Ledger::new(store.clone(), kv.clone(), sink.clone(), LedgerConfig::default()));
        let sweeper = Arc::new(SweepOrchestrator::new(
            chain.clone(),
            store.clone(),
            kv.clone(),
            keys.clone(),
            ledger.clone(),
            sink.clone(),
            sink.clone(),
            token,
            config,
        ));
        Rig { chain, store, kv, ledger, sink, sweeper, keys, token }
    }

    fn fast() -> SweepConfig {
        SweepConfig { gas_poll_attempts: 2, gas_poll_interval: Duration::from_millis(5), ..Default::default() }
    }

    /// An owned pool address at `index` holding a recorded deposit of `amount`.
    async fn deposit(r: &Rig, index: u32, user: Uuid, amount: Decimal) -> DepositRecord {
        let address = r.keys.address(index).unwrap();
        let mut row = DerivedAddress::free(index, address);
        row.status = AddressStatus::Active;
        row.owner = Some(user);
        r.store.insert_addresses(&[row]).await.unwrap();
        let payer = r.keys.address(500).unwrap();
        let tx_hash = r.chain.deposit(&r.token, &payer, &address, amount);
        r.store
            .insert_deposit(NewDeposit { tx_hash, from_address: payer, to_address: address, user_id: user, amount, block: 101 })
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn sweep_funds_gas_then_credits_once_on_confirmation() {
        let r = rig(fast());
        r.chain.set_native(r.keys.master_address(), Decimal::from(100));
        let user = Uuid::new_v4();
        let d = deposit(&r, 1, user, Decimal::new(105, 1)).await;

        let run = r.sweeper.sweep_pending().await.unwrap().unwrap();
        assert_eq!((run.attempted, run.sent, run.gas_topups), (1, 1, 1));
        assert_eq!(r.chain.token_of(r.keys.master_address(), &r.token), Decimal::new(105, 1));
        let swept = r.store.get_deposit(d.id).await.unwrap().unwrap();
        assert!(swept.is_swept);
        assert_eq!(swept.status, DepositStatus::Pending);
        assert_eq!(r.ledger.balance(user).await.unwrap(), Decimal::ZERO);

        let report = r.sweeper.confirm_sweeps().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(r.ledger.balance(user).await.unwrap(), Decimal::new(105, 1));
        assert!(r.sink.notified(user, "deposit_confirmed"));

        // Second poll and a direct re-credit are both no-ops.
        assert_eq!(r.sweeper.confirm_sweeps().await.unwrap().checked, 0);
        assert!(!r.sweeper.credit_deposit(d.id).await.unwrap());
        assert_eq!(r.ledger.balance(user).await.unwrap(), Decimal::new(105, 1));
        let done = r.store.get_deposit(d.id).await.unwrap().unwrap();
        assert_eq!(done.credited_amount, Some(Decimal::new(105, 1)));
        assert_eq!(done.status, DepositStatus::Completed);

        let gas = r.sweeper.confirm_gas_topups().await.unwrap();
        assert_eq!(gas.confirmed, 1);
    }

    #[tokio::test]
    async fn concurrent_sweeps_broadcast_once() {
        let r = rig(fast());
        r.chain.set_native(r.keys.master_address(), Decimal::from(100));
        let d = deposit(&r, 2, Uuid::new_v4(), Decimal::from(20)).await;
        r.chain.set_native(&d.to_address, Decimal::from(30));

        let (a, b) = tokio::join!(r.sweeper.sweep_deposit(d.id), r.sweeper.sweep_deposit(d.id));
        let sent = [a, b].into_iter().filter(|res| matches!(res, Ok(o) if o.is_sent())).count();
        assert_eq!(sent, 1);
        assert_eq!(r.chain.broadcasts().len(), 1);
        assert!(r.sweeper.sweep_deposit(d.id).await.is_err());
    }

    #[tokio::test]
    async fn short_balance_and_unconfirmed_gas_fail_the_attempt() {
        let r = rig(fast());
        r.chain.set_native(r.keys.master_address(), Decimal::from(100));
        let d = deposit(&r, 3, Uuid::new_v4(), Decimal::from(20)).await;
        // Another process drained the address.
        r.chain.set_token(&d.to_address, &r.token, Decimal::from(5));
        let outcome = r.sweeper.sweep_deposit(d.id).await.unwrap();
        assert!(outcome.error.unwrap().contains("insufficient on-chain balance"));
        assert!(!r.store.get_deposit(d.id).await.unwrap().unwrap().is_swept);

        // Gas never shows: the master's transfer is refused.
        r.chain.set_token(&d.to_address, &r.token, Decimal::from(20));
        r.chain.fail_next_broadcasts(1, "SERVER_BUSY");
        let outcome = r.sweeper.sweep_deposit(d.id).await.unwrap();
        assert!(outcome.error.is_some());
        assert_eq!(r.store.gas_topups_by_status(TransferStatus::Failed).await.unwrap().len(), 1);
        assert_eq!(r.store.sweeps_by_status(TransferStatus::Failed).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_sweep_releases_deposit_for_next_pass() {
        let r = rig(fast());
        r.chain.set_native(r.keys.master_address(), Decimal::from(100));
        let d = deposit(&r, 4, Uuid::new_v4(), Decimal::from(20)).await;
        let outcome = r.sweeper.sweep_deposit(d.id).await.unwrap();
        let tx_hash = outcome.tx_hash.unwrap();
        r.chain.set_outcome(&tx_hash, TxOutcome::Failed { reason: "OUT_OF_ENERGY".into() });

        let report = r.sweeper.confirm_sweeps().await.unwrap();
        assert_eq!(report.failed, 1);
        let reset = r.store.get_deposit(d.id).await.unwrap().unwrap();
        assert!(!reset.is_swept);
        assert_eq!(reset.error.as_deref(), Some("OUT_OF_ENERGY"));
    }

    #[tokio::test]
    async fn exhausted_attempts_park_the_deposit() {
        let r = rig(SweepConfig { max_attempts: 2, ..fast() });
        r.chain.set_native(r.keys.master_address(), Decimal::from(100));
        let d = deposit(&r, 6, Uuid::new_v4(), Decimal::from(20)).await;
        r.chain.set_token(&d.to_address, &r.token, Decimal::ZERO);

        for _ in 0..2 {
            assert!(r.sweeper.sweep_deposit(d.id).await.unwrap().error.is_some());
        }
        assert!(matches!(r.sweeper.sweep_deposit(d.id).await, Err(CustodyError::InvalidTransition(_))));
        assert_eq!(r.store.get_deposit(d.id).await.unwrap().unwrap().status, DepositStatus::Failed);
        assert!(r.sink.audit_events().contains(&"sweep_attempts_exhausted".to_string()));
        assert_eq!(r.sweeper.stats().await.unwrap().unswept_deposits, 0);
    }

    #[tokio::test]
    async fn pass_is_skipped_when_locked_or_dust() {
        let r = rig(fast());
        r.chain.set_native(r.keys.master_address(), Decimal::from(100));
        deposit(&r, 5, Uuid::new_v4(), Decimal::from(1)).await;
        let run = r.sweeper.sweep_pending().await.unwrap().unwrap();
        assert_eq!(run.attempted, 0);

        r.kv.set_nx(SWEEP_LOCK, "elsewhere", Duration::from_secs(60)).await.unwrap();
        assert!(r.sweeper.sweep_pending().await.unwrap().is_none());
        let stats = r.sweeper.stats().await.unwrap();
        assert!(stats.is_sweeping);
        assert_eq!(stats.unswept_deposits, 1);
    }

    #[tokio::test]
    async fn credit_failure_does_not_stop_the_confirmation_pass() {
        let r = rig(fast());
        r.chain.set_native(r.keys.master_address(), Decimal::from(100));
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let stuck = deposit(&r, 7, alice, Decimal::from(20)).await;
        let fine = deposit(&r, 8, bob, Decimal::from(30)).await;
        let stuck_hash = r.sweeper.sweep_deposit(stuck.id).await.unwrap().tx_hash.unwrap();
        assert!(r.sweeper.sweep_deposit(fine.id).await.unwrap().is_sent());

        // The first deposit row falls out of step with its sweep and cannot be credited.
        assert!(r.store.reset_deposit_sweep(stuck.id, "out of step").await.unwrap());
        let report = r.sweeper.confirm_sweeps().await.unwrap();
        assert_eq!((report.checked, report.confirmed, report.still_pending), (2, 1, 1));
        assert_eq!(r.ledger.balance(bob).await.unwrap(), Decimal::from(30));
        assert_eq!(r.ledger.balance(alice).await.unwrap(), Decimal::ZERO);
        assert_eq!(r.store.sweeps_by_status(TransferStatus::Sent).await.unwrap().len(), 1);

        assert!(r.store.mark_deposit_swept(stuck.id, &stuck_hash).await.unwrap());
        let report = r.sweeper.confirm_sweeps().await.unwrap();
        assert_eq!((report.checked, report.confirmed), (1, 1));
        assert_eq!(r.ledger.balance(alice).await.unwrap(), Decimal::from(20));
    }
}

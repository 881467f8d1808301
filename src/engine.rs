//! Engine - wires the components and exposes the request-layer facade.
//!
//! Built from an [`EngineConfig`], a [`KeyRing`] and the external
//! collaborators. The request layer calls the facade; the background work
//! runs through [`Engine::scheduler`].

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::ChainGateway;
use crate::config::EngineConfig;
use crate::error::CustodyResult;
use crate::keys::{KeyRing, TronAddress};
use crate::kv::KvStore;
use crate::ledger::{Ledger, TransferReceipt};
use crate::pool::AddressPool;
use crate::runtime::EmergencyStop;
use crate::scanner::{DepositScanner, ScannerStats};
use crate::scheduler::{Pollers, Scheduler};
use crate::sinks::{AuditSink, NotificationSink};
use crate::store::{DerivedAddress, LedgerEntry, PoolStats, Store, UserId, WithdrawalRequest};
use crate::sweep::{SweepOrchestrator, SweepStats};
use crate::users::UserDirectory;
use crate::withdrawal::{QueueStats, WithdrawalLimits, WithdrawalProcessor, WithdrawalQueue, WithdrawalService};

/// Point-in-time view for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub master_address: String,
    pub master_asset_balance: Option<Decimal>,
    pub master_native_balance: Option<Decimal>,
    pub latest_block: Option<u64>,
    pub pool: PoolStats,
    pub queue: QueueStats,
    pub sweep: SweepStats,
    pub scanner: Option<ScannerStats>,
    pub emergency_stop: bool,
    pub emergency_reason: Option<String>,
}

pub struct Engine {
    config: EngineConfig,
    keys: Arc<KeyRing>,
    chain: Arc<dyn ChainGateway>,
    pool: Arc<AddressPool>,
    ledger: Arc<Ledger>,
    scanner: Arc<DepositScanner>,
    sweeper: Arc<SweepOrchestrator>,
    queue: Arc<WithdrawalQueue>,
    withdrawals: Arc<WithdrawalService>,
    processor: Arc<WithdrawalProcessor>,
    stop: EmergencyStop,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        keys: KeyRing,
        chain: Arc<dyn ChainGateway>,
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        users: Arc<dyn UserDirectory>,
        notifier: Arc<dyn NotificationSink>,
        audit: Arc<dyn AuditSink>,
    ) -> CustodyResult<Self> {
        config.validate()?;
        let keys = Arc::new(keys);
        let asset = config.chain.asset_contract;

        let pool = Arc::new(AddressPool::new(store.clone(), kv.clone(), keys.clone(), config.pool.clone()));
        let ledger = Arc::new(Ledger::new(store.clone(), kv.clone(), notifier.clone(), config.ledger.clone()));
        let scanner = Arc::new(DepositScanner::new(
            chain.clone(),
            store.clone(),
            kv.clone(),
            pool.clone(),
            notifier.clone(),
            asset,
            config.chain.asset_decimals,
            config.scanner.clone(),
        ));
        let sweeper = Arc::new(SweepOrchestrator::new(
            chain.clone(),
            store.clone(),
            kv.clone(),
            keys.clone(),
            ledger.clone(),
            notifier.clone(),
            audit.clone(),
            asset,
            config.sweep.clone(),
        ));
        let queue = Arc::new(WithdrawalQueue::new(kv.clone()));
        let withdrawals = Arc::new(WithdrawalService::new(
            store.clone(),
            kv.clone(),
            ledger.clone(),
            queue.clone(),
            users,
            notifier.clone(),
            audit.clone(),
            config.withdrawal.clone(),
        ));
        let processor = Arc::new(WithdrawalProcessor::new(
            chain.clone(),
            store,
            kv.clone(),
            keys.clone(),
            ledger.clone(),
            queue.clone(),
            notifier,
            audit.clone(),
            asset,
            config.withdrawal.clone(),
        ));
        let stop = EmergencyStop::new(kv, audit);

        info!(master = %keys.master_address(), network = config.chain.network.as_str(), asset = %asset, "engine ready");
        Ok(Self { config, keys, chain, pool, ledger, scanner, sweeper, queue, withdrawals, processor, stop })
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn master_address(&self) -> &TronAddress { self.keys.master_address() }

    /// Fill the pool up to its initial size. Returns how many were derived.
    pub async fn start(&self) -> CustodyResult<u32> { self.pool.ensure_capacity().await }

    pub fn scheduler(&self) -> Scheduler {
        let pollers = Pollers {
            pool: self.pool.clone(),
            scanner: self.scanner.clone(),
            sweeper: self.sweeper.clone(),
            queue: self.queue.clone(),
            withdrawals: self.withdrawals.clone(),
            processor: self.processor.clone(),
            stop: self.stop.clone(),
        };
        Scheduler::new(pollers, self.config.scheduler.clone())
    }

    pub fn emergency_stop(&self) -> &EmergencyStop { &self.stop }

    pub fn pool(&self) -> &Arc<AddressPool> { &self.pool }
    pub fn ledger(&self) -> &Arc<Ledger> { &self.ledger }
    pub fn scanner(&self) -> &Arc<DepositScanner> { &self.scanner }
    pub fn sweeper(&self) -> &Arc<SweepOrchestrator> { &self.sweeper }
    pub fn withdrawals(&self) -> &Arc<WithdrawalService> { &self.withdrawals }
    pub fn processor(&self) -> &Arc<WithdrawalProcessor> { &self.processor }

    // Request layer

    pub async fn assign_address(&self, user: UserId) -> CustodyResult<DerivedAddress> {
        self.pool.assign_address(user).await
    }

    pub async fn balance(&self, user: UserId) -> CustodyResult<Decimal> { self.ledger.balance(user).await }

    pub async fn available_balance(&self, user: UserId) -> CustodyResult<Decimal> {
        self.ledger.available_balance(user).await
    }

    pub async fn ledger_history(&self, user: UserId, limit: usize) -> CustodyResult<Vec<LedgerEntry>> {
        self.ledger.history(user, limit).await
    }

    pub async fn transfer(
        &self,
        from: UserId,
        to: UserId,
        amount: Decimal,
        description: Option<&str>,
    ) -> CustodyResult<TransferReceipt> {
        self.ledger.transfer(from, to, amount, description).await
    }

    pub async fn submit_withdrawal(
        &self,
        user: UserId,
        to_address: &str,
        amount: Decimal,
        password: &str,
    ) -> CustodyResult<WithdrawalRequest> {
        self.withdrawals.create(user, to_address, amount, password).await
    }

    pub async fn cancel_withdrawal(&self, user: UserId, id: u64) -> CustodyResult<WithdrawalRequest> {
        self.withdrawals.cancel(user, id).await
    }

    pub async fn withdrawal(&self, user: UserId, id: u64) -> CustodyResult<WithdrawalRequest> {
        self.withdrawals.get(user, id).await
    }

    pub async fn withdrawal_history(&self, user: UserId, page: usize, size: usize) -> CustodyResult<Vec<WithdrawalRequest>> {
        self.withdrawals.history(user, page, size).await
    }

    pub async fn withdrawal_limits(&self, user: UserId) -> CustodyResult<WithdrawalLimits> {
        self.withdrawals.limits(user).await
    }

    pub async fn health(&self) -> CustodyResult<Health> {
        let latest_block = match self.chain.latest_block_height().await {
            Ok(height) => Some(height),
            Err(e) => {
                warn!(error = %e, "chain unreachable during health check");
                None
            }
        };
        let (scanner, balances) = match latest_block {
            Some(_) => (self.scanner.stats().await.ok(), self.processor.master_balances().await.ok()),
            None => (None, None),
        };
        Ok(Health {
            master_address: self.keys.master_address().to_string(),
            master_asset_balance: balances.map(|(asset, _)| asset),
            master_native_balance: balances.map(|(_, native)| native),
            latest_block,
            pool: self.pool.stats().await?,
            queue: self.queue.stats().await?,
            sweep: self.sweeper.stats().await?,
            scanner,
            emergency_stop: self.stop.is_active().await,
            emergency_reason: self.stop.reason().await,
        })
    }
}

//! Integration Tests: custody engine end to end on the in-memory chain
//!
//! These tests verify:
//! 1. Address assignment from an empty pool
//! 2. Deposit scan → sweep → confirmed credit, exactly once
//! 3. Withdrawal locks, retries, confirmation and a single debit
//! 4. Terminal withdrawal states stay terminal
//! 5. Emergency stop makes every poller skip its pass
//! 6. P2P transfers and the available-balance invariant
//! 7. Overlapping passes over the same deposit

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tron_custody::config::{PoolConfig, SweepConfig, WithdrawalConfig};
use tron_custody::store::{
    AddressStatus, DepositRecord, DepositRepository, EntryStatus, LedgerRepository, WithdrawalStatus,
};
use tron_custody::{
    CollectingSink, CustodyError, Engine, EngineConfig, Job, KeyRing, MasterSeed, MemoryChain, MemoryKv, MemoryStore,
    Network, StaticUsers, TronAddress,
};

// Test mnemonic (well-known, never use with real funds)
const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const PASSWORD: &str = "correct horse";

fn ring() -> KeyRing {
    KeyRing::new(MasterSeed::from_mnemonic(TEST_MNEMONIC).expect("mnemonic")).expect("key ring")
}

struct Harness {
    engine: Engine,
    chain: Arc<MemoryChain>,
    store: Arc<MemoryStore>,
    users: Arc<StaticUsers>,
    sink: Arc<CollectingSink>,
    keys: KeyRing,
    token: TronAddress,
    payer: TronAddress,
}

impl Harness {
    fn new() -> Self {
        let keys = ring();
        let token = keys.address(9_999).expect("token");
        let payer = keys.address(500).expect("payer");

        let config = EngineConfig::new(Network::Nile)
            .with_asset_contract(token)
            .with_pool(PoolConfig { initial_size: 4, min_threshold: 2, batch_size: 4, ..Default::default() })
            .with_sweep(SweepConfig {
                gas_poll_attempts: 3,
                gas_poll_interval: Duration::from_millis(5),
                ..Default::default()
            })
            .with_withdrawal(WithdrawalConfig { retry_delay: Duration::ZERO, ..Default::default() });

        let chain = Arc::new(MemoryChain::new(100));
        chain.set_native(keys.master_address(), Decimal::from(200));
        let store = Arc::new(MemoryStore::new());
        let users = Arc::new(StaticUsers::new());
        let sink = Arc::new(CollectingSink::new());
        let engine = Engine::new(
            config,
            ring(),
            chain.clone(),
            store.clone(),
            Arc::new(MemoryKv::new()),
            users.clone(),
            sink.clone(),
            sink.clone(),
        )
        .expect("engine");
        Self { engine, chain, store, users, sink, keys, token, payer }
    }

    fn user(&self) -> Uuid {
        let user = Uuid::new_v4();
        self.users.add(user, PASSWORD);
        user
    }

    /// Pay `amount` to the user's deposit address and bury it under enough blocks to scan.
    async fn pay(&self, user: Uuid, amount: Decimal) -> TronAddress {
        let address = self.engine.assign_address(user).await.expect("assign").address;
        self.chain.deposit(&self.token, &self.payer, &address, amount);
        self.chain.mine(3);
        address
    }

    /// Scan, sweep and confirm one deposit. Returns the deposit row.
    async fn deposit(&self, user: Uuid, amount: Decimal) -> DepositRecord {
        self.pay(user, amount).await;
        let report = self.engine.scanner().scan().await.expect("scan").expect("scanner lock");
        assert_eq!(report.deposits.len(), 1);
        let deposit = report.deposits[0].clone();

        let scheduler = self.engine.scheduler();
        assert!(scheduler.run_once(Job::Sweep).await.expect("sweep"));
        assert!(scheduler.run_once(Job::SweepConfirm).await.expect("sweep confirm"));
        self.store.get_deposit(deposit.id).await.expect("store").expect("deposit")
    }
}

/// Test: an empty pool derives a batch on demand and hands out a new address
#[tokio::test]
async fn assign_from_empty_pool() {
    let h = Harness::new();
    assert_eq!(h.engine.pool().stats().await.unwrap().total, 0);

    let user = h.user();
    let assigned = h.engine.assign_address(user).await.unwrap();
    assert_eq!(assigned.status, AddressStatus::Assigned);
    assert_eq!(assigned.owner, Some(user));
    assert!(assigned.index >= 1);
    assert_ne!(&assigned.address, h.keys.master_address());
    assert_eq!(assigned.address, h.keys.address(assigned.index).unwrap());

    let stats = h.engine.pool().stats().await.unwrap();
    assert_eq!((stats.total, stats.free, stats.assigned), (4, 3, 1));

    // Same user, same address.
    assert_eq!(h.engine.assign_address(user).await.unwrap().address, assigned.address);
    let other = h.engine.assign_address(h.user()).await.unwrap();
    assert_ne!(other.address, assigned.address);
}

/// Test: start() fills the pool before any user asks
#[tokio::test]
async fn start_prefills_pool() {
    let h = Harness::new();
    assert_eq!(h.engine.start().await.unwrap(), 4);
    assert_eq!(h.engine.start().await.unwrap(), 0);
    assert_eq!(h.engine.pool().stats().await.unwrap().free, 4);
}

/// Test: 10.5 deposited → scanned, swept, credited once even when polled twice
#[tokio::test]
async fn deposit_is_credited_exactly_once() {
    let h = Harness::new();
    let user = h.user();
    let amount = Decimal::new(105, 1);

    let deposit = h.deposit(user, amount).await;
    assert!(deposit.is_swept);
    assert_eq!(deposit.credited_amount, Some(amount));
    assert_eq!(h.engine.balance(user).await.unwrap(), amount);
    assert_eq!(h.chain.token_of(h.keys.master_address(), &h.token), amount);

    // Confirmation poller runs again on the same hash.
    let scheduler = h.engine.scheduler();
    scheduler.run_once(Job::SweepConfirm).await.unwrap();
    scheduler.run_once(Job::Sweep).await.unwrap();
    assert!(!h.engine.sweeper().credit_deposit(deposit.id).await.unwrap());
    assert_eq!(h.engine.balance(user).await.unwrap(), amount);
    assert_eq!(h.chain.broadcasts().len(), 2, "one gas top-up, one sweep");

    let credits = h.store.entries_for(user, 10).await.unwrap();
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].idempotency_key, format!("DEPOSIT_{}", deposit.id));

    // The address went ACTIVE on its first deposit.
    let stats = h.engine.pool().stats().await.unwrap();
    assert_eq!(stats.active, 1);
    assert!(h.sink.notified(user, "deposit_detected"));
    assert!(h.sink.notified(user, "deposit_confirmed"));
}

/// Test: overlapping scans, sweeps and confirmations still record, sweep and credit once
#[tokio::test]
async fn concurrent_passes_credit_once() {
    let h = Harness::new();
    let user = h.user();
    let amount = Decimal::from(40);
    h.pay(user, amount).await;

    let (a, b) = tokio::join!(h.engine.scanner().scan(), h.engine.scanner().scan());
    let recorded: Vec<DepositRecord> =
        [a.unwrap(), b.unwrap()].into_iter().flatten().flat_map(|report| report.deposits).collect();
    assert_eq!(recorded.len(), 1);
    let deposit = recorded[0].clone();
    assert!(h.store.get_deposit(deposit.id + 1).await.unwrap().is_none());
    assert!(h.engine.scanner().scan().await.unwrap().unwrap().deposits.is_empty());

    let (a, b) = tokio::join!(h.engine.sweeper().sweep_pending(), h.engine.sweeper().sweep_pending());
    let sent: usize = [a.unwrap(), b.unwrap()].into_iter().flatten().map(|run| run.sent).sum();
    assert_eq!(sent, 1);
    assert_eq!(h.chain.broadcasts().len(), 2, "one gas top-up, one sweep");

    let (a, b) = tokio::join!(h.engine.sweeper().confirm_sweeps(), h.engine.sweeper().confirm_sweeps());
    assert!(a.is_ok() && b.is_ok());
    h.engine.scheduler().run_once(Job::SweepConfirm).await.unwrap();

    let credits = h.store.entries_for(user, 10).await.unwrap();
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].idempotency_key, format!("DEPOSIT_{}", deposit.id));
    assert_eq!(h.engine.balance(user).await.unwrap(), amount);
    assert_eq!(h.chain.token_of(h.keys.master_address(), &h.token), amount);
    let stored = h.store.get_deposit(deposit.id).await.unwrap().unwrap();
    assert_eq!(stored.credited_amount, Some(amount));
}

/// Test: a deposit is not recorded until it has the required confirmations
#[tokio::test]
async fn shallow_deposit_waits_for_depth() {
    let h = Harness::new();
    let user = h.user();
    let address = h.engine.assign_address(user).await.unwrap().address;
    h.chain.deposit(&h.token, &h.payer, &address, Decimal::from(7));

    let report = h.engine.scanner().scan().await.unwrap().unwrap();
    assert!(report.deposits.is_empty());

    h.chain.mine(3);
    let report = h.engine.scanner().scan().await.unwrap().unwrap();
    assert_eq!(report.deposits.len(), 1);
    assert_eq!(report.deposits[0].amount, Decimal::from(7));

    // Nothing new after the cursor moved past it.
    h.chain.mine(5);
    assert!(h.engine.scanner().scan().await.unwrap().unwrap().deposits.is_empty());
}

/// Test: the second 60 withdrawal from 100 is refused, the first keeps its lock
#[tokio::test]
async fn second_withdrawal_exceeds_available() {
    let h = Harness::new();
    let user = h.user();
    h.deposit(user, Decimal::from(100)).await;
    let to = h.keys.address(42).unwrap().to_string();

    let first = h.engine.submit_withdrawal(user, &to, Decimal::from(60), PASSWORD).await.unwrap();
    assert_eq!(first.status, WithdrawalStatus::Pending);
    assert_eq!(h.engine.available_balance(user).await.unwrap(), Decimal::from(40));
    assert_eq!(h.engine.balance(user).await.unwrap(), Decimal::from(100));

    let second = h.engine.submit_withdrawal(user, &to, Decimal::from(60), PASSWORD).await;
    assert!(matches!(second, Err(CustodyError::InsufficientBalance { .. })));
    assert_eq!(h.engine.withdrawal_history(user, 0, 10).await.unwrap().len(), 1);
}

/// Test: two refused broadcasts, then success within three retries; debited once
#[tokio::test]
async fn withdrawal_retries_then_confirms() {
    let h = Harness::new();
    let user = h.user();
    h.deposit(user, Decimal::from(100)).await;
    let to = h.keys.address(42).unwrap();

    let request = h.engine.submit_withdrawal(user, &to.to_string(), Decimal::from(60), PASSWORD).await.unwrap();
    h.chain.fail_next_broadcasts(2, "SERVER_BUSY");

    let scheduler = h.engine.scheduler();
    for attempt in 1..=2u32 {
        scheduler.run_once(Job::QueueDrain).await.unwrap();
        let row = h.engine.withdrawal(user, request.id).await.unwrap();
        assert_eq!((row.status, row.retry_count), (WithdrawalStatus::Pending, attempt));
        scheduler.run_once(Job::DelayedPromotion).await.unwrap();
    }
    scheduler.run_once(Job::QueueDrain).await.unwrap();
    let sent = h.engine.withdrawal(user, request.id).await.unwrap();
    assert_eq!(sent.status, WithdrawalStatus::Sent);
    assert_eq!(h.chain.token_of(&to, &h.token), request.net_amount);

    h.chain.mine(20);
    scheduler.run_once(Job::WithdrawalConfirm).await.unwrap();
    scheduler.run_once(Job::WithdrawalConfirm).await.unwrap();
    let done = h.engine.withdrawal(user, request.id).await.unwrap();
    assert_eq!(done.status, WithdrawalStatus::Confirmed);
    assert!(done.confirmations >= 20);

    assert_eq!(h.engine.balance(user).await.unwrap(), Decimal::from(40));
    assert_eq!(h.engine.available_balance(user).await.unwrap(), Decimal::from(40));
    let debits = h
        .engine
        .ledger_history(user, 20)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.amount == Decimal::from(-60) && e.status == EntryStatus::Completed)
        .count();
    assert_eq!(debits, 1);
    assert!(h.sink.notified(user, "withdrawal_confirmed"));
}

/// Test: confirmed and cancelled withdrawals never leave their state
#[tokio::test]
async fn terminal_withdrawals_stay_terminal() {
    let h = Harness::new();
    let user = h.user();
    h.deposit(user, Decimal::from(50)).await;
    let to = h.keys.address(42).unwrap().to_string();
    let scheduler = h.engine.scheduler();

    let cancelled = h.engine.submit_withdrawal(user, &to, Decimal::from(10), PASSWORD).await.unwrap();
    h.engine.cancel_withdrawal(user, cancelled.id).await.unwrap();
    assert_eq!(h.engine.available_balance(user).await.unwrap(), Decimal::from(50));
    assert!(matches!(
        h.engine.cancel_withdrawal(user, cancelled.id).await,
        Err(CustodyError::InvalidTransition(_))
    ));

    let paid = h.engine.submit_withdrawal(user, &to, Decimal::from(10), PASSWORD).await.unwrap();
    scheduler.run_once(Job::QueueDrain).await.unwrap();
    h.chain.mine(20);
    scheduler.run_once(Job::WithdrawalConfirm).await.unwrap();
    assert_eq!(h.engine.withdrawal(user, paid.id).await.unwrap().status, WithdrawalStatus::Confirmed);
    assert!(h.engine.cancel_withdrawal(user, paid.id).await.is_err());

    // Stray queue entries for finished work are ignored.
    let broadcasts = h.chain.broadcasts().len();
    scheduler.run_once(Job::StuckRecovery).await.unwrap();
    scheduler.run_once(Job::QueueDrain).await.unwrap();
    assert_eq!(h.chain.broadcasts().len(), broadcasts);
    assert_eq!(h.engine.withdrawal(user, cancelled.id).await.unwrap().status, WithdrawalStatus::Cancelled);
    assert_eq!(h.engine.balance(user).await.unwrap(), Decimal::from(40));
}

/// Test: while the emergency stop is set, passes are skipped and nothing moves
#[tokio::test]
async fn emergency_stop_skips_passes() {
    let h = Harness::new();
    let user = h.user();
    h.pay(user, Decimal::from(12)).await;
    let scheduler = h.engine.scheduler();

    h.engine.emergency_stop().activate("incident drill").await.unwrap();
    for job in Job::ALL {
        assert!(!scheduler.run_once(job).await.unwrap(), "{} ran", job.name());
    }
    assert_eq!(h.engine.balance(user).await.unwrap(), Decimal::ZERO);
    let health = h.engine.health().await.unwrap();
    assert!(health.emergency_stop);
    assert_eq!(health.emergency_reason.as_deref(), Some("incident drill"));

    h.engine.emergency_stop().resume().await.unwrap();
    assert!(scheduler.run_once(Job::Scan).await.unwrap());
    assert!(scheduler.run_once(Job::Sweep).await.unwrap());
    assert!(scheduler.run_once(Job::SweepConfirm).await.unwrap());
    assert_eq!(h.engine.balance(user).await.unwrap(), Decimal::from(12));
    assert_eq!(h.sink.audit_events()[..2], ["emergency_stop".to_string(), "emergency_resume".to_string()]);
}

/// Test: P2P transfer moves balance and never exceeds what is available
#[tokio::test]
async fn transfer_respects_available_balance() {
    let h = Harness::new();
    let alice = h.user();
    let bob = h.user();
    h.deposit(alice, Decimal::from(30)).await;
    let to = h.keys.address(42).unwrap().to_string();

    h.engine.submit_withdrawal(alice, &to, Decimal::from(20), PASSWORD).await.unwrap();
    let over = h.engine.transfer(alice, bob, Decimal::from(15), None).await;
    assert!(matches!(over, Err(CustodyError::InsufficientBalance { .. })));

    let receipt = h.engine.transfer(alice, bob, Decimal::from(10), Some("rent")).await.unwrap();
    assert_eq!(receipt.net_amount, Decimal::from(10));
    assert_eq!(h.engine.balance(bob).await.unwrap(), Decimal::from(10));
    assert_eq!(h.engine.balance(alice).await.unwrap(), Decimal::from(20));
    assert_eq!(h.engine.available_balance(alice).await.unwrap(), Decimal::ZERO);
    assert!(matches!(h.engine.transfer(alice, alice, Decimal::ONE, None).await, Err(CustodyError::SelfTransfer)));
}

/// Test: health reports chain height, pool and queue state
#[tokio::test]
async fn health_snapshot() {
    let h = Harness::new();
    h.engine.start().await.unwrap();
    let user = h.user();
    h.deposit(user, Decimal::from(25)).await;
    h.engine
        .submit_withdrawal(user, &h.keys.address(42).unwrap().to_string(), Decimal::from(5), PASSWORD)
        .await
        .unwrap();

    let health = h.engine.health().await.unwrap();
    assert_eq!(health.latest_block, Some(h.chain.height()));
    assert_eq!(health.master_address, h.keys.master_address().to_string());
    assert_eq!(health.pool.total, 4);
    assert_eq!(health.pool.active, 1);
    assert_eq!(health.queue.queued, 1);
    assert_eq!(health.sweep.unswept_deposits, 0);
    assert!(!health.emergency_stop);
    assert!(health.scanner.is_some());
    assert_eq!(health.master_asset_balance, Some(Decimal::from(25)));

    let limits = h.engine.withdrawal_limits(user).await.unwrap();
    assert_eq!(limits.daily_used, Decimal::from(5));
}

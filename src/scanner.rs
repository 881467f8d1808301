//! Deposit scanner - walks confirmed blocks and records deposits to pool addresses.
//!
//! One pass system-wide at a time (`deposit:scanner:lock`). The cursor in the
//! KV is the last block fully processed; it only moves after the whole range
//! was recorded, and re-scanning a range is harmless because tx hashes are unique.

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{ChainGateway, TransferEvent};
use crate::config::ScannerConfig;
use crate::error::{CustodyError, CustodyResult};
use crate::keys::TronAddress;
use crate::kv::{KvStore, LockGuard};
use crate::pool::AddressPool;
use crate::sinks::NotificationSink;
use crate::store::{DepositRecord, DerivedAddress, NewDeposit, Store};
use crate::units::from_base_units;

pub const SCANNER_LOCK: &str = "deposit:scanner:lock";
pub const CURSOR_KEY: &str = "deposit:scanner:last_block";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub from_block: u64,
    pub to_block: u64,
    pub events: usize,
    pub matched: usize,
    pub duplicates: usize,
    pub dust: usize,
    pub unassigned: usize,
    pub deposits: Vec<DepositRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerStats {
    pub last_scanned_block: Option<u64>,
    pub latest_block: u64,
    pub safe_block: u64,
    pub lag: u64,
    pub required_confirmations: u64,
}

pub struct DepositScanner {
    chain: Arc<dyn ChainGateway>,
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    pool: Arc<AddressPool>,
    notifier: Arc<dyn NotificationSink>,
    asset: TronAddress,
    decimals: u32,
    config: ScannerConfig,
}

impl DepositScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainGateway>,
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        pool: Arc<AddressPool>,
        notifier: Arc<dyn NotificationSink>,
        asset: TronAddress,
        decimals: u32,
        config: ScannerConfig,
    ) -> Self {
        Self { chain, store, kv, pool, notifier, asset, decimals, config }
    }

    async fn cursor(&self) -> CustodyResult<Option<u64>> {
        match self.kv.get(CURSOR_KEY).await? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| CustodyError::Storage(format!("{} holds {:?}: {}", CURSOR_KEY, raw, e))),
            None => Ok(None),
        }
    }

    /// One scheduled pass. `Ok(None)` if another pass holds the lock.
    pub async fn scan(&self) -> CustodyResult<Option<ScanReport>> {
        let Some(guard) = LockGuard::acquire(&self.kv, SCANNER_LOCK, self.config.lock_ttl).await? else {
            debug!("deposit scan already in progress, skipping");
            return Ok(None);
        };
        let result = self.scan_next().await;
        guard.release().await;
        result.map(Some)
    }

    async fn scan_next(&self) -> CustodyResult<ScanReport> {
        let latest = self.chain.latest_block_height().await?;
        let safe = latest.saturating_sub(self.config.required_confirmations);
        let from = match self.cursor().await? {
            Some(last) => last + 1,
            None => {
                let start = latest.saturating_sub(self.config.first_run_margin);
                info!(start, latest, "first deposit scan, starting near the tip");
                start
            }
        };
        let to = safe.min(from.saturating_add(self.config.batch_blocks.saturating_sub(1)));
        if from > to {
            debug!(from, safe, "no confirmed blocks to scan");
            return Ok(ScanReport { from_block: from, to_block: to, ..Default::default() });
        }

        let report = self.scan_range(from, to).await?;
        self.kv.set(CURSOR_KEY, &to.to_string(), None).await?;
        if report.events > 0 || !report.deposits.is_empty() {
            info!(
                from,
                to,
                latest,
                events = report.events,
                deposits = report.deposits.len(),
                "deposit scan completed"
            );
        }
        Ok(report)
    }

    /// Record deposits in `[from, to]` without touching the cursor.
    pub async fn scan_range(&self, from: u64, to: u64) -> CustodyResult<ScanReport> {
        let events: Vec<TransferEvent> = self
            .chain
            .transfer_events_in_range(&self.asset, from, to)
            .await?
            .into_iter()
            .filter(|e| e.token == self.asset)
            .collect();
        let mut report = ScanReport { from_block: from, to_block: to, events: events.len(), ..Default::default() };
        if events.is_empty() {
            return Ok(report);
        }

        let mut destinations: Vec<TronAddress> = events.iter().map(|e| e.to).collect();
        destinations.sort();
        destinations.dedup();
        let ours: HashMap<TronAddress, DerivedAddress> = self
            .store
            .find_addresses(&destinations)
            .await?
            .into_iter()
            .map(|row| (row.address, row))
            .collect();

        for event in &events {
            let Some(row) = ours.get(&event.to) else { continue };
            report.matched += 1;
            self.record(event, row, &mut report).await?;
        }
        Ok(report)
    }

    async fn record(&self, event: &TransferEvent, row: &DerivedAddress, report: &mut ScanReport) -> CustodyResult<()> {
        if self.store.deposit_exists(&event.tx_hash).await? {
            report.duplicates += 1;
            return Ok(());
        }
        let amount = from_base_units(event.raw_amount, self.decimals)?;
        if amount < self.config.min_deposit {
            debug!(tx_hash = %event.tx_hash, %amount, to = %event.to, "skipping dust deposit");
            report.dust += 1;
            return Ok(());
        }
        let Some(user) = row.owner else {
            warn!(tx_hash = %event.tx_hash, %amount, to = %event.to, "deposit to unassigned address, not credited");
            report.unassigned += 1;
            return Ok(());
        };

        let Some(deposit) = self
            .store
            .insert_deposit(NewDeposit {
                tx_hash: event.tx_hash.clone(),
                from_address: event.from,
                to_address: event.to,
                user_id: user,
                amount,
                block: event.block,
            })
            .await?
        else {
            report.duplicates += 1;
            return Ok(());
        };

        if let Err(e) = self.pool.mark_active(&event.to).await {
            warn!(address = %event.to, error = %e, "could not mark address active");
        }
        info!(
            user_id = %user,
            tx_hash = %deposit.tx_hash,
            %amount,
            from = %deposit.from_address,
            to = %deposit.to_address,
            block = deposit.block,
            "new deposit detected, pending sweep"
        );
        self.notifier.notify(
            user,
            "deposit_detected",
            json!({
                "deposit_id": deposit.id,
                "tx_hash": deposit.tx_hash,
                "amount": amount,
                "block": deposit.block,
            }),
        );
        report.deposits.push(deposit);
        Ok(())
    }

    /// Manual re-scan of one address over a block range.
    pub async fn scan_address(&self, address: &TronAddress, from: u64, to: u64) -> CustodyResult<ScanReport> {
        let Some(row) = self.store.find_address(address).await? else {
            return Err(CustodyError::NotFound(format!("address {}", address)));
        };
        let events = self.chain.transfer_events_in_range(&self.asset, from, to).await?;
        let mut report = ScanReport { from_block: from, to_block: to, ..Default::default() };
        for event in events.iter().filter(|e| e.token == self.asset && &e.to == address) {
            report.events += 1;
            report.matched += 1;
            self.record(event, &row, &mut report).await?;
        }
        info!(address = %address, from, to, deposits = report.deposits.len(), "manual address scan completed");
        Ok(report)
    }

    /// Next pass starts at `block + 1`.
    pub async fn reset_cursor(&self, block: u64) -> CustodyResult<()> {
        self.kv.set(CURSOR_KEY, &block.to_string(), None).await?;
        warn!(block, "deposit scan cursor reset");
        Ok(())
    }

    pub async fn stats(&self) -> CustodyResult<ScannerStats> {
        let latest = self.chain.latest_block_height().await?;
        let safe = latest.saturating_sub(self.config.required_confirmations);
        let last = self.cursor().await?;
        Ok(ScannerStats {
            last_scanned_block: last,
            latest_block: latest,
            safe_block: safe,
            lag: last.map_or(0, |l| safe.saturating_sub(l)),
            required_confirmations: self.config.required_confirmations,
        })
    }
}

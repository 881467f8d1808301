//! Address pool - derived deposit addresses, handed out one per user.
//!
//! Index 0 is the treasury and never enters the pool. Addresses are derived in
//! batches ahead of demand; assignment takes the oldest FREE one under the
//! `pool:assign` lock, deriving a fresh batch first if none is left.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::error::{CustodyError, CustodyResult};
use crate::keys::{KeyRing, TronAddress};
use crate::kv::{KvStore, LockGuard};
use crate::store::{AddressStatus, DerivedAddress, PoolStats, Store, UserId};

pub const ASSIGN_LOCK: &str = "pool:assign";
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);
const LOCK_RETRIES: u32 = 50;

pub struct AddressPool {
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    keys: Arc<KeyRing>,
    config: PoolConfig,
}

impl AddressPool {
    pub fn new(store: Arc<dyn Store>, kv: Arc<dyn KvStore>, keys: Arc<KeyRing>, config: PoolConfig) -> Self {
        Self { store, kv, keys, config }
    }

    pub fn master_address(&self) -> &TronAddress { self.keys.master_address() }

    async fn lock(&self, wait: bool) -> CustodyResult<Option<LockGuard>> {
        for _ in 0..LOCK_RETRIES {
            if let Some(guard) = LockGuard::acquire(&self.kv, ASSIGN_LOCK, self.config.assign_lock_ttl).await? {
                return Ok(Some(guard));
            }
            if !wait {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
        Ok(None)
    }

    /// Derive and persist `count` addresses after the highest existing index.
    pub async fn generate_batch(&self, count: u32) -> CustodyResult<Vec<DerivedAddress>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let start = self.store.max_index().await?.map_or(1, |max| max + 1).max(1);
        let keys = self.keys.clone();
        let derived = tokio::task::spawn_blocking(move || keys.derive_batch(start, count))
            .await
            .map_err(|e| CustodyError::Invariant(format!("derivation task: {}", e)))??;
        let rows: Vec<DerivedAddress> = derived.into_iter().map(|(i, a)| DerivedAddress::free(i, a)).collect();
        self.store.insert_addresses(&rows).await?;
        info!(start, count, "address batch generated");
        Ok(rows)
    }

    /// Fill the pool up to its initial size on first boot.
    pub async fn ensure_capacity(&self) -> CustodyResult<u32> {
        let Some(guard) = self.lock(true).await? else {
            return Err(CustodyError::Busy(ASSIGN_LOCK.into()));
        };
        let result = self.fill_locked().await;
        guard.release().await;
        result
    }

    async fn fill_locked(&self) -> CustodyResult<u32> {
        let stats = self.store.pool_stats().await?;
        let missing = (self.config.initial_size as u64).saturating_sub(stats.total) as u32;
        if missing > 0 {
            self.generate_batch(missing).await?;
            info!(missing, "pool filled to initial size");
        }
        Ok(missing)
    }

    /// The user's address, assigning the oldest FREE one on first call.
    pub async fn assign_address(&self, user: UserId) -> CustodyResult<DerivedAddress> {
        if let Some(existing) = self.store.address_by_owner(user).await? {
            return Ok(existing);
        }
        let Some(guard) = self.lock(true).await? else {
            return Err(CustodyError::Busy(ASSIGN_LOCK.into()));
        };
        let result = self.assign_locked(user).await;
        guard.release().await;
        result
    }

    async fn assign_locked(&self, user: UserId) -> CustodyResult<DerivedAddress> {
        if let Some(existing) = self.store.address_by_owner(user).await? {
            return Ok(existing);
        }
        if let Some(row) = self.store.claim_oldest_free(user).await? {
            info!(user_id = %user, address = %row.address, index = row.index, "address assigned");
            return Ok(row);
        }
        warn!(user_id = %user, "no free addresses, generating a batch");
        self.generate_batch(self.config.batch_size)
            .await
            .map_err(|e| CustodyError::CapacityExhausted(e.to_string()))?;
        let row = self
            .store
            .claim_oldest_free(user)
            .await?
            .ok_or_else(|| CustodyError::CapacityExhausted("fresh batch already claimed".into()))?;
        info!(user_id = %user, address = %row.address, index = row.index, "address assigned");
        Ok(row)
    }

    /// First deposit seen: ASSIGNED -> ACTIVE.
    pub async fn mark_active(&self, address: &TronAddress) -> CustodyResult<()> {
        let Some(mut row) = self.store.find_address(address).await? else {
            return Err(CustodyError::NotFound(format!("address {}", address)));
        };
        if row.status == AddressStatus::Assigned {
            row.status = AddressStatus::Active;
            row.first_deposit_at = Some(Utc::now());
            self.store.update_address(&row).await?;
            info!(address = %address, "address active");
        }
        Ok(())
    }

    /// Never reassigned; deposits to it are still detected.
    pub async fn retire(&self, address: &TronAddress) -> CustodyResult<()> {
        let Some(mut row) = self.store.find_address(address).await? else {
            return Err(CustodyError::NotFound(format!("address {}", address)));
        };
        if row.status != AddressStatus::Retired {
            row.status = AddressStatus::Retired;
            self.store.update_address(&row).await?;
            info!(address = %address, index = row.index, "address retired");
        }
        Ok(())
    }

    pub async fn stats(&self) -> CustodyResult<PoolStats> { self.store.pool_stats().await }

    /// Top the pool up when FREE addresses run low. Returns how many were added.
    pub async fn replenish(&self) -> CustodyResult<u32> {
        let stats = self.store.pool_stats().await?;
        if stats.free >= self.config.min_threshold as u64 {
            return Ok(0);
        }
        let Some(guard) = self.lock(false).await? else {
            return Ok(0);
        };
        let result = self.generate_batch(self.config.batch_size).await.map(|rows| rows.len() as u32);
        guard.release().await;
        if let Ok(added) = &result {
            info!(free = stats.free, added, "pool replenished");
        }
        result
    }
}

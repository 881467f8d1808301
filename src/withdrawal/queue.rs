//! Withdrawal queue in the shared KV.
//!
//! `withdrawal:queue` is a FIFO list of ids ready to process. Retries wait in
//! the `withdrawal:delayed` sorted set, scored by the unix millis they become
//! due, until [`WithdrawalQueue::promote_due`] moves them back.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::CustodyResult;
use crate::kv::KvStore;

pub const QUEUE_KEY: &str = "withdrawal:queue";
pub const DELAYED_KEY: &str = "withdrawal:delayed";

pub fn processing_key(id: u64) -> String { format!("withdrawal:processing:{}", id) }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub delayed: usize,
}

pub struct WithdrawalQueue {
    kv: Arc<dyn KvStore>,
}

impl WithdrawalQueue {
    pub fn new(kv: Arc<dyn KvStore>) -> Self { Self { kv } }

    pub async fn enqueue(&self, id: u64) -> CustodyResult<()> {
        self.kv.list_push(QUEUE_KEY, &id.to_string()).await?;
        info!(withdrawal_id = id, "withdrawal queued");
        Ok(())
    }

    /// Oldest ready id. Entries that are not ids are dropped.
    pub async fn dequeue(&self) -> CustodyResult<Option<u64>> {
        while let Some(raw) = self.kv.list_pop(QUEUE_KEY).await? {
            match raw.parse() {
                Ok(id) => return Ok(Some(id)),
                Err(_) => warn!(entry = raw, "dropping malformed queue entry"),
            }
        }
        Ok(None)
    }

    pub async fn schedule_retry(&self, id: u64, delay: Duration) -> CustodyResult<()> {
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.kv.zadd(DELAYED_KEY, &id.to_string(), due).await?;
        info!(withdrawal_id = id, delay_secs = delay.as_secs(), "withdrawal retry scheduled");
        Ok(())
    }

    /// Move every due retry to the ready queue. Returns how many moved.
    pub async fn promote_due(&self) -> CustodyResult<usize> {
        let now = Utc::now().timestamp_millis();
        let mut moved = 0;
        for member in self.kv.zrange_by_score(DELAYED_KEY, now).await? {
            // Whoever removes it from the set owns the move.
            if self.kv.zrem(DELAYED_KEY, &member).await? {
                self.kv.list_push(QUEUE_KEY, &member).await?;
                info!(withdrawal_id = %member, "delayed withdrawal promoted");
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Drop `id` from both structures.
    pub async fn remove(&self, id: u64) -> CustodyResult<bool> {
        let member = id.to_string();
        let from_list = self.kv.list_remove(QUEUE_KEY, &member).await?;
        let from_set = self.kv.zrem(DELAYED_KEY, &member).await?;
        Ok(from_list > 0 || from_set)
    }

    pub async fn contains(&self, id: u64) -> CustodyResult<bool> {
        let member = id.to_string();
        if self.kv.zscore(DELAYED_KEY, &member).await?.is_some() {
            return Ok(true);
        }
        Ok(self.kv.list_range(QUEUE_KEY).await?.contains(&member))
    }

    pub async fn stats(&self) -> CustodyResult<QueueStats> {
        Ok(QueueStats { queued: self.kv.list_len(QUEUE_KEY).await?, delayed: self.kv.zcard(DELAYED_KEY).await? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn queue() -> (WithdrawalQueue, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        (WithdrawalQueue::new(kv.clone()), kv)
    }

    #[tokio::test]
    async fn fifo_and_garbage_skipped() {
        let (q, kv) = queue();
        q.enqueue(7).await.unwrap();
        kv.list_push(QUEUE_KEY, "not-an-id").await.unwrap();
        q.enqueue(9).await.unwrap();
        assert_eq!(q.dequeue().await.unwrap(), Some(7));
        assert_eq!(q.dequeue().await.unwrap(), Some(9));
        assert_eq!(q.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn only_due_retries_are_promoted() {
        let (q, _) = queue();
        q.schedule_retry(1, Duration::ZERO).await.unwrap();
        q.schedule_retry(2, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(q.stats().await.unwrap(), QueueStats { queued: 0, delayed: 2 });

        assert_eq!(q.promote_due().await.unwrap(), 1);
        assert_eq!(q.stats().await.unwrap(), QueueStats { queued: 1, delayed: 1 });
        assert!(q.contains(2).await.unwrap());
        assert_eq!(q.dequeue().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn remove_clears_both() {
        let (q, _) = queue();
        q.enqueue(3).await.unwrap();
        q.schedule_retry(3, Duration::from_secs(60)).await.unwrap();
        assert!(q.remove(3).await.unwrap());
        assert!(!q.contains(3).await.unwrap());
        assert!(!q.remove(3).await.unwrap());
    }
}

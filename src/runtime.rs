//! Runtime - graceful shutdown, signal handling, and the emergency stop.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::error::CustodyResult;
use crate::kv::KvStore;
use crate::sinks::AuditSink;

pub const EMERGENCY_STOP_KEY: &str = "system:emergency_stop";
const EMERGENCY_STOP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Shutdown signal broadcaster
#[derive(Clone)]
pub struct Shutdown {
    sender: broadcast::Sender<()>,
    triggered: Arc<RwLock<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self { Self::new() }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender, triggered: Arc::new(RwLock::new(false)) }
    }

    /// Subscribe to shutdown signal
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown
    pub async fn trigger(&self) {
        let mut triggered = self.triggered.write().await;
        if !*triggered {
            *triggered = true;
            let _ = self.sender.send(());
        }
    }

    /// Check if shutdown was triggered
    pub async fn is_triggered(&self) -> bool {
        *self.triggered.read().await
    }
}

/// Install signal handlers and return shutdown handle
pub fn install_signal_handlers() -> Shutdown {
    let shutdown = Shutdown::new();
    let handle = shutdown.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        handle.trigger().await;
    });

    shutdown
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "signal handlers unavailable, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => error!(error = %e, "Ctrl+C handler failed"),
    }
}

/// Cluster-wide pause flag in the shared KV. Pollers skip their pass while set.
#[derive(Clone)]
pub struct EmergencyStop {
    kv: Arc<dyn KvStore>,
    audit: Arc<dyn AuditSink>,
}

impl EmergencyStop {
    pub fn new(kv: Arc<dyn KvStore>, audit: Arc<dyn AuditSink>) -> Self { Self { kv, audit } }

    pub async fn activate(&self, reason: &str) -> CustodyResult<()> {
        self.kv.set(EMERGENCY_STOP_KEY, reason, Some(EMERGENCY_STOP_TTL)).await?;
        error!(reason, "EMERGENCY STOP activated");
        self.audit.record("emergency_stop", json!({ "reason": reason }));
        Ok(())
    }

    pub async fn resume(&self) -> CustodyResult<()> {
        self.kv.delete(EMERGENCY_STOP_KEY).await?;
        warn!("emergency stop lifted");
        self.audit.record("emergency_resume", json!({}));
        Ok(())
    }

    /// Reports active when the KV cannot be read.
    pub async fn is_active(&self) -> bool {
        match self.kv.exists(EMERGENCY_STOP_KEY).await {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "emergency stop state unknown, treating as active");
                true
            }
        }
    }

    pub async fn reason(&self) -> Option<String> { self.kv.get(EMERGENCY_STOP_KEY).await.ok().flatten() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::sinks::CollectingSink;

    #[tokio::test]
    async fn shutdown_fires_once() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        shutdown.trigger().await;
        shutdown.trigger().await;
        assert!(shutdown.is_triggered().await);
        assert!(rx.recv().await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emergency_stop_roundtrip_is_audited() {
        let kv = Arc::new(MemoryKv::new());
        let audit = Arc::new(CollectingSink::new());
        let stop = EmergencyStop::new(kv.clone(), audit.clone());
        assert!(!stop.is_active().await);
        stop.activate("hot wallet drained").await.unwrap();
        assert!(stop.is_active().await);
        assert_eq!(stop.reason().await.as_deref(), Some("hot wallet drained"));
        stop.resume().await.unwrap();
        assert!(!stop.is_active().await);
        assert_eq!(audit.audit_events(), vec!["emergency_stop", "emergency_resume"]);
    }

    #[tokio::test]
    async fn unreachable_kv_counts_as_stopped() {
        let kv = Arc::new(MemoryKv::new());
        let stop = EmergencyStop::new(kv.clone(), Arc::new(CollectingSink::new()));
        kv.set_unavailable(true);
        assert!(stop.is_active().await);
    }
}

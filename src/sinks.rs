//! Outbound side channels: user notifications and the audit trail.
//!
//! Both are fire-and-forget. Delivery failures stay inside the sink.

use serde_json::Value;
use std::sync::Mutex;
use tracing::info;

use crate::store::UserId;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, user: UserId, event: &str, payload: Value);
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &str, details: Value);
}

/// Notifications as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, user: UserId, event: &str, payload: Value) {
        info!(target: "tron_custody::notify", user_id = %user, event, payload = %payload, "notification");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &str, details: Value) {
        info!(target: "tron_custody::audit", event, details = %details, "audit");
    }
}

/// Keeps everything it is given. Useful for tests and admin tooling.
#[derive(Debug, Default)]
pub struct CollectingSink {
    notifications: Mutex<Vec<(UserId, String, Value)>>,
    audits: Mutex<Vec<(String, Value)>>,
}

impl CollectingSink {
    pub fn new() -> Self { Self::default() }

    pub fn notifications(&self) -> Vec<(UserId, String, Value)> {
        self.notifications.lock().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn audits(&self) -> Vec<(String, Value)> { self.audits.lock().map(|a| a.clone()).unwrap_or_default() }

    pub fn audit_events(&self) -> Vec<String> { self.audits().into_iter().map(|(event, _)| event).collect() }

    pub fn notified(&self, user: UserId, event: &str) -> bool {
        self.notifications().iter().any(|(u, e, _)| *u == user && e == event)
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, user: UserId, event: &str, payload: Value) {
        if let Ok(mut n) = self.notifications.lock() {
            n.push((user, event.to_string(), payload));
        }
    }
}

impl AuditSink for CollectingSink {
    fn record(&self, event: &str, details: Value) {
        if let Ok(mut a) = self.audits.lock() {
            a.push((event.to_string(), details));
        }
    }
}

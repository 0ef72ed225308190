//! Audit trail for operator-triggered actions. Every entry goes to the
//! structured log; a bounded ring of recent entries backs the
//! dashboard's activity feed.

use crate::models::now_rfc3339;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{error, info, warn};

const RING_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub username: String,
    pub action: String,
    pub detail: String,
    pub level: String,
    pub created_at: String,
}

#[derive(Clone, Default)]
pub struct AuditLog {
    ring: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, username: &str, action: &str, detail: &str, level: Level) {
        match level {
            Level::Info => info!(user = username, action, detail, "audit"),
            Level::Warn => warn!(user = username, action, detail, "audit"),
            Level::Error => error!(user = username, action, detail, "audit"),
        }
        let mut ring = self.ring.lock();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(AuditEntry {
            username: username.to_string(),
            action: action.to_string(),
            detail: detail.to_string(),
            level: level.as_str().to_string(),
            created_at: now_rfc3339(),
        });
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.ring.lock().iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_and_newest_first() {
        let log = AuditLog::new();
        for i in 0..RING_CAPACITY + 10 {
            log.record("admin", "deploy", &format!("step {i}"), Level::Info);
        }
        let recent = log.recent(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].detail, format!("step {}", RING_CAPACITY + 9));
        assert_eq!(log.recent(usize::MAX).len(), RING_CAPACITY);
    }
}

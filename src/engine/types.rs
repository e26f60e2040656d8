// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Result types returned by engine and context operations.

use std::time::Duration;

use serde::Serialize;

/// Counts of what one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Tracked entities with nothing to write.
    pub skipped: usize,
    /// Statements pushed onto async queues instead of executed.
    pub queued: usize,
    /// RCACHE pipelines that failed after the SQL succeeded.
    pub invalidation_failures: usize,
}

impl FlushReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.queued
    }
}

/// Outcome of [`crate::Context::flush_with_check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushCheck {
    Done(FlushReport),
    DuplicateKey { index: String, message: String },
    ForeignKey { constraint: String, message: String },
}

impl FlushCheck {
    pub fn is_done(&self) -> bool {
        matches!(self, FlushCheck::Done(_))
    }
}

/// What one [`crate::Engine::consume`] run applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeReport {
    pub applied: usize,
    pub shelved: usize,
    /// Loop ended because another consumer took the lock over.
    pub lock_lost: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    pub queue: String,
    pub pending: u64,
    /// Shelved actions, one per `(payload, error)` pair.
    pub errors: u64,
}

/// A shelved async action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsyncError {
    pub payload: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Db,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub code: String,
    pub kind: PoolKind,
    #[serde(skip)]
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub pools: Vec<PoolHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.pools.iter().all(|p| p.error.is_none())
    }

    pub fn failing(&self) -> impl Iterator<Item = &PoolHealth> {
        self.pools.iter().filter(|p| p.error.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_report_flags_failures() {
        let mut report = HealthReport::default();
        assert!(report.is_healthy());
        report.pools.push(PoolHealth {
            code: "default".into(),
            kind: PoolKind::Db,
            latency: Some(Duration::from_millis(2)),
            error: None,
        });
        report.pools.push(PoolHealth {
            code: "cache".into(),
            kind: PoolKind::Redis,
            latency: None,
            error: Some("connection refused".into()),
        });
        assert!(!report.is_healthy());
        assert_eq!(report.failing().count(), 1);
    }

    #[test]
    fn test_flush_report_written() {
        let report = FlushReport {
            inserted: 2,
            updated: 1,
            skipped: 4,
            ..FlushReport::default()
        };
        assert_eq!(report.written(), 3);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "commit_engine=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters for the producer path and the committer. Shared by `Arc`.
#[derive(Debug, Default)]
pub struct CommitMetrics {
    pub rows_appended: AtomicU64,
    pub rows_skipped: AtomicU64,
    pub rows_truncated: AtomicU64,
    pub validation_rejects: AtomicU64,
    pub encoding_rejects: AtomicU64,
    pub already_sent_drops: AtomicU64,
    pub tasks_enqueued: AtomicU64,
    pub tasks_sent: AtomicU64,
    pub batches_sent: AtomicU64,
    pub batches_failed: AtomicU64,
    pub rows_sent: AtomicU64,
    pub rows_lost: AtomicU64,
    pub prepare_failures: AtomicU64,
    pub last_task_duration_ms: AtomicU64,
}

impl CommitMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            rows_appended: load(&self.rows_appended),
            rows_skipped: load(&self.rows_skipped),
            rows_truncated: load(&self.rows_truncated),
            validation_rejects: load(&self.validation_rejects),
            encoding_rejects: load(&self.encoding_rejects),
            already_sent_drops: load(&self.already_sent_drops),
            tasks_enqueued: load(&self.tasks_enqueued),
            tasks_sent: load(&self.tasks_sent),
            batches_sent: load(&self.batches_sent),
            batches_failed: load(&self.batches_failed),
            rows_sent: load(&self.rows_sent),
            rows_lost: load(&self.rows_lost),
            prepare_failures: load(&self.prepare_failures),
            last_task_duration_ms: load(&self.last_task_duration_ms),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub rows_appended: u64,
    pub rows_skipped: u64,
    pub rows_truncated: u64,
    pub validation_rejects: u64,
    pub encoding_rejects: u64,
    pub already_sent_drops: u64,
    pub tasks_enqueued: u64,
    pub tasks_sent: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub rows_sent: u64,
    pub rows_lost: u64,
    pub prepare_failures: u64,
    pub last_task_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let metrics = CommitMetrics::new();
        CommitMetrics::incr(&metrics.rows_appended);
        CommitMetrics::add(&metrics.rows_sent, 5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rows_appended, 1);
        assert_eq!(snapshot.rows_sent, 5);
        assert_eq!(snapshot.tasks_sent, 0);
        assert!(serde_json::to_string(&snapshot).unwrap().contains("\"rows_sent\":5"));
    }
}

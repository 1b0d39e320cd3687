//! Process-local counters for queries, commits and logins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use lumen_core::LumenError;
use serde::Serialize;

#[derive(Default)]
struct Counters {
    queries_total: AtomicU64,
    queries_failed: AtomicU64,
    cancelled: AtomicU64,
    timeouts: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
    commits_ok: AtomicU64,
    commits_failed: AtomicU64,
    logins_ok: AtomicU64,
    logins_failed: AtomicU64,
}

static COUNTERS: OnceLock<Counters> = OnceLock::new();

fn counters() -> &'static Counters {
    COUNTERS.get_or_init(Counters::default)
}

pub fn record_query(elapsed: Duration, success: bool) {
    let duration_ms = elapsed.as_millis() as u64;
    let c = counters();
    c.queries_total.fetch_add(1, Ordering::Relaxed);
    if !success {
        c.queries_failed.fetch_add(1, Ordering::Relaxed);
    }
    c.duration_total_ms.fetch_add(duration_ms, Ordering::Relaxed);
    c.duration_max_ms.fetch_max(duration_ms, Ordering::Relaxed);
}

pub fn record_cancel() {
    counters().cancelled.fetch_add(1, Ordering::Relaxed);
}

pub fn record_timeout() {
    counters().timeouts.fetch_add(1, Ordering::Relaxed);
}

/// Counts cancellations and timeouts hidden inside an error.
pub fn record_error(err: &LumenError) {
    match err {
        LumenError::Cancelled => record_cancel(),
        LumenError::Timeout { .. } => record_timeout(),
        _ => {}
    }
}

pub fn record_commit(success: bool) {
    let c = counters();
    if success {
        c.commits_ok.fetch_add(1, Ordering::Relaxed);
    } else {
        c.commits_failed.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_login(success: bool) {
    let c = counters();
    if success {
        c.logins_ok.fetch_add(1, Ordering::Relaxed);
    } else {
        c.logins_failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub queries_total: u64,
    pub queries_failed: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
    pub commits_ok: u64,
    pub commits_failed: u64,
    pub logins_ok: u64,
    pub logins_failed: u64,
}

pub fn snapshot() -> MetricsSnapshot {
    let c = counters();
    let total = c.queries_total.load(Ordering::Relaxed);
    let duration_total = c.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = c.duration_max_ms.load(Ordering::Relaxed);

    MetricsSnapshot {
        queries_total: total,
        queries_failed: c.queries_failed.load(Ordering::Relaxed),
        cancelled: c.cancelled.load(Ordering::Relaxed),
        timeouts: c.timeouts.load(Ordering::Relaxed),
        avg_ms: (total > 0).then(|| duration_total as f64 / total as f64),
        max_ms: (max_ms > 0).then_some(max_ms),
        commits_ok: c.commits_ok.load(Ordering::Relaxed),
        commits_failed: c.commits_failed.load(Ordering::Relaxed),
        logins_ok: c.logins_ok.load(Ordering::Relaxed),
        logins_failed: c.logins_failed.load(Ordering::Relaxed),
    }
}

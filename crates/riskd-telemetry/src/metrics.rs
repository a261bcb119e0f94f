//! Prometheus metrics for riskd.
//!
//! Covers:
//! - Risk breaches and pause state per account
//! - Persistence queue throughput, retries, failures and backlog
//! - Trade guard decisions
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which is a startup-time programming error. These
//! panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_gauge,
    CounterVec, GaugeVec, HistogramVec, IntGauge,
};

/// Breach transitions by kind.
pub static BREACHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "riskd_breaches_total",
        "Risk limit breach transitions",
        &["kind"]
    )
    .unwrap()
});

/// Trading paused (1) or not (0), per account.
pub static TRADING_PAUSED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "riskd_trading_paused",
        "Trading paused state per account (1=paused)",
        &["account"]
    )
    .unwrap()
});

/// Enqueue outcomes (queued/coalesced/stale/closed).
pub static PERSIST_ENQUEUED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "riskd_persist_enqueued_total",
        "Snapshot enqueue outcomes",
        &["outcome"]
    )
    .unwrap()
});

/// Records reaching a terminal state or being dropped, by outcome.
pub static PERSIST_RECORDS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "riskd_persist_records_total",
        "Persistence record outcomes (committed/failed/superseded/stale)",
        &["outcome"]
    )
    .unwrap()
});

/// Retry attempts after transient storage errors.
pub static PERSIST_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "riskd_persist_retries_total",
        "Snapshot commit retries after transient storage errors",
        &["account"]
    )
    .unwrap()
});

/// Records pending or in flight across all partitions.
pub static PERSIST_BACKLOG: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "riskd_persist_backlog",
        "Snapshot records pending or in flight"
    )
    .unwrap()
});

/// Store commit latency in milliseconds (successful commits only).
pub static PERSIST_COMMIT_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "riskd_persist_commit_latency_ms",
        "Snapshot commit latency in milliseconds",
        &["store"],
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    )
    .unwrap()
});

/// Audit append failures.
pub static AUDIT_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "riskd_audit_failures_total",
        "Audit stream append failures",
        &["account"]
    )
    .unwrap()
});

/// Trade guard decisions. `reason` is empty for permitted opens.
pub static GUARD_DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "riskd_guard_decisions_total",
        "Trade guard decisions",
        &["outcome", "reason"]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Record a breach transition.
    pub fn breach(kind: &str) {
        BREACHES_TOTAL.with_label_values(&[kind]).inc();
    }

    /// Set an account's paused gauge.
    pub fn trading_paused(account: &str, paused: bool) {
        TRADING_PAUSED
            .with_label_values(&[account])
            .set(if paused { 1.0 } else { 0.0 });
    }

    /// Record an enqueue outcome.
    pub fn persist_enqueued(outcome: &str) {
        PERSIST_ENQUEUED_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Record a committed snapshot.
    pub fn persist_committed(store: &str, latency_ms: f64) {
        PERSIST_RECORDS_TOTAL.with_label_values(&["committed"]).inc();
        PERSIST_COMMIT_LATENCY_MS
            .with_label_values(&[store])
            .observe(latency_ms);
    }

    /// Record a record that gave up.
    pub fn persist_failed() {
        PERSIST_RECORDS_TOTAL.with_label_values(&["failed"]).inc();
    }

    /// Record records dropped in favour of a newer snapshot.
    pub fn persist_superseded(count: u64) {
        PERSIST_RECORDS_TOTAL
            .with_label_values(&["superseded"])
            .inc_by(count as f64);
    }

    /// Record records rejected below the high-water mark.
    pub fn persist_stale(count: u64) {
        PERSIST_RECORDS_TOTAL
            .with_label_values(&["stale"])
            .inc_by(count as f64);
    }

    /// Record a commit retry.
    pub fn persist_retry(account: &str) {
        PERSIST_RETRIES_TOTAL.with_label_values(&[account]).inc();
    }

    /// Adjust the backlog gauge.
    pub fn persist_backlog_add(delta: i64) {
        PERSIST_BACKLOG.add(delta);
    }

    /// Record an audit append failure.
    pub fn audit_failed(account: &str) {
        AUDIT_FAILURES_TOTAL.with_label_values(&[account]).inc();
    }

    /// Record a permitted open.
    pub fn guard_permitted() {
        GUARD_DECISIONS_TOTAL
            .with_label_values(&["permitted", ""])
            .inc();
    }

    /// Record a blocked open.
    pub fn guard_blocked(reason: &str) {
        GUARD_DECISIONS_TOTAL
            .with_label_values(&["blocked", reason])
            .inc();
    }
}

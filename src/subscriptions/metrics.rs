//! Admin and metrics surface of the processing core.
//!
//! Plain atomic counters shared by reference, plus the runtime-tunable
//! barrier timeout. Timing figures are kept in nanoseconds and reported in a
//! configurable unit scale.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::config::{ProcessingConfig, UnitScale};

#[derive(Default)]
struct TimingStats {
    count: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl TimingStats {
    fn new() -> Self {
        TimingStats {
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }

    fn record(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn report(&self, divisor: f64) -> TimingReport {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ns.load(Ordering::Relaxed);
        let min = self.min_ns.load(Ordering::Relaxed);
        TimingReport {
            count,
            min: if count == 0 { 0.0 } else { min as f64 / divisor },
            max: self.max_ns.load(Ordering::Relaxed) as f64 / divisor,
            average: if count == 0 { 0.0 } else { total as f64 / count as f64 / divisor },
        }
    }
}

/// Timing figures for one phase, in the configured unit scale.
#[derive(Debug, Clone, Serialize)]
pub struct TimingReport {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub average: f64,
}

/// Point-in-time view of the whole surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub subscribe_requests: u64,
    pub unsubscribe_requests: u64,
    pub update_requests: u64,
    pub active_spus: u64,
    pub active_spus_max: u64,
    pub subscribers: u64,
    pub subscribers_max: u64,
    pub spu_processing_timeout_ms: u64,
    pub unit_scale: String,
    pub pre_barrier: TimingReport,
    pub post_barrier: TimingReport,
    pub filtering: TimingReport,
}

/// Counters, gauges and tunables of the processing core.
pub struct SpuManagerMetrics {
    subscribe_requests: AtomicU64,
    unsubscribe_requests: AtomicU64,
    update_requests: AtomicU64,
    active_spus: AtomicU64,
    active_spus_max: AtomicU64,
    subscribers: AtomicU64,
    subscribers_max: AtomicU64,
    spu_processing_timeout_ms: AtomicU64,
    unit_scale: AtomicU8,
    pre_barrier: TimingStats,
    post_barrier: TimingStats,
    filtering: TimingStats,
}

impl SpuManagerMetrics {
    pub fn new(config: &ProcessingConfig) -> Self {
        SpuManagerMetrics {
            subscribe_requests: AtomicU64::new(0),
            unsubscribe_requests: AtomicU64::new(0),
            update_requests: AtomicU64::new(0),
            active_spus: AtomicU64::new(0),
            active_spus_max: AtomicU64::new(0),
            subscribers: AtomicU64::new(0),
            subscribers_max: AtomicU64::new(0),
            spu_processing_timeout_ms: AtomicU64::new(config.spu_processing_timeout_ms),
            unit_scale: AtomicU8::new(scale_to_raw(config.unit_scale)),
            pre_barrier: TimingStats::new(),
            post_barrier: TimingStats::new(),
            filtering: TimingStats::new(),
        }
    }

    pub fn subscribe_request(&self) {
        self.subscribe_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unsubscribe_request(&self) {
        self.unsubscribe_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_request(&self) {
        self.update_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_spus(&self, n: u64) {
        self.active_spus.store(n, Ordering::Relaxed);
        self.active_spus_max.fetch_max(n, Ordering::Relaxed);
    }

    pub fn active_spus(&self) -> u64 {
        self.active_spus.load(Ordering::Relaxed)
    }

    pub fn set_subscribers(&self, n: u64) {
        self.subscribers.store(n, Ordering::Relaxed);
        self.subscribers_max.fetch_max(n, Ordering::Relaxed);
    }

    /// The per-unit barrier timeout. Read once per barrier, so a change takes
    /// effect on the next one.
    pub fn spu_processing_timeout_ms(&self) -> u64 {
        self.spu_processing_timeout_ms.load(Ordering::Relaxed)
    }

    /// Updates the timeout and nothing else.
    pub fn set_spu_processing_timeout_ms(&self, timeout_ms: u64) {
        self.spu_processing_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn unit_scale(&self) -> UnitScale {
        raw_to_scale(self.unit_scale.load(Ordering::Relaxed))
    }

    pub fn set_unit_scale(&self, scale: UnitScale) {
        self.unit_scale.store(scale_to_raw(scale), Ordering::Relaxed);
    }

    pub fn record_pre_barrier(&self, elapsed: Duration) {
        self.pre_barrier.record(elapsed);
    }

    pub fn record_post_barrier(&self, elapsed: Duration) {
        self.post_barrier.record(elapsed);
    }

    pub fn record_filtering(&self, elapsed: Duration) {
        self.filtering.record(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let scale = self.unit_scale();
        let divisor = match scale {
            UnitScale::Ms => 1_000_000.0,
            UnitScale::Us => 1_000.0,
            UnitScale::Ns => 1.0,
        };
        MetricsSnapshot {
            subscribe_requests: self.subscribe_requests.load(Ordering::Relaxed),
            unsubscribe_requests: self.unsubscribe_requests.load(Ordering::Relaxed),
            update_requests: self.update_requests.load(Ordering::Relaxed),
            active_spus: self.active_spus.load(Ordering::Relaxed),
            active_spus_max: self.active_spus_max.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            subscribers_max: self.subscribers_max.load(Ordering::Relaxed),
            spu_processing_timeout_ms: self.spu_processing_timeout_ms(),
            unit_scale: match scale {
                UnitScale::Ms => "ms".to_string(),
                UnitScale::Us => "us".to_string(),
                UnitScale::Ns => "ns".to_string(),
            },
            pre_barrier: self.pre_barrier.report(divisor),
            post_barrier: self.post_barrier.report(divisor),
            filtering: self.filtering.report(divisor),
        }
    }
}

fn scale_to_raw(scale: UnitScale) -> u8 {
    match scale {
        UnitScale::Ms => 0,
        UnitScale::Us => 1,
        UnitScale::Ns => 2,
    }
}

fn raw_to_scale(raw: u8) -> UnitScale {
    match raw {
        1 => UnitScale::Us,
        2 => UnitScale::Ns,
        _ => UnitScale::Ms,
    }
}

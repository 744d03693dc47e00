use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters of the memory manager.
#[derive(Debug, Default)]
pub struct Metrics {
    summarizations_total: AtomicU64,
    degraded_summarizations_total: AtomicU64,
    evictions_total: AtomicU64,
    persist_failures_total: AtomicU64,
    hits_total: AtomicU64,
    misses_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_summarizations(&self) {
        self.summarizations_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_degraded_summarizations(&self) {
        self.degraded_summarizations_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_evictions(&self) {
        self.evictions_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_persist_failures(&self) {
        self.persist_failures_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_hit(&self) {
        self.hits_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_miss(&self) {
        self.misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summarizations(&self) -> u64 {
        self.summarizations_total.load(Ordering::Relaxed)
    }
    pub fn degraded_summarizations(&self) -> u64 {
        self.degraded_summarizations_total.load(Ordering::Relaxed)
    }
    pub fn evictions(&self) -> u64 {
        self.evictions_total.load(Ordering::Relaxed)
    }
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures_total.load(Ordering::Relaxed)
    }
    pub fn hits(&self) -> u64 {
        self.hits_total.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses_total.load(Ordering::Relaxed)
    }
}

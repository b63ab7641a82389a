//! Operation counters, rendered through the stats virtual file.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    getattrs: AtomicU64,
    reads: AtomicU64,
    readdirs: AtomicU64,
    bytes_served: AtomicU64,
    opens: AtomicU64,
    reloads: AtomicU64,
    failed_checks: AtomicU64,
}

impl Stats {
    pub fn record_getattr(&self) {
        self.getattrs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_readdir(&self) {
        self.readdirs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reload(&self) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_check(&self) {
        self.failed_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn getattrs(&self) -> u64 {
        self.getattrs.load(Ordering::Relaxed)
    }

    pub fn readdirs(&self) -> u64 {
        self.readdirs.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Relaxed)
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub fn failed_checks(&self) -> u64 {
        self.failed_checks.load(Ordering::Relaxed)
    }
}

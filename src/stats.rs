//! Counter registry shared by every protocol engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A single named counter. Cloning shares the underlying value.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of named counters.
///
/// Engines register their counters once at construction and increment them
/// lock-free afterwards; the registry only locks for registration and export.
#[derive(Default)]
pub struct Stats {
    counters: Mutex<BTreeMap<String, Counter>>,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or look up) a counter by name.
    pub fn register(&self, name: &str) -> Counter {
        self.counters
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Export all counters in Prometheus text exposition format.
    pub fn export(&self) -> String {
        let counters = self.counters.lock();
        let mut out = String::new();
        for (name, c) in counters.iter() {
            out.push_str(&format!("ipstack_{} {{}} {}\n", name, c.get()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_export() {
        let stats = Stats::new();
        let a = stats.register("phys_recv_frame");
        let b = stats.register("phys_recv_frame");

        a.inc();
        b.inc();
        assert_eq!(a.get(), 2);

        let text = stats.export();
        assert!(text.contains("ipstack_phys_recv_frame {} 2"));
    }
}

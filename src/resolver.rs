//! Neighbor resolution cache shared by ARP and NDP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::addr::Addr;
use crate::stats::{Counter, Stats};

/// Entries older than this are never returned.
pub const ENTRY_EXPIRE: Duration = Duration::from_secs(300);
/// Entries older than this are still returned but trigger an asynchronous
/// re-solicitation.
pub const ENTRY_REFRESH: Duration = Duration::from_secs(60);
/// How long a resolver blocks waiting for a reply.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(500);

/// How a cache entry was learned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntrySource {
    /// Seen in transit or in a broadcast; may be stale gossip.
    Observed,
    /// Directed reply to our own solicitation.
    Resolved,
}

struct NeighborEntry {
    mac: Addr,
    last_seen: Instant,
    source: EntrySource,
}

/// One in-flight solicitation; additional resolvers for the same target are
/// coalesced onto it.
struct PendingQuery {
    since: Instant,
    result: Option<Addr>,
    waiters: usize,
}

/// Time-bounded map from network address to link address, fused with a
/// pending-query table.
///
/// One instance serves ARP (IPv4) and one serves NDP (IPv6); the protocol
/// engine supplies the solicitation mechanics, the cache supplies the
/// bookkeeping.
pub struct NeighborCache {
    entries: RwLock<HashMap<Addr, NeighborEntry>>,
    pending: Mutex<HashMap<Addr, PendingQuery>>,
    pending_cond: Condvar,
    stop: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,

    cache_req: Counter,
    cache_hit: Counter,
}

impl NeighborCache {
    /// `prefix` names the owning protocol in the counter registry
    /// ("arp" or "ndp").
    pub fn new(stats: &Stats, prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_cond: Condvar::new(),
            stop: AtomicBool::new(false),
            sweeper: Mutex::new(None),
            cache_req: stats.register(&format!("{prefix}_cache_req")),
            cache_hit: stats.register(&format!("{prefix}_cache_hit")),
        })
    }

    /// Resolve a network address to a link address, blocking up to
    /// [`RESOLVE_TIMEOUT`].
    ///
    /// `solicit` is invoked at most once per outstanding target: the first
    /// caller emits the request, concurrent callers wait on the same pending
    /// query. A stale-but-unexpired entry is returned immediately while a
    /// refresh solicitation goes out in the background.
    pub fn resolve(&self, target: &Addr, solicit: impl FnOnce()) -> Option<Addr> {
        self.cache_req.inc();

        if let Some((mac, age)) = self.lookup(target) {
            self.cache_hit.inc();
            if age > ENTRY_REFRESH {
                let mut pending = self.pending.lock();
                if !pending.contains_key(target) {
                    pending.insert(
                        *target,
                        PendingQuery {
                            since: Instant::now(),
                            result: None,
                            waiters: 0,
                        },
                    );
                    solicit();
                }
            }
            return Some(mac);
        }

        let deadline = Instant::now() + RESOLVE_TIMEOUT;
        let mut pending = self.pending.lock();
        match pending.get_mut(target) {
            Some(q) => q.waiters += 1,
            None => {
                pending.insert(
                    *target,
                    PendingQuery {
                        since: Instant::now(),
                        result: None,
                        waiters: 1,
                    },
                );
                solicit();
            }
        }

        loop {
            if let Some(mac) = pending.get(target).and_then(|q| q.result) {
                self.release_waiter(&mut pending, target);
                return Some(mac);
            }
            if self
                .pending_cond
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                let res = pending.get(target).and_then(|q| q.result);
                self.release_waiter(&mut pending, target);
                if res.is_none() {
                    debug!("resolver: no reply for {target}");
                }
                return res;
            }
        }
    }

    fn release_waiter(&self, pending: &mut HashMap<Addr, PendingQuery>, target: &Addr) {
        if let Some(q) = pending.get_mut(target) {
            q.waiters = q.waiters.saturating_sub(1);
            if q.waiters == 0 {
                pending.remove(target);
            }
        }
    }

    fn lookup(&self, target: &Addr) -> Option<(Addr, Duration)> {
        let entries = self.entries.read();
        let e = entries.get(target)?;
        let age = e.last_seen.elapsed();
        if age >= ENTRY_EXPIRE {
            return None;
        }
        Some((e.mac, age))
    }

    /// Record a passive observation (transit traffic, broadcast sender).
    /// Never downgrades a directed entry to observed.
    pub fn observe(&self, mac: &Addr, addr: &Addr) {
        let mut entries = self.entries.write();
        match entries.get_mut(addr) {
            Some(e) => {
                e.mac = *mac;
                e.last_seen = Instant::now();
            }
            None => {
                entries.insert(
                    *addr,
                    NeighborEntry {
                        mac: *mac,
                        last_seen: Instant::now(),
                        source: EntrySource::Observed,
                    },
                );
            }
        }
    }

    /// Record a directed reply and wake everyone blocked on this target.
    pub fn install(&self, mac: &Addr, addr: &Addr) {
        self.entries.write().insert(
            *addr,
            NeighborEntry {
                mac: *mac,
                last_seen: Instant::now(),
                source: EntrySource::Resolved,
            },
        );

        let mut pending = self.pending.lock();
        if let Some(q) = pending.get_mut(addr) {
            if q.waiters == 0 {
                pending.remove(addr);
            } else {
                q.result = Some(*mac);
            }
        }
        self.pending_cond.notify_all();
    }

    /// Entry provenance, for diagnostics and tests.
    pub fn source_of(&self, addr: &Addr) -> Option<EntrySource> {
        self.entries.read().get(addr).map(|e| e.source)
    }

    /// Start the background sweeper that evicts expired entries.
    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let th = std::thread::Builder::new()
            .name("ipstack-resolver".into())
            .spawn(move || me.sweep_loop())
            .expect("spawn resolver sweeper");
        *self.sweeper.lock() = Some(th);
    }

    fn sweep_loop(&self) {
        let mut last_sweep = Instant::now();
        while !self.stop.load(Ordering::Relaxed) {
            std::thread::sleep(STOP_POLL);
            if last_sweep.elapsed() < SWEEP_INTERVAL {
                continue;
            }
            last_sweep = Instant::now();

            self.entries
                .write()
                .retain(|_, e| e.last_seen.elapsed() < ENTRY_EXPIRE);

            // Refresh solicitations nobody waited for still need cleanup.
            self.pending
                .lock()
                .retain(|_, q| q.waiters > 0 || q.since.elapsed() < RESOLVE_TIMEOUT);
        }
    }

    /// Stop the sweeper and wait for it.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(th) = self.sweeper.lock().take() {
            let _ = th.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Arc<NeighborCache> {
        NeighborCache::new(&Stats::new(), "arp")
    }

    #[test]
    fn install_satisfies_resolve() {
        let c = cache();
        let ip: Addr = "10.0.0.1".parse().unwrap();
        let mac: Addr = "02:00:00:00:00:01".parse().unwrap();

        c.install(&mac, &ip);
        let got = c.resolve(&ip, || panic!("fresh entry must not solicit"));
        assert_eq!(got, Some(mac));
        assert_eq!(c.source_of(&ip), Some(EntrySource::Resolved));
    }

    #[test]
    fn miss_solicits_once_and_times_out() {
        let c = cache();
        let ip: Addr = "10.0.0.2".parse().unwrap();

        let mut solicited = 0;
        let got = c.resolve(&ip, || solicited += 1);
        assert_eq!(got, None);
        assert_eq!(solicited, 1);
    }

    #[test]
    fn concurrent_resolvers_coalesce() {
        let c = cache();
        let ip: Addr = "10.0.0.3".parse().unwrap();
        let mac: Addr = "02:00:00:00:00:03".parse().unwrap();

        let solicitations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let c = Arc::clone(&c);
            let s = Arc::clone(&solicitations);
            threads.push(std::thread::spawn(move || {
                c.resolve(&ip, || {
                    s.fetch_add(1, Ordering::SeqCst);
                })
            }));
        }

        std::thread::sleep(Duration::from_millis(100));
        c.install(&mac, &ip);

        for th in threads {
            assert_eq!(th.join().unwrap(), Some(mac));
        }
        assert_eq!(solicitations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observe_does_not_upgrade_to_resolved() {
        let c = cache();
        let ip: Addr = "10.0.0.4".parse().unwrap();
        let mac: Addr = "02:00:00:00:00:04".parse().unwrap();

        c.observe(&mac, &ip);
        assert_eq!(c.source_of(&ip), Some(EntrySource::Observed));

        c.install(&mac, &ip);
        assert_eq!(c.source_of(&ip), Some(EntrySource::Resolved));

        c.observe(&mac, &ip);
        assert_eq!(c.source_of(&ip), Some(EntrySource::Resolved));
    }
}

//! SCTP: cookie-based association setup, DATA/SACK exchange, heartbeat.
//!
//! No state is held between INIT and COOKIE-ECHO. The INIT-ACK carries a
//! signed state cookie encoding everything an association needs; only a
//! COOKIE-ECHO that verifies against the current cookie key materializes a
//! session.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::addr::Addr;
use crate::handler::PortHandler;
use crate::net::{Ingress, NetTx, IPPROTO_SCTP};
use crate::packet::Packet;
use crate::phys::STOP_POLL_INTERVAL;
use crate::queue::PktQueue;
use crate::session::{session_hash, Session, SessionTransport};
use crate::stats::{Counter, Stats};

const COMMON_HEADER_SIZE: usize = 12;

const CHUNK_DATA: u8 = 0;
const CHUNK_INIT: u8 = 1;
const CHUNK_INIT_ACK: u8 = 2;
const CHUNK_SACK: u8 = 3;
const CHUNK_HEARTBEAT: u8 = 4;
const CHUNK_HEARTBEAT_ACK: u8 = 5;
const CHUNK_ABORT: u8 = 6;
const CHUNK_SHUTDOWN: u8 = 7;
const CHUNK_SHUTDOWN_ACK: u8 = 8;
const CHUNK_COOKIE_ECHO: u8 = 10;
const CHUNK_COOKIE_ACK: u8 = 11;

const PARAM_STATE_COOKIE: u16 = 7;

/// DATA chunk flags: unfragmented (beginning + end).
const DATA_FLAGS_COMPLETE: u8 = 0x03;

const ADVERTISED_RWND: u32 = 65536;

/// Cookies older than this are rejected at COOKIE-ECHO time.
const COOKIE_LIFETIME: Duration = Duration::from_secs(60);
/// The in-memory cookie key is replaced at this cadence; cookies signed under
/// a retired key no longer verify.
const COOKIE_KEY_ROTATE: Duration = Duration::from_secs(3600);

const CLEAN_INTERVAL: Duration = Duration::from_secs(1);
const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

struct SctpAssoc {
    my_vtag: u32,
    their_vtag: u32,
    my_tsn: u32,
    their_tsn: u32,
}

struct SctpSession {
    base: Arc<Session>,
    handler: Arc<PortHandler>,
    assoc: ReentrantMutex<RefCell<SctpAssoc>>,
}

struct CookieKey {
    key: [u8; 32],
    since: Instant,
}

pub struct Sctp {
    self_ref: Weak<Sctp>,
    net: RwLock<Option<Weak<dyn NetTx>>>,
    sessions: RwLock<HashMap<u64, Arc<SctpSession>>>,
    listeners: RwLock<HashMap<u16, Arc<PortHandler>>>,
    cookie_key: Mutex<CookieKey>,
    queue: PktQueue<Packet>,
    stop: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,

    msgs: Counter,
    failed_msgs: Counter,
    new_sessions: Counter,
    sessions_rem: Counter,
}

impl Sctp {
    pub fn new(stats: &Stats) -> Arc<Self> {
        Arc::new_cyclic(|w| Self {
            self_ref: w.clone(),
            net: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            cookie_key: Mutex::new(CookieKey {
                key: rand::random(),
                since: Instant::now(),
            }),
            queue: PktQueue::new(256),
            stop: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            msgs: stats.register("sctp_msgs"),
            failed_msgs: stats.register("sctp_failed_msgs"),
            new_sessions: stats.register("sctp_new_sessions"),
            sessions_rem: stats.register("sctp_sessions_rem"),
        })
    }

    pub fn register_net(&self, net: &Arc<dyn NetTx>) {
        *self.net.write() = Some(Arc::downgrade(net));
    }

    fn net(&self) -> Option<Arc<dyn NetTx>> {
        self.net.read().as_ref().and_then(Weak::upgrade)
    }

    /// Register a listener on a local port. Its `init` callback runs here.
    pub fn add_handler(&self, port: u16, handler: PortHandler) {
        if let Some(init) = handler.init.as_ref() {
            init();
        }
        self.listeners.write().insert(port, Arc::new(handler));
    }

    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock();

        let me = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name("ipstack-sctp".into())
                .spawn(move || me.run())
                .expect("spawn sctp thread"),
        );

        let me = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name("ipstack-sctp-clean".into())
                .spawn(move || me.cleaner_loop())
                .expect("spawn sctp cleaner"),
        );
    }

    fn run(&self) {
        while !self.stop.load(Ordering::Relaxed) {
            self.rotate_cookie_key();
            let Some(pkt) = self.queue.pop(STOP_POLL_INTERVAL) else {
                continue;
            };
            self.handle(&pkt);
        }
    }

    fn rotate_cookie_key(&self) {
        let mut k = self.cookie_key.lock();
        if k.since.elapsed() >= COOKIE_KEY_ROTATE {
            debug!("sctp: rotating cookie key");
            k.key = rand::random();
            k.since = Instant::now();
        }
    }

    fn current_key(&self) -> [u8; 32] {
        self.cookie_key.lock().key
    }

    fn handle(&self, pkt: &Packet) {
        let p = pkt.data();
        if p.len() < COMMON_HEADER_SIZE + 4 {
            self.failed_msgs.inc();
            return;
        }

        let src_port = u16::from_be_bytes([p[0], p[1]]);
        let dst_port = u16::from_be_bytes([p[2], p[3]]);
        let vtag = u32::from_be_bytes(p[4..8].try_into().unwrap());

        let mut check = p.to_vec();
        check[8..12].fill(0);
        // The CRC is transmitted least significant byte first.
        let wire_crc = u32::from_le_bytes(p[8..12].try_into().unwrap());
        if crc32c(&check) != wire_crc {
            self.failed_msgs.inc();
            return;
        }
        self.msgs.inc();

        let hash = session_hash(pkt.src_addr(), src_port, dst_port);

        let mut offset = COMMON_HEADER_SIZE;
        while offset + 4 <= p.len() {
            let chunk_type = p[offset];
            let chunk_flags = p[offset + 1];
            let chunk_len = usize::from(u16::from_be_bytes([p[offset + 2], p[offset + 3]]));
            if chunk_len < 4 || offset + chunk_len > p.len() {
                self.failed_msgs.inc();
                return;
            }
            let value = &p[offset + 4..offset + chunk_len];

            match chunk_type {
                CHUNK_INIT => self.chunk_init(pkt, src_port, dst_port, value),
                CHUNK_COOKIE_ECHO => {
                    self.chunk_cookie_echo(pkt, src_port, dst_port, vtag, value, hash)
                }
                _ => {
                    // Every other chunk requires an association and a
                    // matching verification tag.
                    let session = self.sessions.read().get(&hash).cloned();
                    let Some(sess) = session else {
                        debug!("sctp: chunk {chunk_type} for unknown association");
                        self.send_abort(pkt, src_port, dst_port, vtag);
                        return;
                    };

                    let my_vtag = {
                        let guard = sess.assoc.lock();
                        let a = guard.borrow();
                        a.my_vtag
                    };
                    if vtag != my_vtag {
                        let their_vtag = {
                            let guard = sess.assoc.lock();
                            let a = guard.borrow();
                            a.their_vtag
                        };
                        warn!("sctp: verification tag mismatch, aborting association");
                        self.send_abort(pkt, src_port, dst_port, their_vtag);
                        self.destroy_session(hash);
                        return;
                    }

                    match chunk_type {
                        CHUNK_DATA => self.chunk_data(&sess, value),
                        CHUNK_HEARTBEAT => self.chunk_heartbeat(&sess, value),
                        CHUNK_ABORT => {
                            self.destroy_session(hash);
                            return;
                        }
                        CHUNK_SHUTDOWN => {
                            self.send_to_session(&sess, &chunk(CHUNK_SHUTDOWN_ACK, 0, &[]));
                            self.destroy_session(hash);
                            return;
                        }
                        CHUNK_SHUTDOWN_ACK | CHUNK_INIT_ACK | CHUNK_SACK | CHUNK_COOKIE_ACK
                        | CHUNK_HEARTBEAT_ACK => {}
                        t => {
                            debug!("sctp: ignoring chunk type {t} flags {chunk_flags}");
                        }
                    }
                }
            }

            // Chunks are padded to four bytes.
            offset += (chunk_len + 3) & !3;
        }
    }

    fn chunk_init(&self, pkt: &Packet, src_port: u16, dst_port: u16, value: &[u8]) {
        if value.len() < 16 {
            self.failed_msgs.inc();
            return;
        }
        let their_vtag = u32::from_be_bytes(value[0..4].try_into().unwrap());
        let their_tsn = u32::from_be_bytes(value[12..16].try_into().unwrap());

        if !self.listeners.read().contains_key(&dst_port) {
            debug!("sctp: init for closed port {dst_port}");
            self.send_packet(pkt.src_addr(), src_port, dst_port, their_vtag, &chunk(CHUNK_ABORT, 0, &[]));
            return;
        }

        let my_vtag: u32 = loop {
            let v = rand::random();
            if v != 0 {
                break v;
            }
        };
        let my_tsn: u32 = rand::random();

        let cookie = build_cookie(
            &self.current_key(),
            &CookieContents {
                their_addr: *pkt.src_addr(),
                their_port: src_port,
                local_port: dst_port,
                my_vtag,
                their_vtag,
                their_tsn,
                my_tsn,
                timestamp: unix_seconds(),
            },
        );

        // INIT-ACK: our tag and TSN plus the state cookie parameter. No
        // association state is kept on this side.
        let mut ack_value = Vec::with_capacity(16 + 4 + cookie.len());
        ack_value.extend_from_slice(&my_vtag.to_be_bytes());
        ack_value.extend_from_slice(&ADVERTISED_RWND.to_be_bytes());
        ack_value.extend_from_slice(&1u16.to_be_bytes()); // outbound streams
        ack_value.extend_from_slice(&1u16.to_be_bytes()); // inbound streams
        ack_value.extend_from_slice(&my_tsn.to_be_bytes());
        ack_value.extend_from_slice(&PARAM_STATE_COOKIE.to_be_bytes());
        ack_value.extend_from_slice(&((4 + cookie.len()) as u16).to_be_bytes());
        ack_value.extend_from_slice(&cookie);
        while ack_value.len() % 4 != 0 {
            ack_value.push(0);
        }

        self.send_packet(
            pkt.src_addr(),
            src_port,
            dst_port,
            their_vtag,
            &chunk(CHUNK_INIT_ACK, 0, &ack_value),
        );
    }

    fn chunk_cookie_echo(
        &self,
        pkt: &Packet,
        src_port: u16,
        dst_port: u16,
        vtag: u32,
        value: &[u8],
        hash: u64,
    ) {
        let Some(contents) = verify_cookie(&self.current_key(), value, unix_seconds()) else {
            debug!("sctp: cookie rejected");
            self.failed_msgs.inc();
            return;
        };

        // The cookie must describe this very packet.
        if contents.their_addr != *pkt.src_addr()
            || contents.their_port != src_port
            || contents.local_port != dst_port
            || contents.my_vtag != vtag
        {
            debug!("sctp: cookie does not match packet");
            self.failed_msgs.inc();
            return;
        }

        if let Some(existing) = self.sessions.read().get(&hash).cloned() {
            // Retransmitted COOKIE-ECHO: repeat the COOKIE-ACK.
            self.send_to_session(&existing, &chunk(CHUNK_COOKIE_ACK, 0, &[]));
            return;
        }

        let Some(handler) = self.listeners.read().get(&dst_port).cloned() else {
            self.send_abort(pkt, src_port, dst_port, contents.their_vtag);
            return;
        };

        let Some(me) = self.self_ref.upgrade() else { return };
        let me: Arc<dyn SessionTransport> = me;
        let base = Session::new(
            Arc::downgrade(&me),
            *pkt.dst_addr(),
            dst_port,
            *pkt.src_addr(),
            src_port,
        );

        let sess = Arc::new(SctpSession {
            base,
            handler: Arc::clone(&handler),
            assoc: ReentrantMutex::new(RefCell::new(SctpAssoc {
                my_vtag: contents.my_vtag,
                their_vtag: contents.their_vtag,
                my_tsn: contents.my_tsn,
                their_tsn: contents.their_tsn,
            })),
        });

        self.sessions.write().insert(hash, Arc::clone(&sess));
        self.new_sessions.inc();
        debug!(
            "sctp: association up {}:{} -> :{}",
            pkt.src_addr(),
            src_port,
            dst_port
        );

        let guard = sess.assoc.lock();
        self.send_to_session(&sess, &chunk(CHUNK_COOKIE_ACK, 0, &[]));
        if !(sess.handler.new_session)(&sess.base) {
            drop(guard);
            self.send_to_session(&sess, &chunk(CHUNK_ABORT, 0, &[]));
            self.destroy_session(hash);
        }
    }

    fn chunk_data(&self, sess: &Arc<SctpSession>, value: &[u8]) {
        if value.len() <= 12 {
            self.failed_msgs.inc();
            return;
        }
        let tsn = u32::from_be_bytes(value[0..4].try_into().unwrap());
        let user_data = &value[12..];

        let guard = sess.assoc.lock();
        sess.base.touch();
        {
            let mut a = guard.borrow_mut();
            a.their_tsn = tsn;
        }

        let ok = (sess.handler.new_data)(&sess.base, user_data);

        let mut sack = Vec::with_capacity(12);
        sack.extend_from_slice(&tsn.to_be_bytes());
        sack.extend_from_slice(&ADVERTISED_RWND.to_be_bytes());
        sack.extend_from_slice(&0u16.to_be_bytes()); // gap ack blocks
        sack.extend_from_slice(&0u16.to_be_bytes()); // duplicate tsns
        self.send_to_session(sess, &chunk(CHUNK_SACK, 0, &sack));
        drop(guard);

        if !ok {
            self.send_to_session(sess, &chunk(CHUNK_ABORT, 0, &[]));
            self.destroy_session(sess.base.id());
        }
    }

    fn chunk_heartbeat(&self, sess: &Arc<SctpSession>, value: &[u8]) {
        sess.base.touch();
        // The heartbeat-info parameter is echoed verbatim.
        self.send_to_session(sess, &chunk(CHUNK_HEARTBEAT_ACK, 0, value));
    }

    /// Remove an association (exactly once) and run the teardown callbacks.
    fn destroy_session(&self, hash: u64) {
        let Some(sess) = self.sessions.write().remove(&hash) else {
            return;
        };
        self.sessions_rem.inc();

        let guard = sess.assoc.lock();
        if let Some(cb) = sess.handler.session_closed_1.as_ref() {
            cb(&sess.base);
        }
        if let Some(cb) = sess.handler.session_closed_2.as_ref() {
            cb(&sess.base);
        }
        sess.base.take_private_data();
        drop(guard);
    }

    fn cleaner_loop(&self) {
        let mut last_clean = Instant::now();
        while !self.stop.load(Ordering::Relaxed) {
            std::thread::sleep(STOP_POLL_INTERVAL);
            if last_clean.elapsed() < CLEAN_INTERVAL {
                continue;
            }
            last_clean = Instant::now();

            let stale: Vec<(u64, Arc<SctpSession>)> = self
                .sessions
                .read()
                .iter()
                .filter(|(_, s)| s.base.idle_for() > SESSION_TIMEOUT)
                .map(|(h, s)| (*h, Arc::clone(s)))
                .collect();

            for (hash, sess) in stale {
                debug!("sctp: association idle, aborting");
                self.send_to_session(&sess, &chunk(CHUNK_ABORT, 0, &[]));
                self.destroy_session(hash);
            }
        }
    }

    /// Serialize and emit one packet on an existing association.
    fn send_to_session(&self, sess: &SctpSession, chunks: &[u8]) -> bool {
        let their_vtag = {
            let guard = sess.assoc.lock();
            let a = guard.borrow();
            a.their_vtag
        };
        self.send_packet(
            sess.base.their_addr(),
            sess.base.their_port(),
            sess.base.my_port(),
            their_vtag,
            chunks,
        )
    }

    fn send_abort(&self, pkt: &Packet, src_port: u16, dst_port: u16, vtag: u32) {
        self.send_packet(
            pkt.src_addr(),
            src_port,
            dst_port,
            vtag,
            &chunk(CHUNK_ABORT, 0, &[]),
        );
    }

    fn send_packet(
        &self,
        dst: &Addr,
        dst_port: u16,
        src_port: u16,
        vtag: u32,
        chunks: &[u8],
    ) -> bool {
        let Some(net) = self.net() else { return false };

        let mut out = Vec::with_capacity(COMMON_HEADER_SIZE + chunks.len());
        out.extend_from_slice(&src_port.to_be_bytes());
        out.extend_from_slice(&dst_port.to_be_bytes());
        out.extend_from_slice(&vtag.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]); // checksum, filled below
        out.extend_from_slice(chunks);

        let crc = crc32c(&out);
        out[8..12].copy_from_slice(&crc.to_le_bytes());

        net.transmit(None, dst, None, IPPROTO_SCTP, &out, None)
    }

    /// Stop all tasks, then tear down every live association and listener.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        for th in self.threads.lock().drain(..) {
            let _ = th.join();
        }

        let hashes: Vec<u64> = self.sessions.read().keys().copied().collect();
        for hash in hashes {
            self.destroy_session(hash);
        }

        for (_, handler) in self.listeners.write().drain() {
            if let Some(deinit) = handler.deinit.as_ref() {
                deinit();
            }
        }
    }
}

impl SessionTransport for Sctp {
    fn send_data(&self, session: &Arc<Session>, data: &[u8]) -> bool {
        let Some(sess) = self.sessions.read().get(&session.id()).cloned() else {
            return false;
        };

        let guard = sess.assoc.lock();
        let tsn = {
            let mut a = guard.borrow_mut();
            let tsn = a.my_tsn;
            a.my_tsn = a.my_tsn.wrapping_add(1);
            tsn
        };

        let mut value = Vec::with_capacity(12 + data.len());
        value.extend_from_slice(&tsn.to_be_bytes());
        value.extend_from_slice(&0u16.to_be_bytes()); // stream id
        value.extend_from_slice(&0u16.to_be_bytes()); // stream sequence
        value.extend_from_slice(&0u32.to_be_bytes()); // payload protocol id
        value.extend_from_slice(data);

        sess.base.touch();
        self.send_to_session(&sess, &chunk(CHUNK_DATA, DATA_FLAGS_COMPLETE, &value))
    }

    fn end_session(&self, session: &Arc<Session>) {
        let Some(sess) = self.sessions.read().get(&session.id()).cloned() else {
            return;
        };

        let their_tsn = {
            let guard = sess.assoc.lock();
            let a = guard.borrow();
            a.their_tsn
        };
        self.send_to_session(&sess, &chunk(CHUNK_SHUTDOWN, 0, &their_tsn.to_be_bytes()));
        self.destroy_session(session.id());
    }
}

impl Ingress for Sctp {
    fn queue_packet(&self, pkt: Packet) {
        self.queue.push(pkt);
    }
}

/// Serialize one chunk, padded to four bytes.
fn chunk(chunk_type: u8, flags: u8, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + value.len() + 3);
    out.push(chunk_type);
    out.push(flags);
    out.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    out.extend_from_slice(value);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

struct CookieContents {
    their_addr: Addr,
    their_port: u16,
    local_port: u16,
    my_vtag: u32,
    their_vtag: u32,
    their_tsn: u32,
    my_tsn: u32,
    timestamp: u64,
}

const COOKIE_MAC_SIZE: usize = 32;

/// Serialize the association parameters and append a MAC over them computed
/// with the current cookie key.
fn build_cookie(key: &[u8; 32], c: &CookieContents) -> Vec<u8> {
    let mut fields = Vec::with_capacity(45);
    fields.push(c.their_addr.len() as u8);
    fields.extend_from_slice(c.their_addr.bytes());
    fields.extend_from_slice(&c.their_port.to_be_bytes());
    fields.extend_from_slice(&c.local_port.to_be_bytes());
    fields.extend_from_slice(&c.my_vtag.to_be_bytes());
    fields.extend_from_slice(&c.their_vtag.to_be_bytes());
    fields.extend_from_slice(&c.their_tsn.to_be_bytes());
    fields.extend_from_slice(&c.my_tsn.to_be_bytes());
    fields.extend_from_slice(&c.timestamp.to_be_bytes());

    let mac = cookie_mac(key, &fields);
    fields.extend_from_slice(&mac);
    fields
}

/// Check the MAC and lifetime of a received cookie; return its contents when
/// it verifies.
fn verify_cookie(key: &[u8; 32], cookie: &[u8], now: u64) -> Option<CookieContents> {
    if cookie.len() < 1 + COOKIE_MAC_SIZE {
        return None;
    }
    let addr_len = usize::from(cookie[0]);
    let fields_len = 1 + addr_len + 2 + 2 + 4 + 4 + 4 + 4 + 8;
    if cookie.len() != fields_len + COOKIE_MAC_SIZE {
        return None;
    }

    let (fields, mac) = cookie.split_at(fields_len);
    if cookie_mac(key, fields) != mac {
        return None;
    }

    let their_addr = match addr_len {
        4 => Addr::Ipv4(fields[1..5].try_into().unwrap()),
        16 => Addr::Ipv6(fields[1..17].try_into().unwrap()),
        _ => return None,
    };

    let f = &fields[1 + addr_len..];
    let timestamp = u64::from_be_bytes(f[20..28].try_into().unwrap());
    if now < timestamp || now - timestamp > COOKIE_LIFETIME.as_secs() {
        return None;
    }

    Some(CookieContents {
        their_addr,
        their_port: u16::from_be_bytes(f[0..2].try_into().unwrap()),
        local_port: u16::from_be_bytes(f[2..4].try_into().unwrap()),
        my_vtag: u32::from_be_bytes(f[4..8].try_into().unwrap()),
        their_vtag: u32::from_be_bytes(f[8..12].try_into().unwrap()),
        their_tsn: u32::from_be_bytes(f[12..16].try_into().unwrap()),
        my_tsn: u32::from_be_bytes(f[16..20].try_into().unwrap()),
        timestamp,
    })
}

fn cookie_mac(key: &[u8; 32], fields: &[u8]) -> [u8; COOKIE_MAC_SIZE] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(fields);
    let mut mac = [0u8; COOKIE_MAC_SIZE];
    mac.copy_from_slice(&hasher.finalize());
    mac
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// CRC32c (Castagnoli), the SCTP packet checksum.
pub(crate) fn crc32c(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0x82f6_3b78 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents() -> CookieContents {
        CookieContents {
            their_addr: "192.168.3.1".parse().unwrap(),
            their_port: 5000,
            local_port: 80,
            my_vtag: 0xdead_beef,
            their_vtag: 0x0000_000a,
            their_tsn: 100,
            my_tsn: 5555,
            timestamp: 1_000_000,
        }
    }

    #[test]
    fn cookie_roundtrip() {
        let key = [7u8; 32];
        let cookie = build_cookie(&key, &contents());

        let got = verify_cookie(&key, &cookie, 1_000_010).expect("cookie must verify");
        assert_eq!(got.their_addr, contents().their_addr);
        assert_eq!(got.their_port, 5000);
        assert_eq!(got.local_port, 80);
        assert_eq!(got.my_vtag, 0xdead_beef);
        assert_eq!(got.their_vtag, 0x0000_000a);
        assert_eq!(got.their_tsn, 100);
        assert_eq!(got.my_tsn, 5555);
    }

    #[test]
    fn cookie_expires() {
        let key = [7u8; 32];
        let cookie = build_cookie(&key, &contents());

        assert!(verify_cookie(&key, &cookie, 1_000_000 + 59).is_some());
        assert!(verify_cookie(&key, &cookie, 1_000_000 + 61).is_none());
    }

    #[test]
    fn cookie_rejected_under_rotated_key() {
        let old_key = [7u8; 32];
        let new_key = [8u8; 32];
        let cookie = build_cookie(&old_key, &contents());

        assert!(verify_cookie(&new_key, &cookie, 1_000_010).is_none());
    }

    #[test]
    fn cookie_tamper_detected() {
        let key = [7u8; 32];
        let mut cookie = build_cookie(&key, &contents());
        cookie[6] ^= 1; // flip a bit in their_port
        assert!(verify_cookie(&key, &cookie, 1_000_010).is_none());
    }

    #[test]
    fn crc32c_known_vectors() {
        // RFC 3720 B.4 test patterns.
        assert_eq!(crc32c(&[0u8; 32]), 0x8a91_36aa);
        assert_eq!(crc32c(&[0xffu8; 32]), 0x62a8_ab43);
        let ascending: Vec<u8> = (0..32).collect();
        assert_eq!(crc32c(&ascending), 0x46dd_794e);
    }

    #[test]
    fn chunk_padding() {
        let c = chunk(CHUNK_DATA, 0x03, &[1, 2, 3, 4, 5]);
        assert_eq!(c.len(), 12);
        assert_eq!(u16::from_be_bytes([c[2], c[3]]), 9); // length excludes padding
    }
}

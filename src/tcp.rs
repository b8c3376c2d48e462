//! TCP: state machine, session management, retransmission.
//!
//! Inbound segments are pinned to one of four worker tasks by session hash,
//! so packets of a single flow are handled in arrival order. All mutable
//! per-flow state lives behind a per-session reentrant lock; handler
//! callbacks run beneath it and may call straight back into `send_data`.
//! The session map lock is only ever held statement-scoped and never across
//! a callback.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::addr::Addr;
use crate::error::ProtocolError;
use crate::handler::PortHandler;
use crate::net::{l4_checksum, Ingress, NetTx, IPPROTO_TCP};
use crate::packet::Packet;
use crate::phys::STOP_POLL_INTERVAL;
use crate::queue::PktQueue;
use crate::session::{session_hash, Session, SessionTransport};
use crate::stats::{Counter, Stats};

const HEADER_SIZE: usize = 20;
const WORKERS: usize = 4;

/// Retransmit a segment that has been unacknowledged for this long.
const RETRANS_TIMEOUT: Duration = Duration::from_millis(200);
/// Retransmitter wake-up interval.
const RETRANS_TICK: Duration = Duration::from_millis(200);
/// Session-cleaner scan interval.
const CLEAN_INTERVAL: Duration = Duration::from_secs(1);
/// Sessions idle longer than this are reset and evicted.
const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_PSH: u8 = 0x08;
const FLAG_ACK: u8 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TcpState {
    Listen,
    SynRecv,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
}

struct UnackedSegment {
    seq: u32,
    data: Vec<u8>,
    last_sent: Instant,
    internal_id: u64,
}

struct TcpConn {
    state: TcpState,
    snd_nxt: u32,
    rcv_nxt: u32,
    unacked: Vec<UnackedSegment>,
    next_internal_id: u64,
    fin_after_drain: bool,
    fin_sent: bool,
    pending_close: bool,
    closed_notified: bool,
    last_pkt: Instant,
}

struct TcpSession {
    base: Arc<Session>,
    handler: Arc<PortHandler>,
    // Reentrant so a handler running beneath the lock can call send_data.
    conn: ReentrantMutex<RefCell<TcpConn>>,
}

pub struct Tcp {
    self_ref: Weak<Tcp>,
    net: RwLock<Option<Weak<dyn NetTx>>>,
    sessions: RwLock<HashMap<u64, Arc<TcpSession>>>,
    listeners: RwLock<HashMap<u16, Arc<PortHandler>>>,
    window: u16,
    workers: Vec<Arc<PktQueue<Packet>>>,
    stop: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,

    packets: Counter,
    errors: Counter,
    syn: Counter,
    succ_estab: Counter,
    new_sessions: Counter,
    sessions_rem: Counter,
    sessions_to: Counter,
    rst: Counter,
}

impl Tcp {
    pub fn new(stats: &Stats, window: u16) -> Arc<Self> {
        Arc::new_cyclic(|w| Self {
            self_ref: w.clone(),
            net: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            window,
            workers: (0..WORKERS).map(|_| Arc::new(PktQueue::new(256))).collect(),
            stop: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            packets: stats.register("tcp_packets"),
            errors: stats.register("tcp_errors"),
            syn: stats.register("tcp_syn"),
            succ_estab: stats.register("tcp_succ_estab"),
            new_sessions: stats.register("tcp_new_sessions"),
            sessions_rem: stats.register("tcp_sessions_rem"),
            sessions_to: stats.register("tcp_sessions_to"),
            rst: stats.register("tcp_rst"),
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
        for (i, q) in self.workers.iter().enumerate() {
            let me = Arc::clone(self);
            let q = Arc::clone(q);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("ipstack-tcp-{i}"))
                    .spawn(move || me.worker_loop(&q))
                    .expect("spawn tcp worker"),
            );
        }

        let me = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name("ipstack-tcp-retrans".into())
                .spawn(move || me.retransmit_loop())
                .expect("spawn tcp retransmitter"),
        );

        let me = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name("ipstack-tcp-clean".into())
                .spawn(move || me.cleaner_loop())
                .expect("spawn tcp cleaner"),
        );
    }

    fn worker_loop(&self, queue: &PktQueue<Packet>) {
        while !self.stop.load(Ordering::Relaxed) {
            let Some(pkt) = queue.pop(STOP_POLL_INTERVAL) else {
                continue;
            };
            self.handle_segment(&pkt);
        }
    }

    fn handle_segment(&self, pkt: &Packet) {
        let seg = match Segment::parse(pkt.data()) {
            Ok(seg) => seg,
            Err(e) => {
                debug!("tcp: dropping segment: {e}");
                self.errors.inc();
                return;
            }
        };
        self.packets.inc();

        let hash = session_hash(pkt.src_addr(), seg.src_port, seg.dst_port);
        let existing = self.sessions.read().get(&hash).cloned();
        match existing {
            None => self.admit(pkt, &seg, hash),
            Some(ts) => self.process(&ts, &seg, hash),
        }
    }

    /// A segment for a tuple with no session: admit a SYN on a listening
    /// port, reset everything else.
    fn admit(&self, pkt: &Packet, seg: &Segment, hash: u64) {
        if seg.flags & FLAG_RST != 0 {
            return;
        }

        if seg.flags & FLAG_SYN == 0 || seg.flags & FLAG_ACK != 0 {
            if !self.listeners.read().contains_key(&seg.dst_port) {
                self.rst.inc();
                self.send_rst(pkt, seg);
            } else {
                self.errors.inc();
            }
            return;
        }

        self.syn.inc();
        let Some(handler) = self.listeners.read().get(&seg.dst_port).cloned() else {
            debug!("tcp: syn for closed port {}", seg.dst_port);
            self.rst.inc();
            self.send_rst(pkt, seg);
            return;
        };

        let Some(me) = self.self_ref.upgrade() else { return };
        let me: Arc<dyn SessionTransport> = me;
        let base = Session::new(
            Arc::downgrade(&me),
            *pkt.dst_addr(),
            seg.dst_port,
            *pkt.src_addr(),
            seg.src_port,
        );

        let isn: u32 = rand::random();
        let ts = Arc::new(TcpSession {
            base,
            handler: Arc::clone(&handler),
            conn: ReentrantMutex::new(RefCell::new(TcpConn {
                state: TcpState::Listen,
                snd_nxt: isn,
                rcv_nxt: seg.seq.wrapping_add(1),
                unacked: Vec::new(),
                next_internal_id: 0,
                fin_after_drain: false,
                fin_sent: false,
                pending_close: false,
                closed_notified: false,
                last_pkt: Instant::now(),
            })),
        });

        self.sessions.write().insert(hash, Arc::clone(&ts));
        self.new_sessions.inc();
        debug!("tcp: new session {}:{} -> :{}", pkt.src_addr(), seg.src_port, seg.dst_port);

        let guard = ts.conn.lock();
        {
            let mut c = guard.borrow_mut();
            let (seq, ack) = (c.snd_nxt, c.rcv_nxt);
            self.send_to_peer(&ts, seq, ack, FLAG_SYN | FLAG_ACK, &[], true);
            c.snd_nxt = c.snd_nxt.wrapping_add(1);
            c.state = TcpState::SynRecv;
        }
        if !(ts.handler.new_session)(&ts.base) {
            guard.borrow_mut().pending_close = true;
        }
    }

    fn process(&self, ts: &Arc<TcpSession>, seg: &Segment, hash: u64) {
        let guard = ts.conn.lock();
        ts.base.touch();

        if seg.flags & FLAG_RST != 0 {
            drop(guard);
            debug!("tcp: rst from peer, purging session {hash:#018x}");
            self.destroy_session(hash);
            return;
        }

        let mut deliver: Option<Vec<u8>> = None;
        let mut destroy = false;
        let mut notify_close = false;

        {
            let mut c = guard.borrow_mut();
            c.last_pkt = Instant::now();

            // Retransmitted SYN: the SYN-ACK got lost, repeat it.
            if seg.flags & FLAG_SYN != 0 && c.state == TcpState::SynRecv {
                let (seq, ack) = (c.snd_nxt.wrapping_sub(1), c.rcv_nxt);
                self.send_to_peer(ts, seq, ack, FLAG_SYN | FLAG_ACK, &[], true);
                return;
            }

            if seg.flags & FLAG_ACK != 0 {
                match c.state {
                    TcpState::SynRecv if seg.ack == c.snd_nxt => {
                        c.state = TcpState::Established;
                        self.succ_estab.inc();
                    }
                    TcpState::FinWait1 if c.fin_sent && seg.ack == c.snd_nxt => {
                        c.state = TcpState::FinWait2;
                    }
                    TcpState::CloseWait if c.fin_sent && seg.ack == c.snd_nxt => {
                        // Our FIN is acknowledged, the flow is fully closed.
                        destroy = true;
                    }
                    _ => {}
                }

                let ack = seg.ack;
                c.unacked
                    .retain(|s| seq_gt(s.seq.wrapping_add(s.data.len() as u32), ack));

                if c.fin_after_drain && c.unacked.is_empty() && !c.fin_sent {
                    let (seq, ackn) = (c.snd_nxt, c.rcv_nxt);
                    self.send_to_peer(ts, seq, ackn, FLAG_FIN | FLAG_ACK, &[], false);
                    c.snd_nxt = c.snd_nxt.wrapping_add(1);
                    c.fin_sent = true;
                    c.fin_after_drain = false;
                    c.state = TcpState::FinWait1;
                }
            }

            if !seg.payload.is_empty() {
                if seg.seq == c.rcv_nxt {
                    // Only in-order bytes advance the window.
                    c.rcv_nxt = c.rcv_nxt.wrapping_add(seg.payload.len() as u32);
                    deliver = Some(seg.payload.to_vec());
                } else {
                    // Duplicate or future segment: re-assert our position.
                    debug!(
                        "tcp: out-of-order segment (seq {}, expected {})",
                        seg.seq, c.rcv_nxt
                    );
                }
                let (seq, ack) = (c.snd_nxt, c.rcv_nxt);
                self.send_to_peer(ts, seq, ack, FLAG_ACK, &[], false);
            }

            if seg.flags & FLAG_FIN != 0 && seg.seq.wrapping_add(seg.payload.len() as u32) == c.rcv_nxt
            {
                c.rcv_nxt = c.rcv_nxt.wrapping_add(1);
                match c.state {
                    TcpState::Established => {
                        // Passive close: ack their FIN, tell the handler to
                        // flush, follow with our own FIN.
                        let (seq, ack) = (c.snd_nxt, c.rcv_nxt);
                        self.send_to_peer(ts, seq, ack, FLAG_ACK, &[], false);
                        notify_close = !c.closed_notified;
                        c.closed_notified = true;
                        if c.unacked.is_empty() {
                            self.send_to_peer(ts, seq, ack, FLAG_FIN | FLAG_ACK, &[], false);
                            c.snd_nxt = c.snd_nxt.wrapping_add(1);
                            c.fin_sent = true;
                        } else {
                            c.fin_after_drain = true;
                        }
                        c.state = TcpState::CloseWait;
                    }
                    TcpState::FinWait1 | TcpState::FinWait2 => {
                        let (seq, ack) = (c.snd_nxt, c.rcv_nxt);
                        self.send_to_peer(ts, seq, ack, FLAG_ACK, &[], false);
                        destroy = true;
                    }
                    _ => {}
                }
            }
        }

        if let Some(data) = deliver {
            if !(ts.handler.new_data)(&ts.base, &data) {
                guard.borrow_mut().pending_close = true;
            }
        }
        if notify_close {
            if let Some(cb) = ts.handler.session_closed_1.as_ref() {
                cb(&ts.base);
            }
        }

        drop(guard);
        if destroy {
            self.destroy_session(hash);
        }
    }

    /// Remove a session from the map (exactly once) and run the teardown
    /// callbacks beneath its lock.
    fn destroy_session(&self, hash: u64) {
        let Some(ts) = self.sessions.write().remove(&hash) else {
            return;
        };
        self.sessions_rem.inc();

        let guard = ts.conn.lock();
        let already_notified = {
            let mut c = guard.borrow_mut();
            let was = c.closed_notified;
            c.closed_notified = true;
            was
        };
        if !already_notified {
            if let Some(cb) = ts.handler.session_closed_1.as_ref() {
                cb(&ts.base);
            }
        }
        if let Some(cb) = ts.handler.session_closed_2.as_ref() {
            cb(&ts.base);
        }
        ts.base.take_private_data();
    }

    /// Answer a stray segment with RST. No session state is consulted.
    fn send_rst(&self, pkt: &Packet, seg: &Segment) {
        let Some(net) = self.net() else { return };

        let (seq, ack_flags) = if seg.flags & FLAG_ACK != 0 {
            (seg.ack, FLAG_RST)
        } else {
            (0, FLAG_RST | FLAG_ACK)
        };
        let mut ack = seg.seq.wrapping_add(seg.payload.len() as u32);
        if seg.flags & FLAG_SYN != 0 {
            ack = ack.wrapping_add(1);
        }
        if seg.flags & FLAG_FIN != 0 {
            ack = ack.wrapping_add(1);
        }

        let out = build_segment(
            pkt.dst_addr(),
            seg.dst_port,
            pkt.src_addr(),
            seg.src_port,
            seq,
            ack,
            ack_flags,
            self.window,
            &[],
            None,
        );
        net.transmit(None, pkt.src_addr(), Some(pkt.dst_addr()), IPPROTO_TCP, &out, None);
    }

    /// Emit one segment on an existing session.
    fn send_to_peer(
        &self,
        ts: &TcpSession,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
        with_mss: bool,
    ) -> bool {
        let Some(net) = self.net() else { return false };

        let mss = if with_mss {
            Some((net.max_payload() - HEADER_SIZE) as u16)
        } else {
            None
        };
        let out = build_segment(
            ts.base.my_addr(),
            ts.base.my_port(),
            ts.base.their_addr(),
            ts.base.their_port(),
            seq,
            ack,
            flags,
            self.window,
            payload,
            mss,
        );
        net.transmit(
            None,
            ts.base.their_addr(),
            Some(ts.base.my_addr()),
            IPPROTO_TCP,
            &out,
            None,
        )
    }

    fn retransmit_loop(&self) {
        while !self.stop.load(Ordering::Relaxed) {
            std::thread::sleep(RETRANS_TICK);

            let sessions: Vec<Arc<TcpSession>> =
                self.sessions.read().values().cloned().collect();

            for ts in sessions {
                let guard = ts.conn.lock();
                let stale: Vec<(u64, u32, u32, Vec<u8>)> = {
                    let mut c = guard.borrow_mut();

                    if c.fin_after_drain && c.unacked.is_empty() && !c.fin_sent {
                        let (seq, ack) = (c.snd_nxt, c.rcv_nxt);
                        self.send_to_peer(&ts, seq, ack, FLAG_FIN | FLAG_ACK, &[], false);
                        c.snd_nxt = c.snd_nxt.wrapping_add(1);
                        c.fin_sent = true;
                        c.fin_after_drain = false;
                        c.state = TcpState::FinWait1;
                    }

                    let ack = c.rcv_nxt;
                    let now = Instant::now();
                    c.unacked
                        .iter_mut()
                        .filter(|s| s.last_sent.elapsed() >= RETRANS_TIMEOUT)
                        .map(|s| {
                            s.last_sent = now;
                            (s.internal_id, s.seq, ack, s.data.clone())
                        })
                        .collect()
                };

                for (id, seq, ack, data) in stale {
                    debug!("tcp: retransmitting segment {id} (seq {seq})");
                    self.send_to_peer(&ts, seq, ack, FLAG_PSH | FLAG_ACK, &data, false);
                }
            }
        }
    }

    fn cleaner_loop(&self) {
        let mut last_clean = Instant::now();
        while !self.stop.load(Ordering::Relaxed) {
            std::thread::sleep(STOP_POLL_INTERVAL);
            if last_clean.elapsed() < CLEAN_INTERVAL {
                continue;
            }
            last_clean = Instant::now();

            let snapshot: Vec<(u64, Arc<TcpSession>)> = self
                .sessions
                .read()
                .iter()
                .map(|(h, ts)| (*h, Arc::clone(ts)))
                .collect();

            for (hash, ts) in snapshot {
                let (evict, reset) = {
                    let guard = ts.conn.lock();
                    let c = guard.borrow();
                    let idle = c.last_pkt.elapsed();
                    if c.pending_close {
                        (true, true)
                    } else if c.state == TcpState::Listen {
                        // Admission never completed.
                        (idle > CLEAN_INTERVAL, false)
                    } else {
                        (idle > SESSION_TIMEOUT, true)
                    }
                };

                if !evict {
                    continue;
                }
                self.sessions_to.inc();
                if reset {
                    let guard = ts.conn.lock();
                    let (seq, ack) = {
                        let c = guard.borrow();
                        (c.snd_nxt, c.rcv_nxt)
                    };
                    self.rst.inc();
                    self.send_to_peer(&ts, seq, ack, FLAG_RST | FLAG_ACK, &[], false);
                }
                self.destroy_session(hash);
            }
        }
    }

    fn mss(&self) -> usize {
        self.net()
            .map_or(1460, |n| n.max_payload().saturating_sub(HEADER_SIZE))
    }

    /// Stop all tasks, then tear down every live session and listener.
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

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl SessionTransport for Tcp {
    fn send_data(&self, session: &Arc<Session>, data: &[u8]) -> bool {
        let Some(ts) = self.sessions.read().get(&session.id()).cloned() else {
            return false;
        };

        let mss = self.mss();
        let guard = ts.conn.lock();
        let mut all_sent = true;

        for chunk in data.chunks(mss.max(1)) {
            let (seq, ack) = {
                let mut c = guard.borrow_mut();
                let seq = c.snd_nxt;
                c.snd_nxt = c.snd_nxt.wrapping_add(chunk.len() as u32);
                let internal_id = c.next_internal_id;
                c.next_internal_id += 1;
                c.unacked.push(UnackedSegment {
                    seq,
                    data: chunk.to_vec(),
                    last_sent: Instant::now(),
                    internal_id,
                });
                (seq, c.rcv_nxt)
            };
            all_sent &= self.send_to_peer(&ts, seq, ack, FLAG_PSH | FLAG_ACK, chunk, false);
        }

        ts.base.touch();
        all_sent
    }

    fn end_session(&self, session: &Arc<Session>) {
        let Some(ts) = self.sessions.read().get(&session.id()).cloned() else {
            return;
        };

        let guard = ts.conn.lock();
        let mut c = guard.borrow_mut();
        if c.fin_sent {
            return;
        }
        if c.unacked.is_empty() {
            let (seq, ack) = (c.snd_nxt, c.rcv_nxt);
            self.send_to_peer(&ts, seq, ack, FLAG_FIN | FLAG_ACK, &[], false);
            c.snd_nxt = c.snd_nxt.wrapping_add(1);
            c.fin_sent = true;
            c.state = TcpState::FinWait1;
        } else {
            // FIN follows once the retransmitter sees the queue drain.
            c.fin_after_drain = true;
        }
    }
}

impl Ingress for Tcp {
    fn queue_packet(&self, pkt: Packet) {
        let p = pkt.data();
        if p.len() < HEADER_SIZE {
            self.errors.inc();
            return;
        }
        let src_port = u16::from_be_bytes([p[0], p[1]]);
        let dst_port = u16::from_be_bytes([p[2], p[3]]);
        let hash = session_hash(pkt.src_addr(), src_port, dst_port);

        // Pin by flow hash: one worker sees all packets of a session, in
        // arrival order.
        let worker = &self.workers[(hash % WORKERS as u64) as usize];
        if !worker.push(pkt) {
            warn!("tcp: worker queue full, dropping segment");
            self.errors.inc();
        }
    }
}

#[derive(Debug)]
struct Segment<'a> {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &'a [u8],
}

impl<'a> Segment<'a> {
    fn parse(p: &'a [u8]) -> Result<Self, ProtocolError> {
        if p.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let data_offset = usize::from(p[12] >> 4) * 4;
        if data_offset < HEADER_SIZE || data_offset > p.len() {
            return Err(ProtocolError::Malformed);
        }
        Ok(Self {
            src_port: u16::from_be_bytes([p[0], p[1]]),
            dst_port: u16::from_be_bytes([p[2], p[3]]),
            seq: u32::from_be_bytes(p[4..8].try_into().unwrap()),
            ack: u32::from_be_bytes(p[8..12].try_into().unwrap()),
            flags: p[13],
            payload: &p[data_offset..],
        })
    }
}

/// Serialize one segment, checksummed over the pseudo-header.
#[allow(clippy::too_many_arguments)]
fn build_segment(
    src: &Addr,
    src_port: u16,
    dst: &Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
) -> Vec<u8> {
    let options_len = if mss.is_some() { 4 } else { 0 };
    let data_offset = HEADER_SIZE + options_len;

    let mut out = Vec::with_capacity(data_offset + payload.len());
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&ack.to_be_bytes());
    out.push(((data_offset / 4) as u8) << 4);
    out.push(flags);
    out.extend_from_slice(&window.to_be_bytes());
    out.extend_from_slice(&[0, 0]); // checksum, filled below
    out.extend_from_slice(&[0, 0]); // urgent pointer
    if let Some(mss) = mss {
        out.push(2);
        out.push(4);
        out.extend_from_slice(&mss.to_be_bytes());
    }
    out.extend_from_slice(payload);

    let checksum = l4_checksum(src, dst, IPPROTO_TCP, &out);
    out[16] = (checksum >> 8) as u8;
    out[17] = checksum as u8;
    out
}

/// True when `a` is after `b` in sequence space.
fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

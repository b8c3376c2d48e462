//! ICMP response engine: echo, timestamp, and the error replies other layers
//! need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::net::{internet_checksum, ErrorSink, Ingress, NetTx, IPPROTO_ICMP};
use crate::packet::Packet;
use crate::phys::STOP_POLL_INTERVAL;
use crate::queue::PktQueue;
use crate::stats::{Counter, Stats};

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_DEST_UNREACHABLE: u8 = 3;
const TYPE_ECHO_REQUEST: u8 = 8;
const TYPE_TIME_EXCEEDED: u8 = 11;
const TYPE_TIMESTAMP_REQUEST: u8 = 13;
const TYPE_TIMESTAMP_REPLY: u8 = 14;

/// Next-hop MTU advertised in error replies.
const NEXT_HOP_MTU: u16 = 1500;

pub struct Icmp {
    net: RwLock<Option<Weak<dyn NetTx>>>,
    queue: PktQueue<Packet>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,

    requests: Counter,
    req_ping: Counter,
    transmit: Counter,
    unknown: Counter,
}

impl Icmp {
    pub fn new(stats: &Stats) -> Arc<Self> {
        Arc::new(Self {
            net: RwLock::new(None),
            queue: PktQueue::new(256),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            requests: stats.register("icmp_requests"),
            req_ping: stats.register("icmp_req_ping"),
            transmit: stats.register("icmp_transmit"),
            unknown: stats.register("icmp_unk_type"),
        })
    }

    /// Attach the network transmit capability.
    pub fn register_net(&self, net: &Arc<dyn NetTx>) {
        *self.net.write() = Some(Arc::downgrade(net));
    }

    fn net(&self) -> Option<Arc<dyn NetTx>> {
        self.net.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let th = std::thread::Builder::new()
            .name("ipstack-icmp".into())
            .spawn(move || me.run())
            .expect("spawn icmp thread");
        *self.thread.lock() = Some(th);
    }

    fn run(&self) {
        while !self.stop.load(Ordering::Relaxed) {
            let Some(pkt) = self.queue.pop(STOP_POLL_INTERVAL) else {
                continue;
            };
            self.handle(&pkt);
        }
    }

    fn handle(&self, pkt: &Packet) {
        let p = pkt.data();
        if p.len() < 8 {
            debug!("icmp: runt packet ({} bytes)", p.len());
            return;
        }

        self.requests.inc();

        let mut reply = p.to_vec();
        match p[0] {
            TYPE_ECHO_REQUEST => {
                self.req_ping.inc();
                reply[0] = TYPE_ECHO_REPLY;
            }
            TYPE_TIMESTAMP_REQUEST if p.len() >= 20 => {
                reply[0] = TYPE_TIMESTAMP_REPLY;
                let ts = ms_since_midnight().to_be_bytes();
                reply[12..16].copy_from_slice(&ts); // receive timestamp
                reply[16..20].copy_from_slice(&ts); // transmit timestamp
            }
            t => {
                debug!("icmp: dropping type {t} code {}", p[1]);
                self.unknown.inc();
                return;
            }
        }

        reply[2] = 0;
        reply[3] = 0;
        let checksum = internet_checksum(&reply);
        reply[2] = (checksum >> 8) as u8;
        reply[3] = checksum as u8;

        let Some(net) = self.net() else { return };

        // The reply reuses the peer's header fields with the identification
        // stepped by one.
        let mut template = pkt.header().to_vec();
        if template.len() >= 6 {
            let id = u16::from_be_bytes([template[4], template[5]]).wrapping_add(1);
            template[4..6].copy_from_slice(&id.to_be_bytes());
        }

        net.transmit(
            None,
            pkt.src_addr(),
            Some(pkt.dst_addr()),
            IPPROTO_ICMP,
            &reply,
            Some(&template),
        );
    }

    /// Emit an error reply of `icmp_type`/`code` quoting the offending
    /// packet's network header plus its first eight payload bytes.
    fn send_error(&self, icmp_type: u8, code: u8, pkt: &Packet) {
        self.transmit.inc();

        let header = pkt.header();
        let quoted = pkt.data().len().min(8);

        let mut out = Vec::with_capacity(8 + header.len() + quoted);
        out.push(icmp_type);
        out.push(code);
        out.extend_from_slice(&[0, 0]); // checksum, filled below
        out.extend_from_slice(&[0, 0]); // unused
        out.extend_from_slice(&NEXT_HOP_MTU.to_be_bytes());
        out.extend_from_slice(header);
        out.extend_from_slice(&pkt.data()[..quoted]);
        if out.len() % 2 != 0 {
            out.push(0);
        }

        let checksum = internet_checksum(&out);
        out[2] = (checksum >> 8) as u8;
        out[3] = checksum as u8;

        if let Some(net) = self.net() {
            net.transmit(
                None,
                pkt.src_addr(),
                Some(pkt.dst_addr()),
                IPPROTO_ICMP,
                &out,
                None,
            );
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(th) = self.thread.lock().take() {
            let _ = th.join();
        }
    }
}

impl ErrorSink for Icmp {
    fn ttl_exceeded(&self, pkt: &Packet) {
        self.send_error(TYPE_TIME_EXCEEDED, 0, pkt);
    }

    fn port_unreachable(&self, pkt: &Packet) {
        self.send_error(TYPE_DEST_UNREACHABLE, 3, pkt);
    }
}

impl Ingress for Icmp {
    fn queue_packet(&self, pkt: Packet) {
        self.queue.push(pkt);
    }
}

/// Milliseconds since UTC midnight, the unit ICMP timestamp messages carry.
fn ms_since_midnight() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ((now.as_secs() % 86_400) * 1000 + u64::from(now.subsec_millis())) as u32
}

//! ICMPv6 response engine and NDP neighbor discovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::addr::Addr;
use crate::net::{l4_checksum, ErrorSink, Ingress, NetTx, IPPROTO_ICMPV6};
use crate::packet::Packet;
use crate::phys::STOP_POLL_INTERVAL;
use crate::queue::PktQueue;
use crate::resolver::NeighborCache;
use crate::stats::{Counter, Stats};

const TYPE_DEST_UNREACHABLE: u8 = 1;
const TYPE_TIME_EXCEEDED: u8 = 3;
const TYPE_ECHO_REQUEST: u8 = 128;
const TYPE_ECHO_REPLY: u8 = 129;
const TYPE_NEIGHBOR_SOLICIT: u8 = 135;
const TYPE_NEIGHBOR_ADVERT: u8 = 136;

const OPT_SOURCE_LINK_ADDR: u8 = 1;
const OPT_TARGET_LINK_ADDR: u8 = 2;

/// Advertisement flags: solicited + override.
const NA_FLAGS: u8 = 0x60;

const NEXT_HOP_MTU: u16 = 1500;

/// Neighbor discovery for IPv6: the v6 twin of ARP.
///
/// Owns the v6 neighbor cache, emits solicitations to the solicited-node
/// multicast group and answers solicitations for the local address with an
/// advertisement carrying the local link-layer address.
pub struct Ndp {
    my_mac: Addr,
    my_ip: Addr,
    cache: Arc<NeighborCache>,
    net: RwLock<Option<Weak<dyn NetTx>>>,
}

impl Ndp {
    pub fn new(stats: &Stats, my_mac: Addr, my_ip: Addr) -> Arc<Self> {
        Arc::new(Self {
            my_mac,
            my_ip,
            cache: NeighborCache::new(stats, "ndp"),
            net: RwLock::new(None),
        })
    }

    pub fn register_net(&self, net: &Arc<dyn NetTx>) {
        *self.net.write() = Some(Arc::downgrade(net));
    }

    fn net(&self) -> Option<Arc<dyn NetTx>> {
        self.net.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn cache(&self) -> &Arc<NeighborCache> {
        &self.cache
    }

    pub fn start(self: &Arc<Self>) {
        self.cache.start();
    }

    pub fn stop(&self) {
        self.cache.stop();
    }

    /// Resolve an IPv6 address to a MAC, soliciting if necessary.
    pub fn resolve(&self, ip: &Addr) -> Option<Addr> {
        if *ip == self.my_ip {
            return Some(self.my_mac);
        }
        self.cache.resolve(ip, || self.send_solicit(ip))
    }

    fn send_solicit(&self, target: &Addr) {
        let Some(net) = self.net() else { return };
        let Some(group) = target.solicited_node_multicast() else {
            return;
        };

        let mut msg = Vec::with_capacity(32);
        msg.push(TYPE_NEIGHBOR_SOLICIT);
        msg.push(0);
        msg.extend_from_slice(&[0, 0]); // checksum, filled below
        msg.extend_from_slice(&[0, 0, 0, 0]); // reserved
        msg.extend_from_slice(target.bytes());
        msg.push(OPT_SOURCE_LINK_ADDR);
        msg.push(1);
        msg.extend_from_slice(self.my_mac.bytes());

        let checksum = l4_checksum(&self.my_ip, &group, IPPROTO_ICMPV6, &msg);
        msg[2] = (checksum >> 8) as u8;
        msg[3] = checksum as u8;

        net.transmit(None, &group, Some(&self.my_ip), IPPROTO_ICMPV6, &msg, None);
    }

    /// Handle a neighbor solicitation: learn the sender, and advertise our
    /// link-layer address when the target is us.
    fn handle_solicit(&self, pkt: &Packet) {
        let p = pkt.data();
        if p.len() < 24 {
            return;
        }

        let target = Addr::Ipv6(p[8..24].try_into().unwrap());

        if let Some(mac) = find_option(&p[24..], OPT_SOURCE_LINK_ADDR) {
            self.cache.observe(&mac, pkt.src_addr());
        }

        if target != self.my_ip {
            return;
        }
        debug!("ndp: solicitation for {} from {}", target, pkt.src_addr());

        let Some(net) = self.net() else { return };

        let mut msg = Vec::with_capacity(32);
        msg.push(TYPE_NEIGHBOR_ADVERT);
        msg.push(0);
        msg.extend_from_slice(&[0, 0]); // checksum, filled below
        msg.push(NA_FLAGS);
        msg.extend_from_slice(&[0, 0, 0]); // reserved
        msg.extend_from_slice(self.my_ip.bytes());
        msg.push(OPT_TARGET_LINK_ADDR);
        msg.push(1);
        msg.extend_from_slice(self.my_mac.bytes());

        let checksum = l4_checksum(&self.my_ip, pkt.src_addr(), IPPROTO_ICMPV6, &msg);
        msg[2] = (checksum >> 8) as u8;
        msg[3] = checksum as u8;

        net.transmit(
            Some(*pkt.src_mac()),
            pkt.src_addr(),
            Some(&self.my_ip),
            IPPROTO_ICMPV6,
            &msg,
            None,
        );
    }

    /// Handle a neighbor advertisement: a directed reply installs a strong
    /// cache entry and wakes blocked resolvers.
    fn handle_advert(&self, pkt: &Packet) {
        let p = pkt.data();
        if p.len() < 24 {
            return;
        }

        let target = Addr::Ipv6(p[8..24].try_into().unwrap());
        if let Some(mac) = find_option(&p[24..], OPT_TARGET_LINK_ADDR) {
            self.cache.install(&mac, &target);
        }
    }
}

/// Walk NDP options and return the link-layer address carried by the first
/// option of the wanted type.
fn find_option(mut opts: &[u8], wanted: u8) -> Option<Addr> {
    while opts.len() >= 8 {
        let opt_type = opts[0];
        let opt_len = usize::from(opts[1]) * 8;
        if opt_len == 0 || opt_len > opts.len() {
            return None;
        }
        if opt_type == wanted && opt_len == 8 {
            return Some(Addr::Mac(opts[2..8].try_into().unwrap()));
        }
        opts = &opts[opt_len..];
    }
    None
}

/// ICMPv6 engine: echo plus delegation of neighbor discovery to [`Ndp`].
pub struct Icmp6 {
    ndp: Arc<Ndp>,
    my_ip: Addr,
    net: RwLock<Option<Weak<dyn NetTx>>>,
    queue: PktQueue<Packet>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,

    requests: Counter,
    req_ping: Counter,
    transmit: Counter,
    bad_csum: Counter,
    unknown: Counter,
}

impl Icmp6 {
    pub fn new(stats: &Stats, ndp: Arc<Ndp>, my_ip: Addr) -> Arc<Self> {
        Arc::new(Self {
            ndp,
            my_ip,
            net: RwLock::new(None),
            queue: PktQueue::new(256),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            requests: stats.register("icmp6_requests"),
            req_ping: stats.register("icmp6_req_ping"),
            transmit: stats.register("icmp6_transmit"),
            bad_csum: stats.register("icmp6_bad_csum"),
            unknown: stats.register("icmp6_unk_type"),
        })
    }

    pub fn register_net(&self, net: &Arc<dyn NetTx>) {
        *self.net.write() = Some(Arc::downgrade(net));
    }

    fn net(&self) -> Option<Arc<dyn NetTx>> {
        self.net.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let th = std::thread::Builder::new()
            .name("ipstack-icmp6".into())
            .spawn(move || me.run())
            .expect("spawn icmp6 thread");
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
            return;
        }

        if l4_checksum(pkt.src_addr(), pkt.dst_addr(), IPPROTO_ICMPV6, p) != 0 {
            self.bad_csum.inc();
            return;
        }

        self.requests.inc();

        match p[0] {
            TYPE_ECHO_REQUEST => {
                self.req_ping.inc();
                let mut reply = p.to_vec();
                reply[0] = TYPE_ECHO_REPLY;
                reply[2] = 0;
                reply[3] = 0;
                let checksum =
                    l4_checksum(&self.my_ip, pkt.src_addr(), IPPROTO_ICMPV6, &reply);
                reply[2] = (checksum >> 8) as u8;
                reply[3] = checksum as u8;

                if let Some(net) = self.net() {
                    net.transmit(
                        None,
                        pkt.src_addr(),
                        Some(&self.my_ip),
                        IPPROTO_ICMPV6,
                        &reply,
                        None,
                    );
                }
            }
            TYPE_NEIGHBOR_SOLICIT => self.ndp.handle_solicit(pkt),
            TYPE_NEIGHBOR_ADVERT => self.ndp.handle_advert(pkt),
            t => {
                debug!("icmp6: dropping type {t} code {}", p[1]);
                self.unknown.inc();
            }
        }
    }

    fn send_error(&self, icmp_type: u8, code: u8, pkt: &Packet) {
        self.transmit.inc();

        let header = pkt.header();
        let quoted = pkt.data().len().min(8);

        let mut out = Vec::with_capacity(8 + header.len() + quoted);
        out.push(icmp_type);
        out.push(code);
        out.extend_from_slice(&[0, 0]); // checksum, filled below
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&NEXT_HOP_MTU.to_be_bytes());
        out.extend_from_slice(header);
        out.extend_from_slice(&pkt.data()[..quoted]);

        let checksum = l4_checksum(&self.my_ip, pkt.src_addr(), IPPROTO_ICMPV6, &out);
        out[2] = (checksum >> 8) as u8;
        out[3] = checksum as u8;

        if let Some(net) = self.net() {
            net.transmit(
                None,
                pkt.src_addr(),
                Some(&self.my_ip),
                IPPROTO_ICMPV6,
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

impl ErrorSink for Icmp6 {
    fn ttl_exceeded(&self, pkt: &Packet) {
        self.send_error(TYPE_TIME_EXCEEDED, 0, pkt);
    }

    fn port_unreachable(&self, pkt: &Packet) {
        self.send_error(TYPE_DEST_UNREACHABLE, 4, pkt);
    }
}

impl Ingress for Icmp6 {
    fn queue_packet(&self, pkt: Packet) {
        self.queue.push(pkt);
    }
}

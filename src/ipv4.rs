//! IPv4: header validation, protocol demultiplexing, header construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::addr::Addr;
use crate::arp::Arp;
use crate::net::{internet_checksum, ErrorSink, Ingress, NetTx, ETHERTYPE_IPV4};
use crate::packet::Packet;
use crate::phys::{Phys, STOP_POLL_INTERVAL};
use crate::queue::PktQueue;
use crate::stats::{Counter, Stats};

const HEADER_SIZE: usize = 20;
const DEFAULT_TTL: u8 = 255;

pub struct Ipv4 {
    my_addr: Addr,
    my_mac: Addr,
    arp: Arc<Arp>,
    error_sink: RwLock<Option<Arc<dyn ErrorSink>>>,
    prot_map: RwLock<HashMap<u8, Arc<dyn Ingress>>>,
    phys: RwLock<Option<Weak<Phys>>>,
    queue: PktQueue<Packet>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,

    n_pkt: Counter,
    not_me: Counter,
    ttl_ex: Counter,
    unk_prot: Counter,
    bad_csum: Counter,
    n_tx: Counter,
    tx_err: Counter,
}

impl Ipv4 {
    pub fn new(stats: &Stats, arp: Arc<Arp>, my_addr: Addr, my_mac: Addr) -> Arc<Self> {
        Arc::new(Self {
            my_addr,
            my_mac,
            arp,
            error_sink: RwLock::new(None),
            prot_map: RwLock::new(HashMap::new()),
            phys: RwLock::new(None),
            queue: PktQueue::new(512),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            n_pkt: stats.register("ipv4_n_pkt"),
            not_me: stats.register("ipv4_not_me"),
            ttl_ex: stats.register("ipv4_ttl_ex"),
            unk_prot: stats.register("ipv4_unk_prot"),
            bad_csum: stats.register("ipv4_bad_csum"),
            n_tx: stats.register("ipv4_n_tx"),
            tx_err: stats.register("ipv4_tx_err"),
        })
    }

    /// Bind a transport engine to an IP protocol number.
    pub fn register_protocol(&self, protocol: u8, p: Arc<dyn Ingress>) {
        self.prot_map.write().insert(protocol, p);
    }

    /// Attach the error-reply capability (ICMP).
    pub fn register_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        *self.error_sink.write() = Some(sink);
    }

    pub fn register_phys(&self, phys: &Arc<Phys>) {
        *self.phys.write() = Some(Arc::downgrade(phys));
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let th = std::thread::Builder::new()
            .name("ipstack-ipv4".into())
            .spawn(move || me.run())
            .expect("spawn ipv4 thread");
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
        if p.len() < HEADER_SIZE {
            return;
        }

        if p[0] >> 4 != 4 {
            debug!("ipv4: version nibble {}", p[0] >> 4);
            return;
        }
        self.n_pkt.inc();

        let header_size = usize::from(p[0] & 0x0f) * 4;
        let ip_size = usize::from(u16::from_be_bytes([p[2], p[3]]));
        // Ethernet pads short frames; the total-length field is authoritative.
        if header_size < HEADER_SIZE || ip_size > p.len() || header_size > ip_size {
            debug!("ipv4: bad sizes (header {header_size}, total {ip_size}, frame {})", p.len());
            return;
        }

        if internet_checksum(&p[..header_size]) != 0 {
            self.bad_csum.inc();
            return;
        }

        let src = Addr::Ipv4(p[12..16].try_into().unwrap());
        let dst = Addr::Ipv4(p[16..20].try_into().unwrap());

        self.arp.cache().observe(pkt.src_mac(), &src);

        if dst != self.my_addr {
            self.not_me.inc();
            return;
        }

        // Unknown protocols drop silently, before the TTL is ever looked at.
        let protocol = p[9];
        let Some(next) = self.prot_map.read().get(&protocol).cloned() else {
            debug!("ipv4: unknown protocol {protocol:#04x} from {src}");
            self.unk_prot.inc();
            return;
        };

        let ip_pkt = pkt.network(
            src,
            dst,
            p[header_size..ip_size].to_vec(),
            p[..header_size].to_vec(),
        );

        if p[8] <= 1 {
            self.ttl_ex.inc();
            if let Some(sink) = self.error_sink.read().clone() {
                sink.ttl_exceeded(&ip_pkt);
            }
            return;
        }

        next.queue_packet(ip_pkt);
    }
}

impl NetTx for Ipv4 {
    fn transmit(
        &self,
        dst_mac: Option<Addr>,
        dst_ip: &Addr,
        src_ip: Option<&Addr>,
        protocol: u8,
        payload: &[u8],
        header_template: Option<&[u8]>,
    ) -> bool {
        self.n_tx.inc();

        let Some(phys) = self.phys.read().as_ref().and_then(Weak::upgrade) else {
            self.tx_err.inc();
            return false;
        };

        let total = HEADER_SIZE + payload.len();
        let mut out = Vec::with_capacity(total);
        out.push(0x45);
        out.push(header_template.map_or(0, |t| t[1]));
        out.extend_from_slice(&(total as u16).to_be_bytes());
        match header_template {
            // Replies carry the peer's identification forward.
            Some(t) => out.extend_from_slice(&t[4..6]),
            None => out.extend_from_slice(&[0, 0]),
        }
        out.extend_from_slice(&[0, 0]); // flags, fragment offset
        out.push(header_template.map_or(DEFAULT_TTL, |t| t[8]));
        out.push(protocol);
        out.extend_from_slice(&[0, 0]); // checksum, filled below
        out.extend_from_slice(src_ip.unwrap_or(&self.my_addr).bytes());
        out.extend_from_slice(dst_ip.bytes());

        let checksum = internet_checksum(&out[..HEADER_SIZE]);
        out[10] = (checksum >> 8) as u8;
        out[11] = checksum as u8;

        out.extend_from_slice(payload);

        let dst_mac = match dst_mac.or_else(|| self.arp.resolve(dst_ip)) {
            Some(mac) => mac,
            None => {
                debug!("ipv4: no link address for {dst_ip}");
                self.tx_err.inc();
                return false;
            }
        };

        phys.transmit(&dst_mac, &self.my_mac, ETHERTYPE_IPV4, &out)
    }

    fn max_payload(&self) -> usize {
        let mtu = self
            .phys
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(1500, |p| p.max_packet_size());
        mtu - HEADER_SIZE
    }

    fn local_addr(&self) -> Addr {
        self.my_addr
    }
}

impl Ingress for Ipv4 {
    fn queue_packet(&self, pkt: Packet) {
        self.queue.push(pkt);
    }
}

impl Ipv4 {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(th) = self.thread.lock().take() {
            let _ = th.join();
        }
    }
}

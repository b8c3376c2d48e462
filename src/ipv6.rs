//! IPv6: header validation, next-header demultiplexing, header construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::addr::Addr;
use crate::icmp6::Ndp;
use crate::net::{ErrorSink, Ingress, NetTx, ETHERTYPE_IPV6};
use crate::packet::Packet;
use crate::phys::{Phys, STOP_POLL_INTERVAL};
use crate::queue::PktQueue;
use crate::stats::{Counter, Stats};

const HEADER_SIZE: usize = 40;
const DEFAULT_HOP_LIMIT: u8 = 255;

pub struct Ipv6 {
    my_addr: Addr,
    my_mac: Addr,
    ndp: Arc<Ndp>,
    error_sink: RwLock<Option<Arc<dyn ErrorSink>>>,
    prot_map: RwLock<HashMap<u8, Arc<dyn Ingress>>>,
    phys: RwLock<Option<Weak<Phys>>>,
    queue: PktQueue<Packet>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,

    n_pkt: Counter,
    not_me: Counter,
    hop_ex: Counter,
    unk_prot: Counter,
    n_tx: Counter,
    tx_err: Counter,
}

impl Ipv6 {
    pub fn new(stats: &Stats, ndp: Arc<Ndp>, my_addr: Addr, my_mac: Addr) -> Arc<Self> {
        Arc::new(Self {
            my_addr,
            my_mac,
            ndp,
            error_sink: RwLock::new(None),
            prot_map: RwLock::new(HashMap::new()),
            phys: RwLock::new(None),
            queue: PktQueue::new(512),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            n_pkt: stats.register("ipv6_n_pkt"),
            not_me: stats.register("ipv6_not_me"),
            hop_ex: stats.register("ipv6_hop_ex"),
            unk_prot: stats.register("ipv6_unk_prot"),
            n_tx: stats.register("ipv6_n_tx"),
            tx_err: stats.register("ipv6_tx_err"),
        })
    }

    pub fn register_protocol(&self, protocol: u8, p: Arc<dyn Ingress>) {
        self.prot_map.write().insert(protocol, p);
    }

    pub fn register_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        *self.error_sink.write() = Some(sink);
    }

    pub fn register_phys(&self, phys: &Arc<Phys>) {
        *self.phys.write() = Some(Arc::downgrade(phys));
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let th = std::thread::Builder::new()
            .name("ipstack-ipv6".into())
            .spawn(move || me.run())
            .expect("spawn ipv6 thread");
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

    /// Destinations we accept: the bound unicast address, all-nodes
    /// multicast, and our solicited-node multicast group.
    fn is_for_me(&self, dst: &Addr) -> bool {
        if *dst == self.my_addr {
            return true;
        }
        if let Addr::Ipv6(b) = dst {
            if b[0] == 0xff && b[1] == 0x02 && b[2..15].iter().all(|&x| x == 0) && b[15] == 1 {
                return true;
            }
        }
        self.my_addr.solicited_node_multicast().as_ref() == Some(dst)
    }

    fn handle(&self, pkt: &Packet) {
        let p = pkt.data();
        if p.len() < HEADER_SIZE {
            return;
        }

        if p[0] >> 4 != 6 {
            debug!("ipv6: version nibble {}", p[0] >> 4);
            return;
        }
        self.n_pkt.inc();

        let payload_len = usize::from(u16::from_be_bytes([p[4], p[5]]));
        if HEADER_SIZE + payload_len > p.len() {
            debug!("ipv6: payload length {} exceeds frame", payload_len);
            return;
        }

        let next_header = p[6];
        let hop_limit = p[7];
        let src = Addr::Ipv6(p[8..24].try_into().unwrap());
        let dst = Addr::Ipv6(p[24..40].try_into().unwrap());

        self.ndp.cache().observe(pkt.src_mac(), &src);

        if !self.is_for_me(&dst) {
            self.not_me.inc();
            return;
        }

        // Unknown next headers drop silently, before the hop limit is ever
        // looked at.
        let Some(next) = self.prot_map.read().get(&next_header).cloned() else {
            debug!("ipv6: unknown next header {next_header:#04x} from {src}");
            self.unk_prot.inc();
            return;
        };

        let ip_pkt = pkt.network(
            src,
            dst,
            p[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec(),
            p[..HEADER_SIZE].to_vec(),
        );

        if hop_limit <= 1 {
            self.hop_ex.inc();
            if let Some(sink) = self.error_sink.read().clone() {
                sink.ttl_exceeded(&ip_pkt);
            }
            return;
        }

        next.queue_packet(ip_pkt);
    }
}

impl NetTx for Ipv6 {
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

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&[0x60, 0, 0, 0]);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.push(protocol);
        out.push(header_template.map_or(DEFAULT_HOP_LIMIT, |t| t[7]));
        out.extend_from_slice(src_ip.unwrap_or(&self.my_addr).bytes());
        out.extend_from_slice(dst_ip.bytes());
        out.extend_from_slice(payload);

        // Multicast maps straight onto a group MAC; unicast goes through
        // neighbor discovery.
        let dst_mac = dst_mac
            .or_else(|| dst_ip.ipv6_multicast_mac().filter(|_| dst_ip.is_ipv6_multicast()))
            .or_else(|| self.ndp.resolve(dst_ip));
        let dst_mac = match dst_mac {
            Some(mac) => mac,
            None => {
                debug!("ipv6: no link address for {dst_ip}");
                self.tx_err.inc();
                return false;
            }
        };

        phys.transmit(&dst_mac, &self.my_mac, ETHERTYPE_IPV6, &out)
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

impl Ingress for Ipv6 {
    fn queue_packet(&self, pkt: Packet) {
        self.queue.push(pkt);
    }
}

impl Ipv6 {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(th) = self.thread.lock().take() {
            let _ = th.join();
        }
    }
}

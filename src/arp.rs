//! ARP: answers who-has queries for the local address and resolves peer
//! addresses through the neighbor cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::addr::{Addr, MAC_BROADCAST};
use crate::net::{Ingress, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::packet::Packet;
use crate::phys::{Phys, STOP_POLL_INTERVAL};
use crate::queue::PktQueue;
use crate::resolver::NeighborCache;
use crate::stats::{Counter, Stats};

const OPER_REQUEST: u16 = 1;
const OPER_REPLY: u16 = 2;
const ARP_PACKET_SIZE: usize = 28;

pub struct Arp {
    my_mac: Addr,
    my_ip: Addr,
    cache: Arc<NeighborCache>,
    phys: RwLock<Option<Weak<Phys>>>,
    queue: PktQueue<Packet>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,

    requests: Counter,
    replies: Counter,
}

impl Arp {
    pub fn new(stats: &Stats, my_mac: Addr, my_ip: Addr) -> Arc<Self> {
        Arc::new(Self {
            my_mac,
            my_ip,
            cache: NeighborCache::new(stats, "arp"),
            phys: RwLock::new(None),
            queue: PktQueue::new(256),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            requests: stats.register("arp_requests"),
            replies: stats.register("arp_replies"),
        })
    }

    pub fn register_phys(&self, phys: &Arc<Phys>) {
        *self.phys.write() = Some(Arc::downgrade(phys));
    }

    pub fn cache(&self) -> &Arc<NeighborCache> {
        &self.cache
    }

    pub fn start(self: &Arc<Self>) {
        self.cache.start();
        let me = Arc::clone(self);
        let th = std::thread::Builder::new()
            .name("ipstack-arp".into())
            .spawn(move || me.run())
            .expect("spawn arp thread");
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
        if p.len() < ARP_PACKET_SIZE {
            return;
        }

        let htype = u16::from_be_bytes([p[0], p[1]]);
        let ptype = u16::from_be_bytes([p[2], p[3]]);
        if htype != 1 || ptype != ETHERTYPE_IPV4 || p[4] != 6 || p[5] != 4 {
            return;
        }

        let oper = u16::from_be_bytes([p[6], p[7]]);
        let sender_mac = Addr::Mac(p[8..14].try_into().unwrap());
        let sender_ip = Addr::Ipv4(p[14..18].try_into().unwrap());
        let target_ip = Addr::Ipv4(p[24..28].try_into().unwrap());

        match oper {
            OPER_REQUEST => {
                self.requests.inc();
                self.cache.observe(&sender_mac, &sender_ip);

                if target_ip == self.my_ip {
                    debug!("arp: who-has {} from {}", target_ip, sender_ip);
                    self.send_reply(&sender_mac, &sender_ip);
                }
            }
            OPER_REPLY => {
                debug!("arp: {} is-at {}", sender_ip, sender_mac);
                self.cache.install(&sender_mac, &sender_ip);
            }
            _ => {}
        }
    }

    fn build(&self, oper: u16, target_mac: &Addr, target_ip: &Addr) -> Vec<u8> {
        let mut out = Vec::with_capacity(ARP_PACKET_SIZE);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        out.push(6);
        out.push(4);
        out.extend_from_slice(&oper.to_be_bytes());
        out.extend_from_slice(self.my_mac.bytes());
        out.extend_from_slice(self.my_ip.bytes());
        out.extend_from_slice(target_mac.bytes());
        out.extend_from_slice(target_ip.bytes());
        out
    }

    fn send_reply(&self, requester_mac: &Addr, requester_ip: &Addr) {
        let reply = self.build(OPER_REPLY, requester_mac, requester_ip);
        if let Some(phys) = self.phys.read().as_ref().and_then(Weak::upgrade) {
            phys.transmit(requester_mac, &self.my_mac, ETHERTYPE_ARP, &reply);
            self.replies.inc();
        }
    }

    fn send_who_has(&self, target_ip: &Addr) {
        let req = self.build(OPER_REQUEST, &Addr::Mac([0; 6]), target_ip);
        if let Some(phys) = self.phys.read().as_ref().and_then(Weak::upgrade) {
            phys.transmit(&MAC_BROADCAST, &self.my_mac, ETHERTYPE_ARP, &req);
        }
    }

    /// Resolve an IPv4 address to a MAC, soliciting if necessary.
    pub fn resolve(&self, ip: &Addr) -> Option<Addr> {
        if *ip == self.my_ip {
            return Some(self.my_mac);
        }
        self.cache.resolve(ip, || self.send_who_has(ip))
    }

    pub fn stop(&self) {
        self.cache.stop();
        self.stop.store(true, Ordering::Relaxed);
        if let Some(th) = self.thread.lock().take() {
            let _ = th.join();
        }
    }
}

impl Ingress for Arp {
    fn queue_packet(&self, pkt: Packet) {
        self.queue.push(pkt);
    }
}

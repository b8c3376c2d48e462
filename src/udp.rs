//! UDP: thin demultiplexer onto registered port handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::addr::Addr;
use crate::handler::UdpHandler;
use crate::net::{l4_checksum, ErrorSink, Ingress, NetTx, IPPROTO_UDP};
use crate::packet::Packet;
use crate::phys::STOP_POLL_INTERVAL;
use crate::queue::PktQueue;
use crate::stats::{Counter, Stats};

const HEADER_SIZE: usize = 8;

pub struct Udp {
    net: RwLock<Option<Weak<dyn NetTx>>>,
    error_sink: RwLock<Option<Arc<dyn ErrorSink>>>,
    handlers: RwLock<HashMap<u16, UdpHandler>>,
    queue: PktQueue<Packet>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,

    n_pkt: Counter,
    unreachable: Counter,
    n_tx: Counter,
}

impl Udp {
    pub fn new(stats: &Stats) -> Arc<Self> {
        Arc::new(Self {
            net: RwLock::new(None),
            error_sink: RwLock::new(None),
            handlers: RwLock::new(HashMap::new()),
            queue: PktQueue::new(256),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            n_pkt: stats.register("udp_n_pkt"),
            unreachable: stats.register("udp_port_unreachable"),
            n_tx: stats.register("udp_n_tx"),
        })
    }

    pub fn register_net(&self, net: &Arc<dyn NetTx>) {
        *self.net.write() = Some(Arc::downgrade(net));
    }

    pub fn register_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        *self.error_sink.write() = Some(sink);
    }

    /// Bind a datagram handler to a local port.
    pub fn add_handler(&self, port: u16, handler: UdpHandler) {
        self.handlers.write().insert(port, handler);
    }

    pub fn remove_handler(&self, port: u16) {
        self.handlers.write().remove(&port);
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let th = std::thread::Builder::new()
            .name("ipstack-udp".into())
            .spawn(move || me.run())
            .expect("spawn udp thread");
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
        self.n_pkt.inc();

        let src_port = u16::from_be_bytes([p[0], p[1]]);
        let dst_port = u16::from_be_bytes([p[2], p[3]]);
        let udp_len = usize::from(u16::from_be_bytes([p[4], p[5]]));
        if udp_len < HEADER_SIZE || udp_len > p.len() {
            debug!("udp: bad length field {udp_len}");
            return;
        }
        let payload = &p[HEADER_SIZE..udp_len];

        let handlers = self.handlers.read();
        match handlers.get(&dst_port) {
            Some(handler) => {
                handler(pkt.src_addr(), src_port, pkt.dst_addr(), dst_port, payload);
            }
            None => {
                drop(handlers);
                debug!("udp: no handler on port {dst_port}");
                self.unreachable.inc();
                if let Some(sink) = self.error_sink.read().clone() {
                    sink.port_unreachable(pkt);
                }
            }
        }
    }

    /// Emit one datagram. Used by handlers to answer their peers.
    pub fn send(&self, dst: &Addr, dst_port: u16, src_port: u16, payload: &[u8]) -> bool {
        let Some(net) = self.net.read().as_ref().and_then(Weak::upgrade) else {
            return false;
        };
        self.n_tx.inc();

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&src_port.to_be_bytes());
        out.extend_from_slice(&dst_port.to_be_bytes());
        out.extend_from_slice(&((HEADER_SIZE + payload.len()) as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0]); // checksum, filled below
        out.extend_from_slice(payload);

        let src = net.local_addr();
        let mut checksum = l4_checksum(&src, dst, IPPROTO_UDP, &out);
        if checksum == 0 {
            // All-zero means "no checksum" on the wire.
            checksum = 0xffff;
        }
        out[6] = (checksum >> 8) as u8;
        out[7] = checksum as u8;

        net.transmit(None, dst, None, IPPROTO_UDP, &out, None)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(th) = self.thread.lock().take() {
            let _ = th.join();
        }
    }
}

impl Ingress for Udp {
    fn queue_packet(&self, pkt: Packet) {
        self.queue.push(pkt);
    }
}

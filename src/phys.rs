//! Link layer: device abstraction, Ethernet demultiplexing, frame emission.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::addr::Addr;
use crate::net::Ingress;
use crate::packet::Packet;
use crate::stats::{Counter, Stats};

/// Size of the Ethernet II header.
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// Poll interval: every blocking read in the stack observes its stop flag at
/// this latency.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A raw layer-2 device: a TAP interface, a raw socket or a frame tunnel.
///
/// `recv` must return `Ok(0)` on timeout so the ingress task can observe the
/// stop flag.
pub trait Device: Send + Sync {
    /// Read one frame into `buf`, waiting at most `timeout`.
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Emit one frame.
    fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Link MTU (payload bytes after the Ethernet header).
    fn mtu(&self) -> usize;
}

/// The link engine.
///
/// Owns the device, runs the ingress task that demultiplexes frames by
/// EtherType into the registered network layers, and serializes outbound
/// frame emission.
pub struct Phys {
    dev: Arc<dyn Device>,
    prot_map: RwLock<HashMap<u16, Arc<dyn Ingress>>>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,

    recv_frame: Counter,
    invl_frame: Counter,
    ign_frame: Counter,
    transmit: Counter,
}

impl Phys {
    pub fn new(dev: Arc<dyn Device>, stats: &Stats) -> Arc<Self> {
        Arc::new(Self {
            dev,
            prot_map: RwLock::new(HashMap::new()),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            recv_frame: stats.register("phys_recv_frame"),
            invl_frame: stats.register("phys_invl_frame"),
            ign_frame: stats.register("phys_ign_frame"),
            transmit: stats.register("phys_transmit"),
        })
    }

    /// Bind a network layer to an EtherType.
    pub fn register_protocol(&self, ether_type: u16, p: Arc<dyn Ingress>) {
        self.prot_map.write().insert(ether_type, p);
    }

    /// Largest payload an outbound frame can carry.
    pub fn max_packet_size(&self) -> usize {
        self.dev.mtu()
    }

    /// Start the ingress task.
    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let th = std::thread::Builder::new()
            .name("ipstack-phys".into())
            .spawn(move || me.ingress_loop())
            .expect("spawn phys thread");
        *self.thread.lock() = Some(th);
    }

    fn ingress_loop(&self) {
        let mut buf = vec![0u8; 65536];
        while !self.stop.load(Ordering::Relaxed) {
            let n = match self.dev.recv(&mut buf, STOP_POLL_INTERVAL) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => {
                    warn!("phys: receive error: {e}");
                    continue;
                }
            };

            self.recv_frame.inc();

            if n < ETHERNET_HEADER_SIZE {
                self.invl_frame.inc();
                continue;
            }

            let dst_mac = Addr::Mac(buf[0..6].try_into().unwrap());
            let src_mac = Addr::Mac(buf[6..12].try_into().unwrap());
            let ether_type = u16::from_be_bytes([buf[12], buf[13]]);

            let prot = self.prot_map.read().get(&ether_type).cloned();
            match prot {
                Some(p) => {
                    let payload = buf[ETHERNET_HEADER_SIZE..n].to_vec();
                    p.queue_packet(Packet::link(src_mac, dst_mac, payload));
                }
                None => {
                    debug!("phys: no handler for ethertype {ether_type:#06x}");
                    self.ign_frame.inc();
                }
            }
        }
    }

    /// Build and emit one Ethernet frame.
    pub fn transmit(&self, dst_mac: &Addr, src_mac: &Addr, ether_type: u16, payload: &[u8]) -> bool {
        let mut frame = Vec::with_capacity(ETHERNET_HEADER_SIZE + payload.len());
        frame.extend_from_slice(dst_mac.bytes());
        frame.extend_from_slice(src_mac.bytes());
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);

        self.transmit.inc();

        match self.dev.send(&frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("phys: transmit error: {e}");
                false
            }
        }
    }

    /// Stop the ingress task and wait for it.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(th) = self.thread.lock().take() {
            let _ = th.join();
        }
    }
}

/// Frames carried over a UDP socket, for running the stack against a tunnel
/// endpoint instead of a real device.
pub struct UdpTunnelDevice {
    socket: UdpSocket,
    peer: SocketAddr,
    mtu: usize,
}

impl UdpTunnelDevice {
    pub fn new<A: ToSocketAddrs>(bind: A, peer: A, mtu: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        let peer = peer
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no peer address"))?;
        Ok(Self { socket, peer, mtu })
    }
}

impl Device for UdpTunnelDevice {
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.socket.set_read_timeout(Some(timeout))?;
        match self.socket.recv_from(buf) {
            Ok((n, _)) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send_to(frame, self.peer).map(|_| ())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

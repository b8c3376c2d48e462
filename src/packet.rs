//! The packet carrier handed between protocol engines.

use std::time::{Instant, SystemTime};

use crate::addr::Addr;

/// An immutable received packet.
///
/// Created once by the link layer and re-wrapped by each network layer with
/// the decoded addresses, the remaining payload window and the network header
/// as received. The header window is what ICMP quotes when it builds error
/// replies. The queue a packet sits in owns it; ownership transfers on
/// dequeue.
pub struct Packet {
    ts_mono: Instant,
    ts_wall: SystemTime,
    src_mac: Addr,
    dst_mac: Addr,
    src_addr: Addr,
    dst_addr: Addr,
    data: Vec<u8>,
    header: Vec<u8>,
}

impl Packet {
    /// Wrap a freshly received frame payload. The network addresses start out
    /// as the MAC addresses until a network layer decodes them.
    pub fn link(src_mac: Addr, dst_mac: Addr, data: Vec<u8>) -> Self {
        Self {
            ts_mono: Instant::now(),
            ts_wall: SystemTime::now(),
            src_mac,
            dst_mac,
            src_addr: src_mac,
            dst_addr: dst_mac,
            data,
            header: Vec::new(),
        }
    }

    /// Re-wrap after network-layer decode: same timestamps and MACs, decoded
    /// network addresses, payload window past the header, and the header
    /// itself retained for error-reply quoting.
    pub fn network(&self, src_addr: Addr, dst_addr: Addr, data: Vec<u8>, header: Vec<u8>) -> Self {
        Self {
            ts_mono: self.ts_mono,
            ts_wall: self.ts_wall,
            src_mac: self.src_mac,
            dst_mac: self.dst_mac,
            src_addr,
            dst_addr,
            data,
            header,
        }
    }

    pub fn recv_instant(&self) -> Instant {
        self.ts_mono
    }

    pub fn recv_time(&self) -> SystemTime {
        self.ts_wall
    }

    pub fn src_mac(&self) -> &Addr {
        &self.src_mac
    }

    pub fn dst_mac(&self) -> &Addr {
        &self.dst_mac
    }

    pub fn src_addr(&self) -> &Addr {
        &self.src_addr
    }

    pub fn dst_addr(&self) -> &Addr {
        &self.dst_addr
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The network header as received, empty at link stage.
    pub fn header(&self) -> &[u8] {
        &self.header
    }
}

//! Construction and lifecycle of the full protocol engine set.

use std::sync::Arc;

use log::info;

use crate::arp::Arp;
use crate::config::StackConfig;
use crate::handler::{PortHandler, UdpHandler};
use crate::icmp::Icmp;
use crate::icmp6::{Icmp6, Ndp};
use crate::ipv4::Ipv4;
use crate::ipv6::Ipv6;
use crate::net::{
    ErrorSink, NetTx, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6, IPPROTO_ICMP, IPPROTO_ICMPV6,
    IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP,
};
use crate::phys::{Device, Phys};
use crate::sctp::Sctp;
use crate::stats::Stats;
use crate::tcp::Tcp;
use crate::udp::Udp;

/// The assembled stack: one link device, both IP families, and the transport
/// engines wired to them.
///
/// Engines reference each other only through the registration seams
/// ([`NetTx`], [`ErrorSink`], ingress maps), with the downward (device-bound)
/// links weak, so the whole graph is torn down cleanly by [`Stack::shutdown`].
pub struct Stack {
    stats: Arc<Stats>,
    phys: Arc<Phys>,
    arp: Arc<Arp>,
    ipv4: Arc<Ipv4>,
    icmp: Arc<Icmp>,
    udp: Arc<Udp>,
    tcp: Arc<Tcp>,
    sctp: Arc<Sctp>,
    ndp: Arc<Ndp>,
    ipv6: Arc<Ipv6>,
    icmp6: Arc<Icmp6>,
    tcp6: Arc<Tcp>,
}

impl Stack {
    /// Wire every engine onto `dev` and start all tasks.
    pub fn new(cfg: &StackConfig, dev: Arc<dyn Device>) -> Self {
        let stats = Stats::new();

        let phys = Phys::new(dev, &stats);

        // IPv4 side.
        let arp = Arp::new(&stats, cfg.mac, cfg.ipv4);
        phys.register_protocol(ETHERTYPE_ARP, arp.clone());
        arp.register_phys(&phys);

        let ipv4 = Ipv4::new(&stats, arp.clone(), cfg.ipv4, cfg.mac);
        phys.register_protocol(ETHERTYPE_IPV4, ipv4.clone());
        ipv4.register_phys(&phys);
        let net4: Arc<dyn NetTx> = ipv4.clone();

        let icmp = Icmp::new(&stats);
        ipv4.register_protocol(IPPROTO_ICMP, icmp.clone());
        let sink4: Arc<dyn ErrorSink> = icmp.clone();
        ipv4.register_error_sink(sink4.clone());
        icmp.register_net(&net4);

        let tcp = Tcp::new(&stats, cfg.tcp_window);
        ipv4.register_protocol(IPPROTO_TCP, tcp.clone());
        tcp.register_net(&net4);

        let udp = Udp::new(&stats);
        ipv4.register_protocol(IPPROTO_UDP, udp.clone());
        udp.register_net(&net4);
        udp.register_error_sink(sink4);

        let sctp = Sctp::new(&stats);
        ipv4.register_protocol(IPPROTO_SCTP, sctp.clone());
        sctp.register_net(&net4);

        // IPv6 side.
        let ndp = Ndp::new(&stats, cfg.mac, cfg.ipv6);

        let ipv6 = Ipv6::new(&stats, ndp.clone(), cfg.ipv6, cfg.mac);
        phys.register_protocol(ETHERTYPE_IPV6, ipv6.clone());
        ipv6.register_phys(&phys);
        let net6: Arc<dyn NetTx> = ipv6.clone();
        ndp.register_net(&net6);

        let icmp6 = Icmp6::new(&stats, ndp.clone(), cfg.ipv6);
        ipv6.register_protocol(IPPROTO_ICMPV6, icmp6.clone());
        let sink6: Arc<dyn ErrorSink> = icmp6.clone();
        ipv6.register_error_sink(sink6);
        icmp6.register_net(&net6);

        let tcp6 = Tcp::new(&stats, cfg.tcp_window);
        ipv6.register_protocol(IPPROTO_TCP, tcp6.clone());
        tcp6.register_net(&net6);

        arp.start();
        ndp.start();
        ipv4.start();
        ipv6.start();
        icmp.start();
        icmp6.start();
        udp.start();
        tcp.start();
        tcp6.start();
        sctp.start();
        phys.start();

        info!(
            "stack up: mac {}, ipv4 {}, ipv6 {}",
            cfg.mac, cfg.ipv4, cfg.ipv6
        );

        Self {
            stats,
            phys,
            arp,
            ipv4,
            icmp,
            udp,
            tcp,
            sctp,
            ndp,
            ipv6,
            icmp6,
            tcp6,
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Register a TCP listener on an IPv4 port.
    pub fn add_tcp_handler(&self, port: u16, handler: PortHandler) {
        self.tcp.add_handler(port, handler);
    }

    /// Register a TCP listener on an IPv6 port.
    pub fn add_tcp6_handler(&self, port: u16, handler: PortHandler) {
        self.tcp6.add_handler(port, handler);
    }

    /// Register a UDP datagram handler.
    pub fn add_udp_handler(&self, port: u16, handler: UdpHandler) {
        self.udp.add_handler(port, handler);
    }

    /// Register an SCTP listener.
    pub fn add_sctp_handler(&self, port: u16, handler: PortHandler) {
        self.sctp.add_handler(port, handler);
    }

    pub fn udp(&self) -> &Arc<Udp> {
        &self.udp
    }

    /// Stop everything: ingress first, then the network layers, then the
    /// transports (which close their live sessions and release handler
    /// state).
    pub fn shutdown(&self) {
        info!("stack shutting down");
        self.phys.stop();
        self.ipv4.stop();
        self.ipv6.stop();
        self.arp.stop();
        self.ndp.stop();
        self.icmp.stop();
        self.icmp6.stop();
        self.udp.stop();
        self.tcp.shutdown();
        self.tcp6.shutdown();
        self.sctp.shutdown();
    }
}

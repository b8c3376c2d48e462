//! Stack configuration surface.

use crate::addr::Addr;

/// Addresses and sizing the stack is brought up with.
///
/// Parsing a configuration file into this struct is the embedder's job; the
/// stack only consumes the result.
#[derive(Clone, Debug)]
pub struct StackConfig {
    /// Local MAC address, stamped on every outbound frame.
    pub mac: Addr,
    /// Local IPv4 address.
    pub ipv4: Addr,
    /// Local IPv6 address.
    pub ipv6: Addr,
    /// Link MTU; upper layers size segments from this.
    pub mtu: usize,
    /// Advertised TCP receive window.
    pub tcp_window: u16,
    /// Upstream NTP server handed to a time handler, when one is bound.
    pub ntp_upstream: Option<Addr>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mac: "52:34:84:16:44:22".parse().unwrap(),
            ipv4: "192.168.3.2".parse().unwrap(),
            ipv6: "2001:980:c324:4242:f588:20f4:4d4e:7c2d".parse().unwrap(),
            mtu: 1500,
            tcp_window: 16384,
            ntp_upstream: None,
        }
    }
}

//! Link- and network-layer addresses.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::StackError;

/// A layer-2 or layer-3 address, tagged with its family.
///
/// Comparison, ordering and hashing are structural, so an `Addr` can key a
/// cache or session map directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Addr {
    /// 48-bit Ethernet MAC address
    Mac([u8; 6]),
    /// IPv4 address
    Ipv4([u8; 4]),
    /// IPv6 address
    Ipv6([u8; 16]),
}

/// Ethernet broadcast address.
pub const MAC_BROADCAST: Addr = Addr::Mac([0xff; 6]);

impl Addr {
    /// Raw address bytes in network order.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Addr::Mac(b) => b,
            Addr::Ipv4(b) => b,
            Addr::Ipv6(b) => b,
        }
    }

    /// Address length in bytes (6, 4 or 16).
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// True for the IPv4 and IPv6 variants.
    pub fn is_ip(&self) -> bool {
        matches!(self, Addr::Ipv4(_) | Addr::Ipv6(_))
    }

    /// True for an IPv6 multicast address (ff00::/8).
    pub fn is_ipv6_multicast(&self) -> bool {
        matches!(self, Addr::Ipv6(b) if b[0] == 0xff)
    }

    /// Solicited-node multicast address for an IPv6 unicast address
    /// (ff02::1:ffXX:XXXX with the low 24 bits of the unicast address).
    pub fn solicited_node_multicast(&self) -> Option<Addr> {
        match self {
            Addr::Ipv6(b) => {
                let mut m = [0u8; 16];
                m[0] = 0xff;
                m[1] = 0x02;
                m[11] = 0x01;
                m[12] = 0xff;
                m[13] = b[13];
                m[14] = b[14];
                m[15] = b[15];
                Some(Addr::Ipv6(m))
            }
            _ => None,
        }
    }

    /// Ethernet multicast MAC that carries traffic for an IPv6 multicast
    /// address (33:33 followed by the low 32 bits).
    pub fn ipv6_multicast_mac(&self) -> Option<Addr> {
        match self {
            Addr::Ipv6(b) => Some(Addr::Mac([0x33, 0x33, b[12], b[13], b[14], b[15]])),
            _ => None,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Mac(b) => write!(
                f,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            Addr::Ipv4(b) => write!(f, "{}", Ipv4Addr::from(*b)),
            Addr::Ipv6(b) => write!(f, "{}", Ipv6Addr::from(*b)),
        }
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<Ipv4Addr> for Addr {
    fn from(a: Ipv4Addr) -> Self {
        Addr::Ipv4(a.octets())
    }
}

impl From<Ipv6Addr> for Addr {
    fn from(a: Ipv6Addr) -> Self {
        Addr::Ipv6(a.octets())
    }
}

impl FromStr for Addr {
    type Err = StackError;

    /// Parse `aa:bb:cc:dd:ee:ff` (MAC), dotted-quad IPv4 or textual IPv6.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let colon_groups = s.split(':').count();
        if colon_groups == 6 && s.len() == 17 {
            let mut mac = [0u8; 6];
            for (i, part) in s.split(':').enumerate() {
                mac[i] = u8::from_str_radix(part, 16)
                    .map_err(|_| StackError::BadAddress(s.to_string()))?;
            }
            return Ok(Addr::Mac(mac));
        }
        if let Ok(v4) = s.parse::<Ipv4Addr>() {
            return Ok(v4.into());
        }
        if let Ok(v6) = s.parse::<Ipv6Addr>() {
            return Ok(v6.into());
        }
        Err(StackError::BadAddress(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render() {
        let mac: Addr = "52:34:84:16:44:22".parse().unwrap();
        assert_eq!(mac, Addr::Mac([0x52, 0x34, 0x84, 0x16, 0x44, 0x22]));
        assert_eq!(mac.to_string(), "52:34:84:16:44:22");

        let ip: Addr = "192.168.3.2".parse().unwrap();
        assert_eq!(ip, Addr::Ipv4([192, 168, 3, 2]));
        assert_eq!(ip.to_string(), "192.168.3.2");

        let ip6: Addr = "2001:980:c324:4242::1".parse().unwrap();
        assert_eq!(ip6.len(), 16);
        assert!("not-an-address".parse::<Addr>().is_err());
    }

    #[test]
    fn solicited_node_multicast() {
        let ip6: Addr = "2001:980:c324:4242:f588:20f4:4d4e:7c2d".parse().unwrap();
        let sn = ip6.solicited_node_multicast().unwrap();
        assert_eq!(sn.to_string(), "ff02::1:ff4e:7c2d");
        assert_eq!(
            sn.ipv6_multicast_mac().unwrap(),
            Addr::Mac([0x33, 0x33, 0xff, 0x4e, 0x7c, 0x2d])
        );
    }
}

use std::time::Duration;

use ipstack::net::{internet_checksum, l4_checksum};
use ipstack::queue::PktQueue;
use ipstack::session::{murmur64a, session_hash};
use ipstack::Addr;

#[test]
fn addr_parse_roundtrip() {
    let mac: Addr = "52:34:84:16:44:22".parse().unwrap();
    assert_eq!(mac.to_string(), "52:34:84:16:44:22");
    assert_eq!(mac.len(), 6);

    let ip: Addr = "192.168.3.2".parse().unwrap();
    assert_eq!(ip.to_string(), "192.168.3.2");
    assert!(ip.is_ip());

    let ip6: Addr = "2001:980:c324:4242:f588:20f4:4d4e:7c2d".parse().unwrap();
    assert_eq!(ip6.to_string(), "2001:980:c324:4242:f588:20f4:4d4e:7c2d");
}

#[test]
fn ipv4_header_checksum_verifies_to_zero() {
    // A header checksummed by the stack must verify as zero over its full
    // length, per RFC 1071.
    let mut hdr = vec![
        0x45, 0x00, 0x00, 0x3c, 0x00, 0x00, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
        0x03, 0x01, 0xc0, 0xa8, 0x03, 0x02,
    ];
    let csum = internet_checksum(&hdr);
    hdr[10] = (csum >> 8) as u8;
    hdr[11] = csum as u8;
    assert_eq!(internet_checksum(&hdr), 0);
}

#[test]
fn pseudo_header_checksum_differs_by_family() {
    let v4a: Addr = "10.0.0.1".parse().unwrap();
    let v4b: Addr = "10.0.0.2".parse().unwrap();
    let v6a: Addr = "fe80::1".parse().unwrap();
    let v6b: Addr = "fe80::2".parse().unwrap();

    let payload = b"payload";
    let c4 = l4_checksum(&v4a, &v4b, 17, payload);
    let c6 = l4_checksum(&v6a, &v6b, 17, payload);
    assert_ne!(c4, 0);
    assert_ne!(c6, 0);
    assert_ne!(c4, c6);
}

#[test]
fn session_hash_is_stable_and_tuple_sensitive() {
    let peer: Addr = "192.168.3.1".parse().unwrap();
    let h = session_hash(&peer, 40000, 80);
    assert_eq!(h, session_hash(&peer, 40000, 80));
    assert_ne!(h, session_hash(&peer, 40001, 80));
    assert_ne!(h, session_hash(&peer, 40000, 81));
}

#[test]
fn murmur_is_deterministic() {
    assert_eq!(murmur64a(b"flow", 123), murmur64a(b"flow", 123));
    assert_ne!(murmur64a(b"flow", 123), murmur64a(b"flow", 124));
}

#[test]
fn queue_transfers_ownership_in_order() {
    let q: PktQueue<Vec<u8>> = PktQueue::new(8);
    assert!(q.push(vec![1]));
    assert!(q.push(vec![2]));
    assert_eq!(q.pop(Duration::from_millis(10)), Some(vec![1]));
    assert_eq!(q.pop(Duration::from_millis(10)), Some(vec![2]));
    assert_eq!(q.pop(Duration::from_millis(10)), None);
}

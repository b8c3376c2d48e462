//! End-to-end scenarios driven through an in-memory device: frames go in,
//! frames come out, handler callbacks are observed.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use ipstack::net::{internet_checksum, l4_checksum};
use ipstack::phys::Device;
use ipstack::{PortHandler, Stack, StackConfig};

const MY_MAC: [u8; 6] = [0x52, 0x34, 0x84, 0x16, 0x44, 0x22];
const MY_IP: [u8; 4] = [192, 168, 3, 2];
const PEER_MAC: [u8; 6] = [0x52, 0x34, 0x84, 0x00, 0x00, 0x01];
const PEER_IP: [u8; 4] = [192, 168, 3, 1];

// 2001:980:c324:4242:f588:20f4:4d4e:7c2d and a peer on the same segment.
const MY_IP6: [u8; 16] = [
    0x20, 0x01, 0x09, 0x80, 0xc3, 0x24, 0x42, 0x42, 0xf5, 0x88, 0x20, 0xf4, 0x4d, 0x4e, 0x7c,
    0x2d,
];
const PEER_IP6: [u8; 16] = [
    0x20, 0x01, 0x09, 0x80, 0xc3, 0x24, 0x42, 0x42, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x01,
];

const WAIT: Duration = Duration::from_secs(2);

struct TestDevice {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    in_cond: Condvar,
    outbound: Mutex<Vec<Vec<u8>>>,
    out_cond: Condvar,
}

impl TestDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(VecDeque::new()),
            in_cond: Condvar::new(),
            outbound: Mutex::new(Vec::new()),
            out_cond: Condvar::new(),
        })
    }

    fn inject(&self, frame: Vec<u8>) {
        self.inbound.lock().push_back(frame);
        self.in_cond.notify_one();
    }

    /// Wait until at least `n` transmitted frames match `pred`; returns all
    /// matches seen so far.
    fn wait_matching(
        &self,
        n: usize,
        timeout: Duration,
        pred: impl Fn(&[u8]) -> bool,
    ) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = self.outbound.lock();
        loop {
            let matches: Vec<Vec<u8>> =
                out.iter().filter(|f| pred(f)).cloned().collect();
            if matches.len() >= n {
                return matches;
            }
            if self.out_cond.wait_until(&mut out, deadline).timed_out() {
                return matches;
            }
        }
    }

    fn expect_frame(&self, pred: impl Fn(&[u8]) -> bool) -> Vec<u8> {
        self.wait_matching(1, WAIT, pred)
            .pop()
            .expect("expected frame was not transmitted")
    }
}

impl Device for TestDevice {
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut q = self.inbound.lock();
        if q.is_empty() {
            self.in_cond.wait_for(&mut q, timeout);
        }
        match q.pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            None => Ok(0),
        }
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.outbound.lock().push(frame.to_vec());
        self.out_cond.notify_all();
        Ok(())
    }

    fn mtu(&self) -> usize {
        1500
    }
}

struct TestNet {
    dev: Arc<TestDevice>,
    stack: Stack,
}

impl TestNet {
    fn new() -> Self {
        let dev = TestDevice::new();
        let stack = Stack::new(&StackConfig::default(), dev.clone());
        Self { dev, stack }
    }
}

// ---- frame builders ----

fn eth_frame(dst: &[u8; 6], src: &[u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(14 + payload.len());
    f.extend_from_slice(dst);
    f.extend_from_slice(src);
    f.extend_from_slice(&ethertype.to_be_bytes());
    f.extend_from_slice(payload);
    f
}

fn ipv4_frame(proto: u8, ttl: u8, ident: u16, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut h = Vec::with_capacity(total);
    h.push(0x45);
    h.push(0);
    h.extend_from_slice(&(total as u16).to_be_bytes());
    h.extend_from_slice(&ident.to_be_bytes());
    h.extend_from_slice(&[0, 0]);
    h.push(ttl);
    h.push(proto);
    h.extend_from_slice(&[0, 0]);
    h.extend_from_slice(&PEER_IP);
    h.extend_from_slice(&MY_IP);
    let csum = internet_checksum(&h);
    h[10] = (csum >> 8) as u8;
    h[11] = csum as u8;
    h.extend_from_slice(payload);
    eth_frame(&MY_MAC, &PEER_MAC, 0x0800, &h)
}

fn ipv6_frame(next_header: u8, hop_limit: u8, payload: &[u8]) -> Vec<u8> {
    let mut h = Vec::with_capacity(40 + payload.len());
    h.extend_from_slice(&[0x60, 0, 0, 0]);
    h.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    h.push(next_header);
    h.push(hop_limit);
    h.extend_from_slice(&PEER_IP6);
    h.extend_from_slice(&MY_IP6);
    h.extend_from_slice(payload);
    eth_frame(&MY_MAC, &PEER_MAC, 0x86dd, &h)
}

fn tcp_frame(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut seg = Vec::with_capacity(20 + payload.len());
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push(5 << 4);
    seg.push(flags);
    seg.extend_from_slice(&8192u16.to_be_bytes());
    seg.extend_from_slice(&[0, 0, 0, 0]);
    seg.extend_from_slice(payload);

    let src: ipstack::Addr = "192.168.3.1".parse().unwrap();
    let dst: ipstack::Addr = "192.168.3.2".parse().unwrap();
    let csum = l4_checksum(&src, &dst, 6, &seg);
    seg[16] = (csum >> 8) as u8;
    seg[17] = csum as u8;

    ipv4_frame(6, 64, 0, &seg)
}

const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const PSH: u8 = 0x08;
const ACK: u8 = 0x10;

// ---- frame inspection ----

fn ethertype(f: &[u8]) -> u16 {
    u16::from_be_bytes([f[12], f[13]])
}

fn ip_proto(f: &[u8]) -> Option<u8> {
    (ethertype(f) == 0x0800 && f.len() >= 34).then(|| f[23])
}

fn ip_ident(f: &[u8]) -> u16 {
    u16::from_be_bytes([f[18], f[19]])
}

fn ip_payload(f: &[u8]) -> &[u8] {
    let ihl = usize::from(f[14] & 0x0f) * 4;
    let total = usize::from(u16::from_be_bytes([f[16], f[17]]));
    &f[14 + ihl..14 + total]
}

/// ICMPv6 type byte of a transmitted frame, if it is ICMPv6.
fn icmp6_type(f: &[u8]) -> Option<u8> {
    (ethertype(f) == 0x86dd && f.len() >= 55 && f[20] == 58).then(|| f[54])
}

/// TCP header and payload of a transmitted frame, if it is TCP.
fn tcp_seg(f: &[u8]) -> Option<(&[u8], &[u8])> {
    if ip_proto(f) != Some(6) {
        return None;
    }
    let p = ip_payload(f);
    let off = usize::from(p[12] >> 4) * 4;
    Some((&p[..off], &p[off..]))
}

fn tcp_flags(hdr: &[u8]) -> u8 {
    hdr[13]
}

fn tcp_seq(hdr: &[u8]) -> u32 {
    u32::from_be_bytes(hdr[4..8].try_into().unwrap())
}

fn tcp_ack(hdr: &[u8]) -> u32 {
    u32::from_be_bytes(hdr[8..12].try_into().unwrap())
}

// ---- scenarios ----

#[test]
fn arp_who_has_local_address() {
    let net = TestNet::new();

    let mut arp = Vec::new();
    arp.extend_from_slice(&1u16.to_be_bytes());
    arp.extend_from_slice(&0x0800u16.to_be_bytes());
    arp.push(6);
    arp.push(4);
    arp.extend_from_slice(&1u16.to_be_bytes()); // request
    arp.extend_from_slice(&PEER_MAC);
    arp.extend_from_slice(&PEER_IP);
    arp.extend_from_slice(&[0; 6]);
    arp.extend_from_slice(&MY_IP);
    net.dev
        .inject(eth_frame(&[0xff; 6], &PEER_MAC, 0x0806, &arp));

    let reply = net.dev.expect_frame(|f| {
        ethertype(f) == 0x0806 && u16::from_be_bytes([f[20], f[21]]) == 2
    });

    assert_eq!(&reply[0..6], &PEER_MAC, "addressed to the requester");
    assert_eq!(&reply[22..28], &MY_MAC, "sender hardware address");
    assert_eq!(&reply[28..32], &MY_IP, "sender protocol address");
    assert_eq!(&reply[32..38], &PEER_MAC, "target hardware address");
    assert_eq!(&reply[38..42], &PEER_IP, "target protocol address");

    net.stack.shutdown();
}

#[test]
fn ping_echoes_payload_and_steps_identification() {
    let net = TestNet::new();

    let mut echo = vec![8, 0, 0, 0, 0xbe, 0xef, 0, 1];
    echo.extend_from_slice(b"hello");
    let csum = internet_checksum(&echo);
    echo[2] = (csum >> 8) as u8;
    echo[3] = csum as u8;
    net.dev.inject(ipv4_frame(1, 64, 0x1234, &echo));

    let reply = net
        .dev
        .expect_frame(|f| ip_proto(f) == Some(1) && ip_payload(f)[0] == 0);

    let icmp = ip_payload(&reply);
    assert_eq!(icmp[0], 0, "echo reply");
    assert_eq!(&icmp[4..6], &[0xbe, 0xef], "identifier");
    assert_eq!(&icmp[6..8], &[0, 1], "sequence");
    assert_eq!(&icmp[8..], b"hello", "payload verbatim");
    assert_eq!(internet_checksum(icmp), 0, "valid checksum");
    assert_eq!(ip_ident(&reply), 0x1235, "identification stepped by one");

    net.stack.shutdown();
}

#[test]
fn tcp_connect_and_deliver() {
    let net = TestNet::new();

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let ev1 = events.clone();
    let ev2 = events.clone();
    net.stack.add_tcp_handler(
        80,
        PortHandler::new(
            move |_s| {
                ev1.lock().push("open".into());
                true
            },
            move |_s, data| {
                ev2.lock().push(String::from_utf8_lossy(data).into_owned());
                true
            },
        ),
    );

    net.dev.inject(tcp_frame(40000, 80, 1000, 0, SYN, &[]));

    let syn_ack = net.dev.expect_frame(|f| {
        tcp_seg(f).is_some_and(|(h, _)| tcp_flags(h) & (SYN | ACK) == (SYN | ACK))
    });
    let (h, _) = tcp_seg(&syn_ack).unwrap();
    assert_eq!(tcp_ack(h), 1001, "syn-ack acknowledges the syn");
    let server_isn = tcp_seq(h);

    net.dev
        .inject(tcp_frame(40000, 80, 1001, server_isn.wrapping_add(1), ACK, &[]));
    net.dev.inject(tcp_frame(
        40000,
        80,
        1001,
        server_isn.wrapping_add(1),
        PSH | ACK,
        b"hello",
    ));

    let ack = net.dev.expect_frame(|f| {
        tcp_seg(f).is_some_and(|(h, p)| tcp_flags(h) == ACK && p.is_empty() && tcp_ack(h) == 1006)
    });
    let (h, _) = tcp_seg(&ack).unwrap();
    assert_eq!(tcp_ack(h), 1006, "five bytes acknowledged");

    // new_session exactly once, before the data.
    let ev = events.lock().clone();
    assert_eq!(ev, vec!["open".to_string(), "hello".to_string()]);

    net.stack.shutdown();
}

#[test]
fn tcp_syn_to_closed_port_is_reset() {
    let net = TestNet::new();

    net.dev.inject(tcp_frame(40001, 7777, 555, 0, SYN, &[]));

    let rst = net
        .dev
        .expect_frame(|f| tcp_seg(f).is_some_and(|(h, _)| tcp_flags(h) & RST != 0));
    let (h, _) = tcp_seg(&rst).unwrap();
    assert_eq!(tcp_ack(h), 556, "reset acknowledges the syn");

    net.stack.shutdown();
}

#[test]
fn tcp_unacked_data_is_retransmitted() {
    let net = TestNet::new();

    net.stack.add_tcp_handler(
        80,
        PortHandler::new(
            |_s| true,
            |s, _data| s.send_data(&[b'X'; 1000]),
        ),
    );

    net.dev.inject(tcp_frame(40002, 80, 2000, 0, SYN, &[]));
    let syn_ack = net.dev.expect_frame(|f| {
        tcp_seg(f).is_some_and(|(h, _)| tcp_flags(h) & (SYN | ACK) == (SYN | ACK))
    });
    let (h, _) = tcp_seg(&syn_ack).unwrap();
    let server_isn = tcp_seq(h);

    net.dev
        .inject(tcp_frame(40002, 80, 2001, server_isn.wrapping_add(1), ACK, &[]));
    net.dev.inject(tcp_frame(
        40002,
        80,
        2001,
        server_isn.wrapping_add(1),
        PSH | ACK,
        b"go",
    ));

    // The handler sent 1000 bytes; the peer never acknowledges. The same
    // sequence number must appear again.
    let data_seq = server_isn.wrapping_add(1);
    let copies = net.dev.wait_matching(2, WAIT, |f| {
        tcp_seg(f).is_some_and(|(h, p)| p.len() == 1000 && tcp_seq(h) == data_seq)
    });
    assert!(
        copies.len() >= 2,
        "segment retransmitted with the original sequence number"
    );

    net.stack.shutdown();
}

#[test]
fn tcp_rst_runs_close_callbacks_once() {
    let net = TestNet::new();

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let ev1 = events.clone();
    let mut handler = PortHandler::new(
        move |_s| {
            ev1.lock().push("open");
            true
        },
        |_s, _d| true,
    );
    let ev2 = events.clone();
    handler.session_closed_1 = Some(Box::new(move |_s| ev2.lock().push("closing")));
    let ev3 = events.clone();
    handler.session_closed_2 = Some(Box::new(move |_s| ev3.lock().push("closed")));
    net.stack.add_tcp_handler(81, handler);

    net.dev.inject(tcp_frame(40003, 81, 3000, 0, SYN, &[]));
    let syn_ack = net.dev.expect_frame(|f| {
        tcp_seg(f).is_some_and(|(h, _)| tcp_flags(h) & (SYN | ACK) == (SYN | ACK))
    });
    let (h, _) = tcp_seg(&syn_ack).unwrap();
    net.dev
        .inject(tcp_frame(40003, 81, 3001, tcp_seq(h).wrapping_add(1), ACK, &[]));
    net.dev
        .inject(tcp_frame(40003, 81, 3001, tcp_seq(h).wrapping_add(1), RST, &[]));

    let deadline = Instant::now() + WAIT;
    while events.lock().len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(*events.lock(), vec!["open", "closing", "closed"]);

    net.stack.shutdown();
}

#[test]
fn ttl_exceeded_quotes_original_packet() {
    let net = TestNet::new();

    let mut udp = Vec::new();
    udp.extend_from_slice(&4444u16.to_be_bytes());
    udp.extend_from_slice(&9999u16.to_be_bytes());
    udp.extend_from_slice(&16u16.to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(b"datadata");
    let frame = ipv4_frame(17, 1, 0x0077, &udp);
    let original_ip_header = frame[14..34].to_vec();
    net.dev.inject(frame);

    let err = net
        .dev
        .expect_frame(|f| ip_proto(f) == Some(1) && ip_payload(f)[0] == 11);

    let icmp = ip_payload(&err);
    assert_eq!(icmp[0], 11, "time exceeded");
    assert_eq!(icmp[1], 0, "code 0");
    assert_eq!(&icmp[8..28], &original_ip_header[..], "quoted header");
    assert_eq!(&icmp[28..36], &udp[..8], "first eight payload bytes");

    net.stack.shutdown();
}

#[test]
fn unknown_protocol_with_low_ttl_is_dropped_silently() {
    let net = TestNet::new();

    // Unregistered IP protocol with TTL 1: dropped as unknown-protocol, no
    // error reply.
    net.dev.inject(ipv4_frame(200, 1, 0x0088, b"opaque"));

    // A registered protocol with TTL 1 still draws Time Exceeded. Both
    // packets traverse the same queue, so once this reply is out the first
    // packet has been fully handled.
    let mut udp = Vec::new();
    udp.extend_from_slice(&4444u16.to_be_bytes());
    udp.extend_from_slice(&9999u16.to_be_bytes());
    udp.extend_from_slice(&12u16.to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(b"ping");
    net.dev.inject(ipv4_frame(17, 1, 0x0099, &udp));

    let err = net
        .dev
        .expect_frame(|f| ip_proto(f) == Some(1) && ip_payload(f)[0] == 11);
    let icmp = ip_payload(&err);
    assert_eq!(icmp[8 + 9], 17, "quoted packet is the registered-protocol one");
    assert_eq!(&icmp[12..14], &0x0099u16.to_be_bytes(), "quoted identification");

    let errors = net.dev.wait_matching(2, Duration::from_millis(400), |f| {
        ip_proto(f) == Some(1) && ip_payload(f)[0] == 11
    });
    assert_eq!(errors.len(), 1, "no reply for the unknown-protocol packet");

    net.stack.shutdown();
}

#[test]
fn unknown_next_header_with_low_hop_limit_is_dropped_silently() {
    let net = TestNet::new();

    // Unregistered next header with hop limit 1: dropped, no ICMPv6 reply.
    net.dev.inject(ipv6_frame(200, 1, b"opaque"));

    // TCP is registered on the v6 side, so hop limit 1 there still draws
    // Time Exceeded.
    net.dev.inject(ipv6_frame(6, 1, &[0u8; 20]));

    let err = net.dev.expect_frame(|f| icmp6_type(f) == Some(3));
    let msg = &err[54..];
    assert_eq!(msg[1], 0, "code 0");
    assert_eq!(msg[8 + 6], 6, "quoted packet is the registered-protocol one");

    let errors = net
        .dev
        .wait_matching(2, Duration::from_millis(400), |f| icmp6_type(f) == Some(3));
    assert_eq!(errors.len(), 1, "no reply for the unknown-next-header packet");

    net.stack.shutdown();
}

#[test]
fn udp_to_closed_port_is_unreachable() {
    let net = TestNet::new();

    let mut udp = Vec::new();
    udp.extend_from_slice(&4444u16.to_be_bytes());
    udp.extend_from_slice(&9998u16.to_be_bytes());
    udp.extend_from_slice(&12u16.to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(b"ping");
    net.dev.inject(ipv4_frame(17, 64, 0, &udp));

    let err = net
        .dev
        .expect_frame(|f| ip_proto(f) == Some(1) && ip_payload(f)[0] == 3);
    let icmp = ip_payload(&err);
    assert_eq!(icmp[1], 3, "port unreachable");

    net.stack.shutdown();
}

#[test]
fn udp_handler_receives_datagram() {
    let net = TestNet::new();

    let got: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = got.clone();
    net.stack.add_udp_handler(
        123,
        Box::new(move |_src, src_port, _dst, dst_port, payload| {
            assert_eq!(src_port, 4444);
            assert_eq!(dst_port, 123);
            sink.lock().push(payload.to_vec());
        }),
    );

    let mut udp = Vec::new();
    udp.extend_from_slice(&4444u16.to_be_bytes());
    udp.extend_from_slice(&123u16.to_be_bytes());
    udp.extend_from_slice(&12u16.to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(b"time");
    net.dev.inject(ipv4_frame(17, 64, 0, &udp));

    let deadline = Instant::now() + WAIT;
    while got.lock().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(got.lock().as_slice(), &[b"time".to_vec()]);

    net.stack.shutdown();
}

// ---- SCTP ----

fn crc32c(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0x82f6_3b78 & mask);
        }
    }
    !crc
}

fn sctp_packet(src_port: u16, dst_port: u16, vtag: u32, chunks: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(12 + chunks.len());
    p.extend_from_slice(&src_port.to_be_bytes());
    p.extend_from_slice(&dst_port.to_be_bytes());
    p.extend_from_slice(&vtag.to_be_bytes());
    p.extend_from_slice(&[0, 0, 0, 0]);
    p.extend_from_slice(chunks);
    let crc = crc32c(&p);
    p[8..12].copy_from_slice(&crc.to_le_bytes());
    ipv4_frame(132, 64, 0, &p)
}

fn sctp_chunk(chunk_type: u8, flags: u8, value: &[u8]) -> Vec<u8> {
    let mut c = Vec::with_capacity(4 + value.len());
    c.push(chunk_type);
    c.push(flags);
    c.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    c.extend_from_slice(value);
    while c.len() % 4 != 0 {
        c.push(0);
    }
    c
}

#[test]
fn sctp_cookie_handshake_creates_one_session() {
    let net = TestNet::new();

    let sessions = Arc::new(Mutex::new(0u32));
    let count = sessions.clone();
    net.stack.add_sctp_handler(
        9,
        PortHandler::new(
            move |_s| {
                *count.lock() += 1;
                true
            },
            |_s, _d| true,
        ),
    );

    let mut init = Vec::new();
    init.extend_from_slice(&0x0000_000au32.to_be_bytes()); // initiate tag
    init.extend_from_slice(&1500u32.to_be_bytes()); // a_rwnd
    init.extend_from_slice(&1u16.to_be_bytes());
    init.extend_from_slice(&1u16.to_be_bytes());
    init.extend_from_slice(&100u32.to_be_bytes()); // initial tsn
    net.dev
        .inject(sctp_packet(5000, 9, 0, &sctp_chunk(1, 0, &init)));

    let init_ack = net.dev.expect_frame(|f| {
        ip_proto(f) == Some(132) && {
            let p = ip_payload(f);
            p.len() > 12 && p[12] == 2
        }
    });

    let p = ip_payload(&init_ack);
    assert_eq!(
        u32::from_be_bytes(p[4..8].try_into().unwrap()),
        0x0000_000a,
        "init-ack carries our initiate tag"
    );
    let value = &p[16..];
    let my_vtag = u32::from_be_bytes(value[0..4].try_into().unwrap());

    // Walk the parameters for the state cookie (type 7).
    let mut params = &value[16..];
    let mut cookie = None;
    while params.len() >= 4 {
        let ptype = u16::from_be_bytes([params[0], params[1]]);
        let plen = usize::from(u16::from_be_bytes([params[2], params[3]]));
        if ptype == 7 {
            cookie = Some(params[4..plen].to_vec());
            break;
        }
        params = &params[(plen + 3) & !3..];
    }
    let cookie = cookie.expect("init-ack must carry a state cookie");

    net.dev
        .inject(sctp_packet(5000, 9, my_vtag, &sctp_chunk(10, 0, &cookie)));

    net.dev.expect_frame(|f| {
        ip_proto(f) == Some(132) && {
            let p = ip_payload(f);
            p.len() > 12 && p[12] == 11
        }
    });
    assert_eq!(*sessions.lock(), 1, "exactly one new_session");

    // DATA is delivered and selectively acknowledged.
    let mut data = Vec::new();
    data.extend_from_slice(&101u32.to_be_bytes()); // tsn
    data.extend_from_slice(&[0, 0, 0, 0]); // stream, ssn
    data.extend_from_slice(&[0, 0, 0, 0]); // ppid
    data.extend_from_slice(b"sctp!");
    net.dev
        .inject(sctp_packet(5000, 9, my_vtag, &sctp_chunk(0, 0x03, &data)));

    let sack = net.dev.expect_frame(|f| {
        ip_proto(f) == Some(132) && {
            let p = ip_payload(f);
            p.len() > 12 && p[12] == 3
        }
    });
    let sp = ip_payload(&sack);
    assert_eq!(
        u32::from_be_bytes(sp[16..20].try_into().unwrap()),
        101,
        "sack acknowledges the received tsn"
    );

    net.stack.shutdown();
}

#[test]
fn sctp_wrong_verification_tag_aborts() {
    let net = TestNet::new();

    let sessions = Arc::new(Mutex::new(0u32));
    let count = sessions.clone();
    net.stack.add_sctp_handler(
        19,
        PortHandler::new(
            move |_s| {
                *count.lock() += 1;
                true
            },
            |_s, _d| true,
        ),
    );

    // No association at all: any non-INIT chunk draws an ABORT.
    let mut hb = Vec::new();
    hb.extend_from_slice(&1u16.to_be_bytes()); // heartbeat info param
    hb.extend_from_slice(&8u16.to_be_bytes());
    hb.extend_from_slice(&[1, 2, 3, 4]);
    net.dev
        .inject(sctp_packet(5001, 19, 0xdddd, &sctp_chunk(4, 0, &hb)));

    let abort = net.dev.expect_frame(|f| {
        ip_proto(f) == Some(132) && {
            let p = ip_payload(f);
            p.len() > 12 && p[12] == 6
        }
    });
    assert!(!abort.is_empty());
    assert_eq!(*sessions.lock(), 0);

    net.stack.shutdown();
}

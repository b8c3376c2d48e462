//! Demo daemon: brings the stack up on a TAP interface or UDP frame tunnel
//! and serves a TCP echo on port 7.

use std::io::BufRead;
use std::sync::Arc;

use ipstack::phys::{Device, UdpTunnelDevice};
use ipstack::tap::TapDevice;
use ipstack::{PortHandler, Stack, StackConfig};

fn usage() -> ! {
    eprintln!("usage: stackd tap <ifname>");
    eprintln!("       stackd udp <bind-addr:port> <peer-addr:port>");
    std::process::exit(1);
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let cfg = StackConfig::default();

    let dev: Arc<dyn Device> = match args.get(1).map(String::as_str) {
        Some("tap") => {
            let name = args.get(2).unwrap_or_else(|| usage());
            Arc::new(TapDevice::open(name, cfg.mtu)?)
        }
        Some("udp") => {
            let bind = args.get(2).unwrap_or_else(|| usage());
            let peer = args.get(3).unwrap_or_else(|| usage());
            Arc::new(UdpTunnelDevice::new(bind.as_str(), peer.as_str(), cfg.mtu)?)
        }
        _ => usage(),
    };

    let stack = Stack::new(&cfg, dev);

    let mut echo = PortHandler::new(
        |session| {
            eprintln!(
                "echo: new session from {}:{}",
                session.their_addr(),
                session.their_port()
            );
            true
        },
        |session, data| session.send_data(data),
    );
    echo.session_closed_2 = Some(Box::new(|session| {
        eprintln!("echo: session from {} closed", session.their_addr());
    }));
    stack.add_tcp_handler(7, echo);

    println!(
        "listening on {} / {} (mac {})",
        cfg.ipv4, cfg.ipv6, cfg.mac
    );
    println!("press enter to terminate");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    stack.shutdown();
    println!("{}", stack.stats().export());
    Ok(())
}

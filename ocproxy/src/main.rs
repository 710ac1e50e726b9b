//! `ocproxy` terminates a VPN tunnel's raw IP stream in user space and
//! exposes the VPN-visible services as local TCP listeners: static
//! port-forwards and a SOCKS5 endpoint. No tun device, no kernel routing,
//! no root.
//!
//! The VPN client hands us the tunnel as an inherited file descriptor
//! (`$VPNFD`) plus the usual `INTERNAL_IP4_*` environment.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod capture;
mod eventloop;
mod vpn;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use clap::Parser;
use l3_proxy::{Config, Proxy};
use rand::RngCore as _;
use tokio::net::{TcpListener, TcpSocket};
use tracing_subscriber::EnvFilter;

use crate::capture::PacketCapture;
use crate::eventloop::{Eventloop, Exit, ListenerSocket};
use crate::vpn::VpnEndpoint;

const LISTEN_BACKLOG: u32 = 5;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address assigned to us inside the tunnel.
    #[arg(long, env = "INTERNAL_IP4_ADDRESS")]
    ip: Ipv4Addr,

    /// Netmask of the tunnel network.
    #[arg(long, env = "INTERNAL_IP4_NETMASK")]
    netmask: Ipv4Addr,

    /// Tunnel-side gateway.
    #[arg(long, env = "VPNGATEWAY")]
    gw: Ipv4Addr,

    /// Tunnel MTU.
    #[arg(long, env = "INTERNAL_IP4_MTU")]
    mtu: u16,

    /// DNS server inside the VPN (first of a space-separated list).
    #[arg(long, env = "INTERNAL_IP4_DNS", value_parser = parse_dns, default_value = "8.8.8.8")]
    dns: Ipv4Addr,

    /// Bind a SOCKS5 listener on this port.
    #[arg(long, value_name = "PORT")]
    dynfw: Option<u16>,

    /// Static port-forward; may be repeated.
    #[arg(long, value_name = "LPORT:RHOST:RPORT", value_parser = parse_forward)]
    localfw: Vec<Forward>,

    /// TCP keepalive interval in seconds for tunnel-side connections.
    #[arg(long, value_name = "SECONDS")]
    keepalive: Option<u64>,

    /// Bind listeners on all interfaces instead of loopback only.
    #[arg(long)]
    allow_remote: bool,

    /// Engine debug logging.
    #[arg(long)]
    verbose: bool,

    /// Write all tunnel traffic to a pcap file.
    #[arg(long)]
    tcpdump: bool,
}

#[derive(Debug, Clone)]
struct Forward {
    lport: u16,
    rhost: String,
    rport: u16,
}

fn parse_forward(s: &str) -> Result<Forward, String> {
    let parts = s.splitn(3, ':').collect::<Vec<_>>();

    let [lport, rhost, rport] = parts[..] else {
        return Err("expected LPORT:RHOST:RPORT".to_owned());
    };

    if rhost.is_empty() {
        return Err("destination host must not be empty".to_owned());
    }

    Ok(Forward {
        lport: lport
            .parse()
            .map_err(|e| format!("bad local port `{lport}`: {e}"))?,
        rhost: rhost.to_owned(),
        rport: rport
            .parse()
            .map_err(|e| format!("bad destination port `{rport}`: {e}"))?,
    })
}

/// VPN clients export the DNS servers as one space-separated list; only the
/// first one is ours to use.
fn parse_dns(s: &str) -> Result<Ipv4Addr, String> {
    let first = s
        .split_whitespace()
        .next()
        .ok_or_else(|| "empty DNS server list".to_owned())?;

    first
        .parse()
        .map_err(|e| format!("bad DNS server `{first}`: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    // A dead local peer must surface as a write error, not kill the process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    anyhow::ensure!(
        usize::from(cli.mtu) <= ip_packet::PACKET_SIZE,
        "--mtu must be at most {}",
        ip_packet::PACKET_SIZE
    );
    anyhow::ensure!(
        cli.dynfw.is_some() || !cli.localfw.is_empty(),
        "nothing to do; pass --dynfw and/or --localfw"
    );

    let vpn = VpnEndpoint::from_env()?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create runtime")?
        .block_on(run(cli, vpn))
}

async fn run(cli: Cli, vpn: VpnEndpoint) -> Result<()> {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);

    let proxy = Proxy::new(
        Config {
            ip: cli.ip,
            netmask: cli.netmask,
            gateway: cli.gw,
            mtu: usize::from(cli.mtu),
            dns_server: cli.dns,
            keepalive: cli
                .keepalive
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs),
            max_connections: l3_proxy::DEFAULT_MAX_CONNECTIONS,
        },
        Instant::now(),
        seed,
    );

    let bind_ip = if cli.allow_remote {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::LOCALHOST
    };

    let mut listeners = Vec::new();

    if let Some(port) = cli.dynfw {
        listeners.push(ListenerSocket {
            socket: bind(bind_ip, port)?,
            spec: l3_proxy::Listener::Socks,
        });

        tracing::info!(%port, "SOCKS5 listener up");
    }

    for forward in &cli.localfw {
        listeners.push(ListenerSocket {
            socket: bind(bind_ip, forward.lport)?,
            spec: l3_proxy::Listener::Redir {
                host: forward.rhost.clone(),
                port: forward.rport,
            },
        });

        tracing::info!(
            port = %forward.lport,
            dest = %format_args!("{}:{}", forward.rhost, forward.rport),
            "Forward listener up"
        );
    }

    let capture = cli
        .tcpdump
        .then(|| {
            let path = PathBuf::from(format!("ocproxy-{}.pcap", std::process::id()));

            PacketCapture::create(&path)
        })
        .transpose()?;

    match Eventloop::new(vpn, proxy, listeners, capture)?.run().await? {
        Exit::VpnClosed => tracing::info!("Tunnel closed by peer; exiting"),
        Exit::VpnGone => tracing::info!("VPN client is gone; exiting"),
        Exit::Hangup => tracing::info!("Received SIGHUP; exiting"),
    }

    Ok(())
}

fn bind(ip: Ipv4Addr, port: u16) -> Result<TcpListener> {
    let socket = TcpSocket::new_v4().context("Failed to create listener socket")?;
    socket
        .set_reuseaddr(true)
        .context("Failed to set SO_REUSEADDR")?;
    socket
        .bind((ip, port).into())
        .with_context(|| format!("Failed to bind {ip}:{port}"))?;

    socket
        .listen(LISTEN_BACKLOG)
        .context("Failed to listen")
}

fn init_logging(verbose: bool) {
    let default_directives = if verbose {
        "debug,smoltcp=trace"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

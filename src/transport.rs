//! Target resolution and the ICMP channel the probe loop sends through.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::WatchError;

/// Large enough for any reply we care about.
pub const MAX_REPLY_LEN: usize = 1500;

const IPV4_HEADER_MIN: usize = 20;

/// Resolve a target to a single IP address. Literal addresses short-circuit
/// DNS; hostnames take the first resolved address, which also fixes the IP
/// version for the watcher.
pub async fn resolve(addr: &str) -> Result<IpAddr, WatchError> {
    if addr.is_empty() {
        return Err(WatchError::Resolve("addr cannot be empty".into()));
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((addr, 0))
        .await
        .map_err(|e| WatchError::Resolve(format!("{addr}: {e}")))?;
    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| WatchError::Resolve(format!("no addresses for {addr}")))
}

/// The seam between the probe loop and the wire. Implementations block; the
/// loop runs each cycle on the blocking pool and owns the channel for the
/// watcher's whole lifetime.
pub trait Channel: Send + Sync {
    fn send(&self, buf: &[u8], dst: IpAddr) -> io::Result<usize>;

    /// Wait up to `deadline` for one inbound message. An expired deadline
    /// surfaces as WouldBlock/TimedOut.
    fn recv(&self, buf: &mut [u8], deadline: Duration) -> io::Result<(usize, IpAddr)>;

    fn set_ttl(&self, ttl: u32) -> io::Result<()>;
}

/// ICMP socket in one of two modes: raw (privileged) or a datagram ping
/// socket (unprivileged; on Linux gated by `ping_group_range`).
pub struct IcmpChannel {
    sock: Socket,
    v4: bool,
    // raw IPv4 sockets deliver the IP header in front of the ICMP message
    raw_v4: bool,
}

impl IcmpChannel {
    pub fn open(v4: bool, privileged: bool, source: &str) -> Result<Self, WatchError> {
        let (domain, proto) = if v4 {
            (Domain::IPV4, Protocol::ICMPV4)
        } else {
            (Domain::IPV6, Protocol::ICMPV6)
        };
        let ty = if privileged { Type::RAW } else { Type::DGRAM };

        let sock = Socket::new(domain, ty, Some(proto)).map_err(WatchError::Transport)?;
        let bind = bind_addr(v4, source).map_err(WatchError::Transport)?;
        sock.bind(&SockAddr::from(bind)).map_err(WatchError::Transport)?;

        Ok(Self {
            sock,
            v4,
            raw_v4: privileged && v4,
        })
    }
}

impl Channel for IcmpChannel {
    fn send(&self, buf: &[u8], dst: IpAddr) -> io::Result<usize> {
        // Ping sockets and raw sockets both address peers as sockaddr with
        // a zero port.
        let peer = SockAddr::from(SocketAddr::new(dst, 0));
        self.sock.send_to(buf, &peer)
    }

    fn recv(&self, buf: &mut [u8], deadline: Duration) -> io::Result<(usize, IpAddr)> {
        if deadline.is_zero() {
            // an unset deadline behaves like one that already expired
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        self.sock.set_read_timeout(Some(deadline))?;

        let mut raw = [MaybeUninit::<u8>::uninit(); MAX_REPLY_LEN];
        let (n, peer) = self.sock.recv_from(&mut raw)?;
        // recv_from initialized the first n bytes
        let filled = unsafe { std::slice::from_raw_parts(raw.as_ptr() as *const u8, n) };

        let offset = if self.raw_v4 && n >= IPV4_HEADER_MIN {
            ((filled[0] & 0x0f) as usize) * 4
        } else {
            0
        };
        let body = &filled[offset.min(n)..];
        let len = body.len().min(buf.len());
        buf[..len].copy_from_slice(&body[..len]);

        let peer_ip = match peer.as_socket() {
            Some(sa) => sa.ip(),
            None if self.v4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Ok((len, peer_ip))
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        if self.v4 {
            self.sock.set_ttl_v4(ttl)
        } else {
            self.sock.set_unicast_hops_v6(ttl)
        }
    }
}

fn bind_addr(v4: bool, source: &str) -> io::Result<SocketAddr> {
    let ip: IpAddr = source.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid source address {source:?}"),
        )
    })?;
    // The default v4 wildcard still works when the target resolved to IPv6.
    let ip = match (v4, ip) {
        (false, IpAddr::V4(v)) if v.is_unspecified() => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        (true, IpAddr::V6(v)) if v.is_unspecified() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        (_, ip) => ip,
    };
    Ok(SocketAddr::new(ip, 0))
}

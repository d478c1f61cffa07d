//! # Socket Test Drivers Module
//!
//! Measurement loops for the socket transports: stream sockets (TCP and its
//! SDP cousin) and datagram sockets (UDP and RDS). The two families share
//! the same outer skeleton — negotiate a data port over the control channel,
//! apply socket options on both ends, hit the barrier, run the loop until
//! the duration alarm or the message cap — and differ only in how a message
//! moves and what counts as an error.
//!
//! Stream semantics: `send_full`/`recv_full` keep issuing I/O until the
//! whole message has moved, bailing out the moment the finished flag is set;
//! a zero-byte read is end-of-file and ends the test. Datagram semantics:
//! one syscall per message, and anything other than a full-size transfer
//! counts as an error (short datagrams are not retried).

use std::io::{Read, Write};
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::clock::{finished, set_finished};
use crate::params::ParamId;
use crate::registry::TestContext;
use crate::wire::{Decoder, Encoder};

/// Address family of the Sockets Direct Protocol (AF_INET_SDP).
pub const AF_SDP: libc::c_int = 27;

/// Fallback address family for RDS when the kernel does not export one.
const AF_RDS_FALLBACK: libc::c_int = 21;

/// Resolve the RDS address family. The dynamic value from
/// `/proc/sys/net/rds/pf_rds` is authoritative; the historic constant is
/// only a fallback for kernels that predate the sysctl.
pub fn rds_family() -> libc::c_int {
    std::fs::read_to_string("/proc/sys/net/rds/pf_rds")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(AF_RDS_FALLBACK)
}

/// The four socket transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Tcp,
    Sdp,
    Udp,
    Rds,
}

impl SockKind {
    fn domain(self) -> Domain {
        match self {
            SockKind::Tcp | SockKind::Udp => Domain::IPV4,
            SockKind::Sdp => Domain::from(AF_SDP),
            SockKind::Rds => Domain::from(rds_family()),
        }
    }

    fn socket_type(self) -> Type {
        match self {
            SockKind::Tcp | SockKind::Sdp => Type::STREAM,
            SockKind::Udp => Type::DGRAM,
            SockKind::Rds => Type::SEQPACKET,
        }
    }

    fn is_stream(self) -> bool {
        matches!(self, SockKind::Tcp | SockKind::Sdp)
    }

    /// Default message size for bandwidth runs; latency runs default to 1.
    fn default_bw_msg_size(self) -> u32 {
        if self.is_stream() {
            65536
        } else {
            32768
        }
    }
}

/// Build an IPv4 socket address carrying an explicit address family.
///
/// SDP sockets want `sin_family = AF_INET_SDP` in the address itself, while
/// RDS (and everything else) speaks plain AF_INET addresses.
fn inet_addr(ip: Ipv4Addr, port: u16, family: libc::c_int) -> SockAddr {
    let sin = libc::sockaddr_in {
        sin_family: family as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
    };
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            &sin as *const libc::sockaddr_in as *const u8,
            &mut storage as *mut libc::sockaddr_storage as *mut u8,
            size_of::<libc::sockaddr_in>(),
        );
        SockAddr::new(storage, size_of::<libc::sockaddr_in>() as libc::socklen_t)
    }
}

/// Extract the port of an IPv4-shaped address regardless of family; SDP
/// addresses do not parse as standard socket addresses.
fn port_of(addr: &SockAddr) -> Option<u16> {
    if (addr.len() as usize) < size_of::<libc::sockaddr_in>() {
        return None;
    }
    let sin = unsafe { *(addr.as_ptr() as *const libc::sockaddr_in) };
    Some(u16::from_be(sin.sin_port))
}

fn addr_family(kind: SockKind) -> libc::c_int {
    match kind {
        SockKind::Sdp => AF_SDP,
        _ => libc::AF_INET,
    }
}

fn ipv4_of(ip: IpAddr) -> Result<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .context("socket transports require an IPv4 peer"),
    }
}

/// Create and configure the data socket for a transport.
fn data_socket(ctx: &mut TestContext, kind: SockKind) -> Result<Socket> {
    let sock = Socket::new(kind.domain(), kind.socket_type(), None)
        .with_context(|| format!("cannot create {:?} data socket", kind))?;
    let buf_size = ctx.params.take_u32(ParamId::SockBufSize);
    if buf_size > 0 {
        sock.set_send_buffer_size(buf_size as usize)
            .context("set data socket send buffer")?;
        sock.set_recv_buffer_size(buf_size as usize)
            .context("set data socket receive buffer")?;
    }
    Ok(sock)
}

/// Send a bound data port to the peer over the control channel.
fn send_port(ctx: &mut TestContext, port: u16) -> Result<()> {
    let mut enc = Encoder::with_capacity(4);
    enc.put_int(u64::from(port), 4);
    ctx.control.send_mesg(&enc.finish(), "data port")?;
    debug!("announced data port {}", port);
    Ok(())
}

/// Receive the peer's data port from the control channel.
fn recv_port(ctx: &mut TestContext) -> Result<u16> {
    let mut buf = [0u8; 4];
    ctx.control.recv_mesg(&mut buf, "data port")?;
    let port = Decoder::new(&buf).get_u32()? as u16;
    debug!("peer data port is {}", port);
    Ok(port)
}

/// Client half of the data-path setup: bind an ephemeral (or pinned) local
/// port, learn the server's data port, and return the socket plus the peer
/// data address.
fn client_data_setup(ctx: &mut TestContext, kind: SockKind) -> Result<(Socket, SockAddr)> {
    let sock = data_socket(ctx, kind)?;

    let local_port = ctx.params.take_u32(ParamId::AltPort) as u16;
    // The server honors `port` when it binds; the value reaches it inside
    // the request, so consume it here too.
    ctx.params.mark_used(ParamId::Port);
    let local_ip = match kind {
        // RDS refuses wildcard binds; use the interface the control
        // channel already proved reachable.
        SockKind::Rds => ipv4_of(ctx.control.local_ip())?,
        _ => Ipv4Addr::UNSPECIFIED,
    };
    sock.bind(&inet_addr(local_ip, local_port, addr_family(kind)))
        .context("bind local data socket")?;

    let peer_port = recv_port(ctx)?;
    let peer_ip = ipv4_of(ctx.control.peer_ip())?;
    let peer = inet_addr(peer_ip, peer_port, addr_family(kind));
    Ok((sock, peer))
}

/// Server half of the data-path setup: bind the data port (pinned via the
/// `port` parameter or ephemeral) and announce it to the client.
fn server_data_setup(ctx: &mut TestContext, kind: SockKind) -> Result<Socket> {
    let sock = data_socket(ctx, kind)?;

    let port = ctx.params.take_u32(ParamId::Port) as u16;
    // Mirror of the client's bind: `alt_port` pins the peer's local port.
    ctx.params.mark_used(ParamId::AltPort);
    let local_ip = match kind {
        SockKind::Rds => ipv4_of(ctx.control.local_ip())?,
        _ => Ipv4Addr::UNSPECIFIED,
    };
    sock.bind(&inet_addr(local_ip, port, addr_family(kind)))
        .context("bind server data socket")?;

    // Streams must be listening before the port is announced, or the
    // client's connect can race the backlog.
    if kind.is_stream() {
        sock.listen(1).context("listen on data socket")?;
    }

    let local = sock.local_addr().context("query bound data port")?;
    let bound = port_of(&local).unwrap_or(port);
    send_port(ctx, bound)?;
    Ok(sock)
}

/// Outcome of one full-message transfer attempt.
#[derive(Debug, PartialEq, Eq)]
enum Xfer {
    /// The whole message moved.
    Done,
    /// The finished flag was raised mid-transfer; nothing is accounted.
    Stopped,
    /// The peer closed the stream.
    Eof,
}

/// Write the whole buffer, checking the finished flag after every return
/// from the kernel so an alarm-interrupted transfer is never accounted.
fn send_full(stream: &mut TcpStream, buf: &[u8]) -> std::io::Result<Xfer> {
    let mut off = 0;
    while off < buf.len() {
        match stream.write(&buf[off..]) {
            Ok(0) => return Ok(Xfer::Eof),
            Ok(n) => {
                if finished() {
                    return Ok(Xfer::Stopped);
                }
                off += n;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                if finished() {
                    return Ok(Xfer::Stopped);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Xfer::Done)
}

/// Read a whole message; zero bytes from the kernel is end-of-file.
fn recv_full(stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<Xfer> {
    let mut off = 0;
    while off < buf.len() {
        match stream.read(&mut buf[off..]) {
            Ok(0) => return Ok(Xfer::Eof),
            Ok(n) => {
                if finished() {
                    return Ok(Xfer::Stopped);
                }
                off += n;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                if finished() {
                    return Ok(Xfer::Stopped);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Xfer::Done)
}

/// Stream bandwidth sender: pump full messages until the alarm, the message
/// cap, or the peer ends the run.
fn stream_send_loop(ctx: &mut TestContext, stream: &mut TcpStream, msg_size: usize, cap: u32) {
    let buf = vec![0u8; msg_size];
    while !finished() {
        match send_full(stream, &buf) {
            Ok(Xfer::Done) => ctx.stats.s.add_op(msg_size as u64),
            Ok(Xfer::Stopped) => break,
            Ok(Xfer::Eof) => {
                set_finished();
                break;
            }
            Err(e) => {
                debug!("stream send error: {}", e);
                ctx.stats.s.add_error();
            }
        }
        if cap > 0 && ctx.stats.s.no_msgs + ctx.stats.s.no_errs >= u64::from(cap) {
            break;
        }
    }
}

/// Stream bandwidth receiver: drain full messages until EOF or the alarm.
fn stream_recv_loop(ctx: &mut TestContext, stream: &mut TcpStream, msg_size: usize) {
    let mut buf = vec![0u8; msg_size];
    while !finished() {
        match recv_full(stream, &mut buf) {
            Ok(Xfer::Done) => ctx.stats.r.add_op(msg_size as u64),
            Ok(Xfer::Stopped) => break,
            Ok(Xfer::Eof) => {
                set_finished();
                break;
            }
            Err(e) => {
                debug!("stream recv error: {}", e);
                ctx.stats.r.add_error();
            }
        }
    }
}

/// Accept the one data connection of a stream test.
fn accept_data(listener: &Socket, timeout_secs: u32) -> Result<TcpStream> {
    listener
        .set_read_timeout(Some(Duration::from_secs(u64::from(timeout_secs.max(1)))))
        .context("set accept timeout")?;
    loop {
        match listener.accept() {
            Ok((sock, peer)) => {
                debug!("data connection accepted from {:?}", peer.as_socket());
                return Ok(sock.into());
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                if finished() {
                    bail!("test finished before the data connection arrived");
                }
            }
            Err(e) => return Err(e).context("accept data connection"),
        }
    }
}

/// Stream bandwidth, client side. With `flip` set the direction reverses
/// and the client becomes the receiver.
pub fn stream_bw_client(ctx: &mut TestContext, kind: SockKind) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, crate::params::Value::Num(kind.default_bw_msg_size()));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    if msg_size == 0 {
        bail!("message size must be positive");
    }
    let cap = ctx.params.take_u32(ParamId::NoMsgs);
    let flip = ctx.params.take_u32(ParamId::Flip) != 0;

    let (sock, peer) = client_data_setup(ctx, kind)?;
    sock.connect(&peer).context("connect data socket")?;
    let mut stream: TcpStream = sock.into();

    if ctx.validate_and_barrier()? {
        if flip {
            stream_recv_loop(ctx, &mut stream, msg_size);
        } else {
            stream_send_loop(ctx, &mut stream, msg_size, cap);
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Stream bandwidth, server side.
pub fn stream_bw_server(ctx: &mut TestContext, kind: SockKind) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, crate::params::Value::Num(kind.default_bw_msg_size()));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    let cap = ctx.params.take_u32(ParamId::NoMsgs);
    let flip = ctx.params.take_u32(ParamId::Flip) != 0;
    let timeout = ctx.params.peek_u32(ParamId::Timeout);

    let listener = server_data_setup(ctx, kind)?;
    let mut stream = accept_data(&listener, timeout)?;

    if ctx.validate_and_barrier()? {
        if flip {
            stream_send_loop(ctx, &mut stream, msg_size, cap);
        } else {
            stream_recv_loop(ctx, &mut stream, msg_size);
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Stream ping-pong latency, client side: send one message, wait for the
/// echo, repeat. Each direction of a completed pair is accounted.
pub fn stream_lat_client(ctx: &mut TestContext, kind: SockKind) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, crate::params::Value::Num(1));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    if msg_size == 0 {
        bail!("message size must be positive");
    }
    let cap = ctx.params.take_u32(ParamId::NoMsgs);

    let (sock, peer) = client_data_setup(ctx, kind)?;
    sock.connect(&peer).context("connect data socket")?;
    let mut stream: TcpStream = sock.into();
    stream.set_nodelay(true).ok();

    if ctx.validate_and_barrier()? {
        let mut buf = vec![0u8; msg_size];
        while !finished() {
            match send_full(&mut stream, &buf) {
                Ok(Xfer::Done) => ctx.stats.s.add_op(msg_size as u64),
                Ok(Xfer::Stopped) => break,
                Ok(Xfer::Eof) => break,
                Err(e) => {
                    debug!("latency send error: {}", e);
                    ctx.stats.s.add_error();
                    continue;
                }
            }
            match recv_full(&mut stream, &mut buf) {
                Ok(Xfer::Done) => ctx.stats.r.add_op(msg_size as u64),
                Ok(Xfer::Stopped) | Ok(Xfer::Eof) => break,
                Err(e) => {
                    debug!("latency recv error: {}", e);
                    ctx.stats.r.add_error();
                }
            }
            if cap > 0 && ctx.stats.s.no_msgs + ctx.stats.s.no_errs >= u64::from(cap) {
                break;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Stream ping-pong latency, server side: echo every message back.
pub fn stream_lat_server(ctx: &mut TestContext, kind: SockKind) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, crate::params::Value::Num(1));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    ctx.params.mark_used(ParamId::NoMsgs);
    let timeout = ctx.params.peek_u32(ParamId::Timeout);

    let listener = server_data_setup(ctx, kind)?;
    let mut stream = accept_data(&listener, timeout)?;
    stream.set_nodelay(true).ok();

    if ctx.validate_and_barrier()? {
        let mut buf = vec![0u8; msg_size];
        while !finished() {
            match recv_full(&mut stream, &mut buf) {
                Ok(Xfer::Done) => ctx.stats.r.add_op(msg_size as u64),
                Ok(Xfer::Stopped) | Ok(Xfer::Eof) => break,
                Err(e) => {
                    debug!("latency recv error: {}", e);
                    ctx.stats.r.add_error();
                    continue;
                }
            }
            match send_full(&mut stream, &buf) {
                Ok(Xfer::Done) => ctx.stats.s.add_op(msg_size as u64),
                Ok(Xfer::Stopped) | Ok(Xfer::Eof) => break,
                Err(e) => {
                    debug!("latency send error: {}", e);
                    ctx.stats.s.add_error();
                }
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Datagram bandwidth sender. Success means the kernel took exactly
/// `msg_size` bytes; anything else is an error, not a retry.
fn dgram_send_loop(ctx: &mut TestContext, sock: &UdpSocket, peer: SocketAddr, msg_size: usize, cap: u32) {
    let buf = vec![0u8; msg_size];
    while !finished() {
        match sock.send_to(&buf, peer) {
            Ok(n) => {
                if finished() {
                    break;
                }
                if n == msg_size {
                    ctx.stats.s.add_op(msg_size as u64);
                } else {
                    ctx.stats.s.add_error();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("datagram send error: {}", e);
                ctx.stats.s.add_error();
            }
        }
        if cap > 0 && ctx.stats.s.no_msgs + ctx.stats.s.no_errs >= u64::from(cap) {
            break;
        }
    }
}

/// Datagram bandwidth receiver.
fn dgram_recv_loop(ctx: &mut TestContext, sock: &UdpSocket, msg_size: usize) {
    let mut buf = vec![0u8; msg_size];
    while !finished() {
        match sock.recv_from(&mut buf) {
            Ok((n, _)) => {
                if finished() {
                    break;
                }
                if n == msg_size {
                    ctx.stats.r.add_op(msg_size as u64);
                } else {
                    ctx.stats.r.add_error();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("datagram recv error: {}", e);
                ctx.stats.r.add_error();
            }
        }
    }
}

/// Datagram bandwidth, client side.
pub fn dgram_bw_client(ctx: &mut TestContext, kind: SockKind) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, crate::params::Value::Num(kind.default_bw_msg_size()));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    if msg_size == 0 {
        bail!("message size must be positive");
    }
    let cap = ctx.params.take_u32(ParamId::NoMsgs);
    let flip = ctx.params.take_u32(ParamId::Flip) != 0;

    let (sock, peer) = client_data_setup(ctx, kind)?;
    let peer = peer.as_socket().context("peer data address")?;
    let sock: UdpSocket = sock.into();

    if ctx.validate_and_barrier()? {
        if flip {
            // The flipped sender only knows where to aim after one
            // unaccounted priming datagram reveals our address.
            if let Err(e) = sock.send_to(&[0u8], peer) {
                warn!("could not prime flipped run: {}", e);
            }
            dgram_recv_loop(ctx, &sock, msg_size);
        } else {
            dgram_send_loop(ctx, &sock, peer, msg_size, cap);
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Datagram bandwidth, server side. In the flipped direction the server
/// cannot send until it has seen the client's address, so it waits for one
/// priming datagram first.
pub fn dgram_bw_server(ctx: &mut TestContext, kind: SockKind) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, crate::params::Value::Num(kind.default_bw_msg_size()));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    let cap = ctx.params.take_u32(ParamId::NoMsgs);
    let flip = ctx.params.take_u32(ParamId::Flip) != 0;

    let sock_raw = server_data_setup(ctx, kind)?;
    let sock: UdpSocket = sock_raw.into();

    if ctx.validate_and_barrier()? {
        if flip {
            let mut probe = vec![0u8; msg_size.max(1)];
            loop {
                match sock.recv_from(&mut probe) {
                    Ok((_, src)) => {
                        dgram_send_loop(ctx, &sock, src, msg_size, cap);
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                        if finished() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("no priming datagram for flipped run: {}", e);
                        break;
                    }
                }
            }
        } else {
            dgram_recv_loop(ctx, &sock, msg_size);
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Datagram ping-pong latency, client side.
pub fn dgram_lat_client(ctx: &mut TestContext, kind: SockKind) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, crate::params::Value::Num(1));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    if msg_size == 0 {
        bail!("message size must be positive");
    }
    let cap = ctx.params.take_u32(ParamId::NoMsgs);

    let (sock, peer) = client_data_setup(ctx, kind)?;
    let peer = peer.as_socket().context("peer data address")?;
    let sock: UdpSocket = sock.into();

    if ctx.validate_and_barrier()? {
        let mut buf = vec![0u8; msg_size];
        while !finished() {
            match sock.send_to(&buf, peer) {
                Ok(n) if n == msg_size => ctx.stats.s.add_op(msg_size as u64),
                Ok(_) => {
                    ctx.stats.s.add_error();
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("latency send error: {}", e);
                    ctx.stats.s.add_error();
                    continue;
                }
            }
            match sock.recv_from(&mut buf) {
                Ok((n, _)) => {
                    if finished() {
                        break;
                    }
                    if n == msg_size {
                        ctx.stats.r.add_op(msg_size as u64);
                    } else {
                        ctx.stats.r.add_error();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("latency recv error: {}", e);
                    ctx.stats.r.add_error();
                }
            }
            if cap > 0 && ctx.stats.s.no_msgs + ctx.stats.s.no_errs >= u64::from(cap) {
                break;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Datagram ping-pong latency, server side: echo to the source address of
/// the most recent datagram.
pub fn dgram_lat_server(ctx: &mut TestContext, kind: SockKind) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, crate::params::Value::Num(1));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    ctx.params.mark_used(ParamId::NoMsgs);

    let sock_raw = server_data_setup(ctx, kind)?;
    let sock: UdpSocket = sock_raw.into();

    if ctx.validate_and_barrier()? {
        let mut buf = vec![0u8; msg_size];
        while !finished() {
            let src = match sock.recv_from(&mut buf) {
                Ok((n, src)) => {
                    if finished() {
                        break;
                    }
                    if n == msg_size {
                        ctx.stats.r.add_op(msg_size as u64);
                        src
                    } else {
                        ctx.stats.r.add_error();
                        continue;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("latency recv error: {}", e);
                    ctx.stats.r.add_error();
                    continue;
                }
            };
            match sock.send_to(&buf, src) {
                Ok(n) if n == msg_size => ctx.stats.s.add_op(msg_size as u64),
                Ok(_) => ctx.stats.s.add_error(),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("latency send error: {}", e);
                    ctx.stats.s.add_error();
                }
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

// Per-test entry points, one pair per registry row.

pub fn tcp_bw_client(ctx: &mut TestContext) -> Result<()> {
    stream_bw_client(ctx, SockKind::Tcp)
}
pub fn tcp_bw_server(ctx: &mut TestContext) -> Result<()> {
    stream_bw_server(ctx, SockKind::Tcp)
}
pub fn tcp_lat_client(ctx: &mut TestContext) -> Result<()> {
    stream_lat_client(ctx, SockKind::Tcp)
}
pub fn tcp_lat_server(ctx: &mut TestContext) -> Result<()> {
    stream_lat_server(ctx, SockKind::Tcp)
}

pub fn sdp_bw_client(ctx: &mut TestContext) -> Result<()> {
    stream_bw_client(ctx, SockKind::Sdp)
}
pub fn sdp_bw_server(ctx: &mut TestContext) -> Result<()> {
    stream_bw_server(ctx, SockKind::Sdp)
}
pub fn sdp_lat_client(ctx: &mut TestContext) -> Result<()> {
    stream_lat_client(ctx, SockKind::Sdp)
}
pub fn sdp_lat_server(ctx: &mut TestContext) -> Result<()> {
    stream_lat_server(ctx, SockKind::Sdp)
}

pub fn udp_bw_client(ctx: &mut TestContext) -> Result<()> {
    dgram_bw_client(ctx, SockKind::Udp)
}
pub fn udp_bw_server(ctx: &mut TestContext) -> Result<()> {
    dgram_bw_server(ctx, SockKind::Udp)
}
pub fn udp_lat_client(ctx: &mut TestContext) -> Result<()> {
    dgram_lat_client(ctx, SockKind::Udp)
}
pub fn udp_lat_server(ctx: &mut TestContext) -> Result<()> {
    dgram_lat_server(ctx, SockKind::Udp)
}

pub fn rds_bw_client(ctx: &mut TestContext) -> Result<()> {
    dgram_bw_client(ctx, SockKind::Rds)
}
pub fn rds_bw_server(ctx: &mut TestContext) -> Result<()> {
    dgram_bw_server(ctx, SockKind::Rds)
}
pub fn rds_lat_client(ctx: &mut TestContext) -> Result<()> {
    dgram_lat_client(ctx, SockKind::Rds)
}
pub fn rds_lat_server(ctx: &mut TestContext) -> Result<()> {
    dgram_lat_server(ctx, SockKind::Rds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rds_family_is_sane() {
        // Either the sysctl value or the historic fallback; both positive.
        assert!(rds_family() > 0);
    }

    #[test]
    fn test_inet_addr_layout() {
        let addr = inet_addr(Ipv4Addr::new(127, 0, 0, 1), 19765, libc::AF_INET);
        let back = addr.as_socket().expect("AF_INET parses back");
        assert_eq!(back, "127.0.0.1:19765".parse().unwrap());

        // An SDP address keeps its family and therefore does not parse as
        // a plain socket address.
        let sdp = inet_addr(Ipv4Addr::LOCALHOST, 1, AF_SDP);
        assert!(sdp.as_socket().is_none());
        assert_eq!(i32::from(sdp.family()), AF_SDP);
    }

    #[test]
    fn test_default_message_sizes() {
        assert_eq!(SockKind::Tcp.default_bw_msg_size(), 65536);
        assert_eq!(SockKind::Sdp.default_bw_msg_size(), 65536);
        assert_eq!(SockKind::Udp.default_bw_msg_size(), 32768);
        assert_eq!(SockKind::Rds.default_bw_msg_size(), 32768);
    }
}

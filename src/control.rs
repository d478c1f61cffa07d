//! # Control Channel Module
//!
//! The single TCP connection that carries everything except measured data:
//! the test request, transport-specific context messages, the barrier that
//! releases both measurement loops, and the final statistics exchange.
//!
//! One channel is established per test. The server owns a persistent
//! listener on the well-known control port and accepts one client per test;
//! the client connects, sends the REQUEST, and from then on both sides speak
//! fixed-length messages whose size is implied by the protocol state.
//!
//! Every I/O failure on this channel is fatal for the test — the control
//! channel is the only path the end-of-test signal travels, so once it is
//! gone there is nothing left to coordinate. The one softened case is the
//! barrier: a peer that closed the channel early turns `synchronize` into
//! `Ok(false)`, letting the caller skip the measurement loop but still walk
//! the rest of the teardown path.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tracing::{debug, trace};

use crate::clock;
use crate::params::{Request, VER_MAJ};
use crate::stats::StatBlock;
use crate::wire::WireError;

/// Well-known TCP port of the control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 19765;

/// Fatal control-channel failures.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel i/o failed during {label}")]
    Io {
        label: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("peer closed the control channel during {0}")]
    PeerClosed(&'static str),

    #[error("peer protocol version {0}.{1}.{2} is incompatible with ours ({VER_MAJ}.x)")]
    VersionMismatch(u16, u16, u16),

    #[error("request names unknown test index {0}")]
    BadTestIndex(u16),

    #[error("malformed control message")]
    Malformed(#[from] WireError),
}

/// One established control connection.
#[derive(Debug)]
pub struct ControlChannel {
    stream: TcpStream,
    peer: SocketAddr,
}

impl ControlChannel {
    /// Client side: resolve `host` and connect to its control port.
    pub fn connect(host: &str, port: u16, timeout_secs: u32) -> Result<Self> {
        let timeout = Duration::from_secs(u64::from(timeout_secs.max(1)));
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {}", host))?
            .collect();
        let mut last_err = anyhow!("no addresses for {}", host);
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    debug!("control channel connected to {}", addr);
                    let chan = Self { stream, peer: addr };
                    chan.apply_timeout(timeout)?;
                    return Ok(chan);
                }
                Err(e) => last_err = anyhow!(e).context(format!("connect to {}", addr)),
            }
        }
        Err(last_err.context("control channel connect failed"))
    }

    /// Server side: bind the persistent control listener.
    pub fn bind_listener(port: u16) -> Result<TcpListener> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("cannot bind control port {}", port))?;
        debug!("control channel listening on port {}", port);
        Ok(listener)
    }

    /// Server side: accept the next client, retrying interrupted accepts.
    pub fn accept(listener: &TcpListener) -> Result<Self> {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("control channel accepted {}", peer);
                    return Ok(Self { stream, peer });
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(anyhow!(e).context("control channel accept failed")),
            }
        }
    }

    /// Address of the peer; data connections target the same host.
    pub fn peer_ip(&self) -> IpAddr {
        self.peer.ip()
    }

    /// Local address of the channel; transports that must bind a concrete
    /// interface (RDS) reuse it for the data socket.
    pub fn local_ip(&self) -> IpAddr {
        self.stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
    }

    /// Apply the per-operation timeout to control reads and writes.
    pub fn apply_timeout(&self, timeout: Duration) -> Result<()> {
        self.stream
            .set_read_timeout(Some(timeout))
            .context("set control read timeout")?;
        self.stream
            .set_write_timeout(Some(timeout))
            .context("set control write timeout")?;
        Ok(())
    }

    fn write_full(&mut self, mut buf: &[u8], label: &'static str) -> Result<(), ControlError> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => return Err(ControlError::PeerClosed(label)),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ControlError::Io { label, source: e }),
            }
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes. `Ok(false)` means the peer closed the
    /// channel before the first byte of this message.
    fn read_full(&mut self, buf: &mut [u8], label: &'static str) -> Result<bool, ControlError> {
        let mut off = 0;
        while off < buf.len() {
            match self.stream.read(&mut buf[off..]) {
                Ok(0) if off == 0 => return Ok(false),
                Ok(0) => return Err(ControlError::PeerClosed(label)),
                Ok(n) => off += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ControlError::Io { label, source: e }),
            }
        }
        Ok(true)
    }

    /// Send a fixed-length message; the length is implicit at the call site.
    pub fn send_mesg(&mut self, bytes: &[u8], label: &'static str) -> Result<(), ControlError> {
        trace!("control send {} ({} bytes)", label, bytes.len());
        self.write_full(bytes, label)
    }

    /// Receive a fixed-length message into `buf`.
    pub fn recv_mesg(&mut self, buf: &mut [u8], label: &'static str) -> Result<(), ControlError> {
        trace!("control recv {} ({} bytes)", label, buf.len());
        if !self.read_full(buf, label)? {
            return Err(ControlError::PeerClosed(label));
        }
        Ok(())
    }

    /// Client only: ship the REQUEST that opens a test.
    pub fn send_request(&mut self, req: &Request) -> Result<(), ControlError> {
        debug!("sending request for test index {}", req.req_index);
        self.write_full(&req.encode(), "request")
    }

    /// Server only: read and validate the next REQUEST.
    ///
    /// A major-version mismatch is refused outright; minor drift is accepted
    /// because the decoder ignores trailing bytes it does not know about.
    pub fn recv_request(&mut self, n_tests: u16) -> Result<Request, ControlError> {
        let mut buf = vec![0u8; Request::WIRE_LEN];
        self.recv_mesg(&mut buf, "request")?;
        let req = Request::decode(&buf)?;
        if req.ver_maj != VER_MAJ {
            return Err(ControlError::VersionMismatch(
                req.ver_maj,
                req.ver_min,
                req.ver_inc,
            ));
        }
        if req.req_index >= n_tests {
            return Err(ControlError::BadTestIndex(req.req_index));
        }
        debug!("received request for test index {}", req.req_index);
        Ok(req)
    }

    /// Two-way barrier: each side writes one byte and reads one byte.
    /// Returns `false` if the peer closed the channel early; the caller then
    /// skips the measurement loop but still exchanges statistics.
    pub fn synchronize(&mut self) -> Result<bool, ControlError> {
        self.write_full(&[1u8], "barrier")?;
        let mut byte = [0u8; 1];
        let released = self.read_full(&mut byte, "barrier")?;
        trace!("barrier {}", if released { "released" } else { "failed" });
        Ok(released)
    }

    /// Exchange statistics blocks: write ours, then read the peer's. The
    /// blocks are small enough that both sides writing first cannot stall.
    pub fn exchange_results(&mut self, local: &StatBlock) -> Result<StatBlock, ControlError> {
        self.write_full(&local.encode(), "results")?;
        let mut buf = vec![0u8; StatBlock::WIRE_LEN];
        self.recv_mesg(&mut buf, "results")?;
        let remote = StatBlock::decode(&buf)?;
        debug!(
            "results exchanged: local {} msgs sent, remote {} msgs sent",
            local.s.no_msgs, remote.s.no_msgs
        );
        Ok(remote)
    }
}

/// Barrier plus timer start: on release both sides take `t0` and arm the
/// duration alarm, establishing happens-before between the two STARTs.
pub fn barrier(
    control: &mut ControlChannel,
    run_clock: &mut crate::clock::RunClock,
    duration_secs: u32,
) -> Result<bool, ControlError> {
    let released = control.synchronize()?;
    if released {
        run_clock.start(duration_secs);
    } else {
        clock::set_finished();
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamTable;
    use std::thread;

    fn pair() -> (ControlChannel, ControlChannel) {
        let listener = ControlChannel::bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || ControlChannel::accept(&listener).unwrap());
        let client = ControlChannel::connect("127.0.0.1", port, 5).unwrap();
        (client, handle.join().unwrap())
    }

    #[test]
    fn test_request_over_channel() {
        let (mut client, mut server) = pair();
        let mut table = ParamTable::new();
        table.set_by_user("msg_size", "4096").unwrap();
        let req = table.to_request(2);

        client.send_request(&req).unwrap();
        let got = server.recv_request(16).unwrap();
        assert_eq!(got, req);
    }

    #[test]
    fn test_bad_test_index_refused() {
        let (mut client, mut server) = pair();
        let req = ParamTable::new().to_request(40);
        client.send_request(&req).unwrap();
        assert!(matches!(
            server.recv_request(16),
            Err(ControlError::BadTestIndex(40))
        ));
    }

    #[test]
    fn test_version_mismatch_refused() {
        let (mut client, mut server) = pair();
        let mut req = ParamTable::new().to_request(0);
        req.ver_maj = VER_MAJ + 1;
        client.send_request(&req).unwrap();
        assert!(matches!(
            server.recv_request(16),
            Err(ControlError::VersionMismatch(..))
        ));
    }

    #[test]
    fn test_synchronize_releases_both_sides() {
        let (mut client, mut server) = pair();
        let t = thread::spawn(move || server.synchronize().unwrap());
        assert!(client.synchronize().unwrap());
        assert!(t.join().unwrap());
    }

    #[test]
    fn test_synchronize_detects_closed_peer() {
        let listener = ControlChannel::bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        // The peer drains our barrier byte and then goes away without
        // answering, which must read as a failed barrier, not an error.
        let t = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).unwrap();
        });
        let mut client = ControlChannel::connect("127.0.0.1", port, 5).unwrap();
        assert!(!client.synchronize().unwrap());
        t.join().unwrap();
    }

    #[test]
    fn test_exchange_results_is_symmetric() {
        let (mut client, mut server) = pair();

        let mut cstats = StatBlock::new();
        cstats.s.add_op(1024);
        let mut sstats = StatBlock::new();
        sstats.r.add_op(1024);

        let cs = cstats.clone();
        let t = thread::spawn(move || server.exchange_results(&sstats).unwrap());
        let from_server = client.exchange_results(&cs).unwrap();
        let from_client = t.join().unwrap();

        assert_eq!(from_client, cstats);
        assert_eq!(from_server.r.no_bytes, 1024);
    }
}

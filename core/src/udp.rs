//! UDP transaction transport for the telemetry link.
//!
//! The protocol is deliberately minimal: one fixed-size datagram out, one
//! back, no retries, no acknowledgements, no ordering, no reconnection. Each
//! [`UdpTelemetryClient::transaction`] call is an independent at-most-once
//! exchange; loss shows up as a [`TransportError::Timeout`], which callers
//! treat as "no reading this cycle" and resubmit on the next cycle. Anything
//! stronger has to be layered on top by the consumer.
//!
//! The server side is symmetric and dumb on purpose. It hands every received
//! datagram to the caller together with its source address; stamping the
//! receive time and echoing the record back is the caller's policy, not the
//! transport's.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::telemetry::{PACKET_SIZE, TELEMETRY_PORT, TelemetryPacket, wall_clock_seconds};

/// Transport failure taxonomy.
///
/// Setup variants (`SocketSetup`, `HostResolution`) are fatal to the affected
/// instance: construction fails and no instance exists to misuse. The
/// remaining variants are per-call and transient; the calling loop decides
/// whether to retry, skip the cycle, or abort.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create or bind the UDP socket: {0}")]
    SocketSetup(#[source] io::Error),
    #[error("failed to resolve companion host {host:?}")]
    HostResolution { host: String },
    #[error("failed to send datagram: {0}")]
    Send(#[source] io::Error),
    #[error("timed out waiting for a datagram")]
    Timeout,
    #[error("expected a {expected}-byte telemetry reply, received {received} bytes")]
    SizeMismatch { expected: usize, received: usize },
    #[error("failed to receive datagram: {0}")]
    Receive(#[source] io::Error),
}

/// A receive failure is a normal timeout when the socket's deadline expired,
/// and a real error otherwise. The kind differs by platform.
fn classify_recv_error(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
        _ => TransportError::Receive(err),
    }
}

/// Controller-side endpoint of the telemetry link.
///
/// Binds an ephemeral local port and resolves the companion hostname exactly
/// once, at construction; resolution failure is surfaced immediately and the
/// client is never built. The socket is released on drop along every path.
#[derive(Debug)]
pub struct UdpTelemetryClient {
    socket: UdpSocket,
    companion_addr: SocketAddr,
}

impl UdpTelemetryClient {
    /// Create a client aimed at the companion node on the well-known port.
    pub fn new(companion_host: &str) -> Result<Self, TransportError> {
        Self::connect(companion_host, TELEMETRY_PORT)
    }

    /// Create a client aimed at an explicit host and port.
    ///
    /// # Errors
    /// [`TransportError::SocketSetup`] if the local socket cannot be bound,
    /// [`TransportError::HostResolution`] if the hostname does not resolve.
    /// Both are fatal to this client instance.
    pub fn connect(companion_host: &str, port: u16) -> Result<Self, TransportError> {
        let socket =
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(TransportError::SocketSetup)?;
        let companion_addr = (companion_host, port)
            .to_socket_addrs()
            .map_err(|_| TransportError::HostResolution {
                host: companion_host.to_string(),
            })?
            .next()
            .ok_or_else(|| TransportError::HostResolution {
                host: companion_host.to_string(),
            })?;
        debug!("resolved companion {} to {}", companion_host, companion_addr);
        Ok(UdpTelemetryClient {
            socket,
            companion_addr,
        })
    }

    /// Bound all subsequent blocking receives.
    ///
    /// `None` blocks indefinitely, which is acceptable for a one-shot control
    /// signal wait but never for a periodic telemetry loop; periodic callers
    /// must set an explicit timeout before their first blocking call.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.socket
            .set_read_timeout(timeout)
            .map_err(TransportError::SocketSetup)
    }

    /// Run one telemetry transaction: stamp, send, block for the echo.
    ///
    /// The packet's send time is stamped with the local clock immediately
    /// before transmission. The call then blocks, bounded by the configured
    /// timeout, until a reply arrives. A reply of any size other than
    /// [`PACKET_SIZE`] yields [`TransportError::SizeMismatch`]; the caller
    /// never sees a partially-decoded packet and must treat the cycle as
    /// having produced no reading.
    pub fn transaction(
        &self,
        mut packet: TelemetryPacket,
    ) -> Result<TelemetryPacket, TransportError> {
        packet.controller_send_time = wall_clock_seconds();
        self.socket
            .send_to(&packet.to_bytes(), self.companion_addr)
            .map_err(TransportError::Send)?;

        // Oversized replies truncate into the slack half of the buffer and
        // fail the exact-size check below, same as undersized ones
        let mut buffer = [0u8; 2 * PACKET_SIZE];
        let received = self.socket.recv(&mut buffer).map_err(classify_recv_error)?;
        if received != PACKET_SIZE {
            return Err(TransportError::SizeMismatch {
                expected: PACKET_SIZE,
                received,
            });
        }
        let mut bytes = [0u8; PACKET_SIZE];
        bytes.copy_from_slice(&buffer[..PACKET_SIZE]);
        Ok(TelemetryPacket::from_bytes(&bytes))
    }

    /// Send a raw payload to the companion node.
    ///
    /// Used for non-telemetry exchanges such as the single-byte start/stop
    /// control signals. A send failure is transient; the loop continues.
    pub fn send(&self, payload: &[u8]) -> Result<usize, TransportError> {
        self.socket
            .send_to(payload, self.companion_addr)
            .map_err(TransportError::Send)
    }

    /// Block until the next datagram arrives, bounded by the configured
    /// timeout.
    ///
    /// Returns the actual byte count received, which may be less than the
    /// buffer size; short reads are the caller's concern.
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        self.socket.recv(buffer).map_err(classify_recv_error)
    }

    /// Address the client resolved for the companion node.
    pub fn companion_addr(&self) -> SocketAddr {
        self.companion_addr
    }
}

/// Companion-side endpoint of the telemetry link.
///
/// Binds the well-known port and answers read calls. Echo policy (stamping
/// the receive time and sending the record back) belongs to the caller.
#[derive(Debug)]
pub struct UdpTelemetryServer {
    socket: UdpSocket,
}

impl UdpTelemetryServer {
    /// Bind the well-known telemetry port on all interfaces.
    pub fn bind() -> Result<Self, TransportError> {
        Self::bind_to(TELEMETRY_PORT)
    }

    /// Bind an explicit port on all interfaces. Port 0 asks the OS for an
    /// ephemeral port, which the loopback tests rely on.
    ///
    /// # Errors
    /// [`TransportError::SocketSetup`] on bind failure; fatal to this server
    /// instance.
    pub fn bind_to(port: u16) -> Result<Self, TransportError> {
        let socket =
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(TransportError::SocketSetup)?;
        Ok(UdpTelemetryServer { socket })
    }

    /// Address the server is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(TransportError::SocketSetup)
    }

    /// Bound all subsequent blocking receives; `None` blocks indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.socket
            .set_read_timeout(timeout)
            .map_err(TransportError::SocketSetup)
    }

    /// Block until the next datagram arrives, bounded by the configured
    /// timeout.
    ///
    /// Returns the byte count together with the source address so the caller
    /// can reply to the right peer.
    pub fn read(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        self.socket.recv_from(buffer).map_err(classify_recv_error)
    }

    /// Send a raw payload to a peer, typically echoing a stamped telemetry
    /// record back to its sender.
    pub fn send_to(&self, payload: &[u8], peer: SocketAddr) -> Result<usize, TransportError> {
        self.socket.send_to(payload, peer).map_err(TransportError::Send)
    }
}

//! # Output Sinks
//!
//! Where TS packets end up: standard output, a file, a TCP connection, or
//! a UDP datagram socket. UDP destinations in the multicast range get a
//! TTL of 5 and, optionally, an explicit outgoing interface; the socket is
//! then connected so that every variant sends the same way.

use crate::error::{PumpError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{self, AsyncWriteExt, BufWriter};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info};

/// Time-to-live applied to multicast UDP output.
const MULTICAST_TTL: u32 = 5;

/// A destination for TS output.
///
/// File-like sinks are buffered; a short write to them is an error. The
/// network sinks write eagerly, and TCP sends may complete partially when
/// the writer is also watching for commands.
pub enum TsSink {
    /// Binary data to standard output.
    Stdout(BufWriter<io::Stdout>),
    /// Binary data to a file.
    File(BufWriter<File>),
    /// A connected TCP stream.
    Tcp(TcpStream),
    /// A connected UDP socket (unicast or multicast).
    Udp(UdpSocket),
}

impl TsSink {
    /// A sink writing to standard output.
    pub fn stdout() -> Self {
        info!("writing to <stdout>");
        TsSink::Stdout(BufWriter::new(io::stdout()))
    }

    /// Creates (or truncates) `path` and writes to it.
    pub async fn file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "writing to file");
        let file = File::create(path).await.map_err(|e| {
            PumpError::Sink(format!("unable to open output file {}: {e}", path.display()))
        })?;
        Ok(TsSink::File(BufWriter::new(file)))
    }

    /// Connects to `host:port` over TCP.
    pub async fn tcp(host: &str, port: u16) -> Result<Self> {
        info!(host, port, "connecting via TCP/IP");
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| PumpError::Sink(format!("unable to connect to {host}:{port}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(TsSink::Tcp(stream))
    }

    /// Accepts one client on `listener` and writes to it. The accepted
    /// connection can also carry commands back from the client (see
    /// [`crate::TsWriter::start_input`]).
    pub async fn accept(listener: &TcpListener) -> Result<Self> {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| PumpError::Sink(format!("error accepting connection: {e}")))?;
        info!(%peer, "client connected");
        stream.set_nodelay(true)?;
        Ok(TsSink::Tcp(stream))
    }

    /// Opens a UDP socket sending to `host:port`.
    ///
    /// If the resolved address is a multicast group, the socket's
    /// multicast TTL is set, and `multicast_if` (an interface's IP
    /// address, as dotted quad) selects the outgoing interface; for
    /// ordinary unicast destinations `multicast_if` is ignored. The
    /// socket is connected, fixing the peer, so sending needs no
    /// per-datagram address.
    pub async fn udp(host: &str, port: u16, multicast_if: Option<&str>) -> Result<Self> {
        let addr = lookup_host((host, port))
            .await
            .map_err(|e| PumpError::Sink(format!("unable to resolve host {host}: {e}")))?
            .next()
            .ok_or_else(|| PumpError::Sink(format!("no addresses for host {host}")))?;
        info!(host, port, %addr, "connecting via UDP");

        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if let SocketAddr::V4(v4) = addr {
            if v4.ip().is_multicast() {
                socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
                if let Some(ifaddr) = multicast_if {
                    let ifaddr = ifaddr.parse().map_err(|e| {
                        PumpError::Sink(format!("bad multicast interface {ifaddr}: {e}"))
                    })?;
                    debug!(interface = %ifaddr, "selecting multicast interface");
                    socket.set_multicast_if_v4(&ifaddr).map_err(|e| {
                        PumpError::Sink(format!("unable to set multicast interface {ifaddr}: {e}"))
                    })?;
                }
            }
        }

        socket.set_nonblocking(true)?;
        socket
            .connect(&addr.into())
            .map_err(|e| PumpError::Sink(format!("unable to connect to {addr}: {e}")))?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(TsSink::Udp(socket))
    }

    /// True for the UDP variant (the only one that supports, and
    /// requires, buffered pacing).
    pub fn is_udp(&self) -> bool {
        matches!(self, TsSink::Udp(_))
    }

    /// True for the TCP variant (the only one that supports command
    /// input).
    pub fn is_tcp(&self) -> bool {
        matches!(self, TsSink::Tcp(_))
    }

    /// Writes `data` in full. For UDP this is a single datagram.
    pub(crate) async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            TsSink::Stdout(writer) => writer.write_all(data).await?,
            TsSink::File(writer) => writer.write_all(data).await?,
            TsSink::Tcp(stream) => stream.write_all(data).await?,
            TsSink::Udp(socket) => {
                socket.send(data).await?;
            }
        }
        Ok(())
    }

    /// Flushes whatever the sink buffers.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        match self {
            TsSink::Stdout(writer) => writer.flush().await?,
            TsSink::File(writer) => writer.flush().await?,
            TsSink::Tcp(stream) => stream.flush().await?,
            TsSink::Udp(_) => {}
        }
        Ok(())
    }
}

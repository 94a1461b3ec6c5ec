//! Measurement socket
//!
//! Owns one TCP socket for the channel: creation with send coalescing
//! disabled, hostname resolution and connect with distinct error codes,
//! the two supported socket options, raw send/receive, a non-blocking
//! readiness poll, and close.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;

use crate::{ChannelError, ChannelResult};

/// Socket kind requested at creation. Only `Stream` is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    /// TCP stream socket.
    Stream,
    /// UDP datagram socket; rejected at creation.
    Datagram,
}

/// The two socket options the channel recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// SO_LINGER duration applied at close.
    Linger(Duration),
    /// Receive timeout bounding every blocking read. A zero duration
    /// means block indefinitely.
    RecvTimeout(Duration),
}

impl SocketOption {
    /// Raw id for the linger option at the embedding boundary.
    pub const ID_LINGER: i32 = 0x0080;
    /// Raw id for the receive timeout option at the embedding boundary.
    pub const ID_RECV_TIMEOUT: i32 = 0x1006;

    /// Map a raw option id and a value in seconds to a typed option.
    ///
    /// Exactly the two ids above are recognized; anything else fails with
    /// `UnsupportedOption`.
    pub fn from_raw(id: i32, seconds: u64) -> ChannelResult<Self> {
        match id {
            Self::ID_LINGER => Ok(Self::Linger(Duration::from_secs(seconds))),
            Self::ID_RECV_TIMEOUT => Ok(Self::RecvTimeout(Duration::from_secs(seconds))),
            other => Err(ChannelError::UnsupportedOption(other)),
        }
    }
}

/// Outcome of one bounded receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// Bytes arrived.
    Data(usize),
    /// The peer shut the connection down.
    Shutdown,
    /// The receive timeout expired with no data.
    TimedOut,
}

/// One exclusively-owned TCP socket with measurement-friendly settings.
///
/// Send and receive deliberately do no logging: the channel samples the
/// tick clock immediately around them and a stray syscall or allocation
/// there would show up in the measured interval.
#[derive(Debug)]
pub struct MeasuredSocket {
    raw: Option<Socket>,
    stream: Option<TcpStream>,
}

impl MeasuredSocket {
    /// Allocate a TCP socket with Nagle's algorithm disabled.
    ///
    /// Small measurement requests must hit the wire immediately, so a
    /// failure to disable send coalescing is fatal here rather than a
    /// warning at send time. The socket is IPv4, matching the channel's
    /// resolution policy.
    pub fn create(kind: SocketKind) -> ChannelResult<Self> {
        if kind == SocketKind::Datagram {
            return Err(ChannelError::DatagramUnsupported);
        }
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(ChannelError::Create)?;
        socket.set_nodelay(true).map_err(|source| ChannelError::OptionFailed {
            name: "TCP_NODELAY",
            source,
        })?;
        debug!("created measurement socket, send coalescing disabled");
        Ok(Self {
            raw: Some(socket),
            stream: None,
        })
    }

    /// Resolve `host` and connect.
    ///
    /// A failed or empty resolution is reported as `Resolution`, distinct
    /// from a failed OS connect (`Connect`), which carries the OS error.
    pub fn connect(&mut self, host: &str, port: u16) -> ChannelResult<()> {
        let addr = resolve(host, port)?;
        let socket = match self.raw.take() {
            Some(socket) => socket,
            None if self.stream.is_some() => return Err(ChannelError::AlreadyConnected),
            None => return Err(ChannelError::Closed),
        };
        if let Err(source) = socket.connect(&addr.into()) {
            self.raw = Some(socket);
            return Err(ChannelError::Connect {
                addr: addr.to_string(),
                source,
            });
        }
        debug!(%addr, "connected");
        self.stream = Some(socket.into());
        Ok(())
    }

    /// Apply one of the two supported options to the connected socket.
    pub fn set_option(&self, option: SocketOption) -> ChannelResult<()> {
        let stream = self.stream()?;
        match option {
            SocketOption::Linger(duration) => SockRef::from(stream)
                .set_linger(Some(duration))
                .map_err(|source| ChannelError::OptionFailed {
                    name: "SO_LINGER",
                    source,
                }),
            SocketOption::RecvTimeout(duration) => {
                let timeout = if duration.is_zero() { None } else { Some(duration) };
                self.set_recv_timeout(timeout)
            }
        }
    }

    /// Set or clear the receive timeout directly.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> ChannelResult<()> {
        self.stream()?
            .set_read_timeout(timeout.filter(|t| !t.is_zero()))
            .map_err(|source| ChannelError::OptionFailed {
                name: "SO_RCVTIMEO",
                source,
            })
    }

    /// Transmit `bytes` in one send call.
    ///
    /// A short write would silently truncate the flushed request and skew
    /// the measurement, so it is an error rather than a retry.
    pub fn send(&mut self, bytes: &[u8]) -> ChannelResult<usize> {
        let stream = self.stream_mut()?;
        let sent = stream.write(bytes).map_err(ChannelError::Io)?;
        if sent != bytes.len() {
            return Err(ChannelError::ShortSend {
                sent,
                len: bytes.len(),
            });
        }
        Ok(sent)
    }

    /// One blocking receive bounded by the configured receive timeout.
    ///
    /// Zero bytes signals peer shutdown; an expired timeout is reported
    /// as `TimedOut` so the caller can distinguish it from a hard fault.
    pub fn recv(&mut self, buf: &mut [u8]) -> ChannelResult<RecvStatus> {
        let stream = self.stream_mut()?;
        loop {
            return match stream.read(buf) {
                Ok(0) => Ok(RecvStatus::Shutdown),
                Ok(n) => Ok(RecvStatus::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    Ok(RecvStatus::TimedOut)
                }
                Err(e) => Err(ChannelError::Io(e)),
            };
        }
    }

    /// Non-blocking readiness poll: is at least one byte readable?
    pub fn poll_readiness(&self) -> ChannelResult<bool> {
        let stream = self.stream()?;
        let mut pollfd = libc::pollfd {
            fd: stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };
        if rc < 0 {
            return Err(ChannelError::Io(io::Error::last_os_error()));
        }
        Ok(rc > 0 && pollfd.revents & libc::POLLIN != 0)
    }

    /// A second handle to the connected stream.
    ///
    /// Shutting the clone down affects the shared descriptor, so the
    /// holder can unblock a receive in progress on the primary handle
    /// without synchronizing with the thread driving it.
    pub fn shutdown_handle(&self) -> ChannelResult<TcpStream> {
        self.stream()?.try_clone().map_err(ChannelError::Io)
    }

    /// Shut the connection down and release the descriptor.
    ///
    /// Unblocks any in-flight receive on another thread with an error.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.raw = None;
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.raw.is_none() && self.stream.is_none()
    }

    fn stream(&self) -> ChannelResult<&TcpStream> {
        match &self.stream {
            Some(stream) => Ok(stream),
            None if self.raw.is_some() => Err(ChannelError::NotConnected),
            None => Err(ChannelError::Closed),
        }
    }

    fn stream_mut(&mut self) -> ChannelResult<&mut TcpStream> {
        match &mut self.stream {
            Some(stream) => Ok(stream),
            None if self.raw.is_some() => Err(ChannelError::NotConnected),
            None => Err(ChannelError::Closed),
        }
    }
}

/// Black-box hostname resolution, pinned to IPv4.
fn resolve(host: &str, port: u16) -> ChannelResult<SocketAddr> {
    let addrs = (host, port).to_socket_addrs().map_err(|_| ChannelError::Resolution {
        host: host.to_string(),
    })?;
    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ChannelError::Resolution {
            host: host.to_string(),
        })
}

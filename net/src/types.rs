//! Type-safe transport primitives.
//!
//! Newtype wrappers for the identifiers the transport layer passes around,
//! the half-open sequence range used by the SACK machinery, and the
//! user-facing error taxonomy of the socket surface.

use core::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

/// A TCP port.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(pub u16);

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An (address, port) endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockAddr {
    pub ip: Ipv4Addr,
    pub port: Port,
}

impl SockAddr {
    pub const fn new(ip: Ipv4Addr, port: Port) -> Self {
        Self { ip, port }
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Handle to a stream socket on a host.  Handles are never reused within a
/// host's lifetime.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SockHandle(pub u32);

impl fmt::Debug for SockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock{}", self.0)
    }
}

impl fmt::Display for SockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock{}", self.0)
    }
}

/// A half-open sequence range `[begin, end)`.
///
/// Sequence numbers count packets, not bytes; zero is reserved for pure
/// control segments, so data ranges start at 1 (the SYN occupies `[0, 1)`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqRange {
    pub begin: u32,
    pub end: u32,
}

impl SeqRange {
    pub const fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    /// Number of sequences covered.
    #[inline]
    pub const fn len(&self) -> u32 {
        self.end.saturating_sub(self.begin)
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    #[inline]
    pub const fn contains(&self, seq: u32) -> bool {
        self.begin <= seq && seq < self.end
    }
}

impl fmt::Debug for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Which direction(s) of a stream to shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// The error taxonomy of the user-facing socket surface.
///
/// Packet-level loss never surfaces here (it is recovered by
/// retransmission); these are the conditions the application must handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SockError {
    /// The direction is open but no progress is possible right now: empty
    /// receive buffer, full send buffer, or empty accept queue.
    #[error("operation would block")]
    WouldBlock,
    /// End-of-stream was already signalled and the user retried, or the
    /// socket never reached a connected state for this operation.
    #[error("socket is not connected")]
    NotConnected,
    /// First write after the remote half-close.
    #[error("broken pipe")]
    BrokenPipe,
    /// A RST was observed on an established connection.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// The SYN was answered with a RST before establishment.
    #[error("connection refused")]
    ConnectionRefused,
    /// A non-blocking connect was initiated; completion is signalled
    /// through the descriptor becoming writable.
    #[error("operation in progress")]
    InProgress,
    /// A connect was retried while a connect is still in flight.
    #[error("connect already in progress")]
    Already,
    /// The handle does not name a live socket on this host.
    #[error("bad socket handle")]
    BadHandle,
    /// The operation does not apply to the socket's current state (for
    /// example `accept` on a non-listening socket).
    #[error("invalid operation for socket state")]
    InvalidState,
}

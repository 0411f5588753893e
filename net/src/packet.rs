//! TCP wire header and packet.
//!
//! This is the surface exposed to the network delivery layer: a parsed-form
//! header (no byte-level marshalling — the simulator never serialises to a
//! real wire) plus a shared, immutable payload.
//!
//! Sequence numbers count **packets**.  Sequence zero is reserved for pure
//! control segments (SYN, SYN+ACK, plain ACK, RST); data and FIN segments
//! consume real sequence numbers starting at 1.
//!
//! Packets are held behind `Arc`: the retransmit map and the throttled
//! output queue of a connection share one allocation, and the delivery
//! layer hands the same allocation to the receiving host.

use core::fmt;

use bytes::Bytes;

use slopsim_lib::SimTime;

use crate::types::{Port, SeqRange, SockAddr};

bitflags::bitflags! {
    /// TCP header flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TcpFlags: u8 {
        const SYN    = 1 << 0;
        const ACK    = 1 << 1;
        const FIN    = 1 << 2;
        const RST    = 1 << 3;
        /// The acknowledgment repeats a previous one (receiver saw
        /// out-of-order or duplicate data).
        const DUPACK = 1 << 4;
    }
}

/// Parsed TCP header.
#[derive(Clone, Debug)]
pub struct TcpHeader {
    pub src: SockAddr,
    pub dst: SockAddr,
    /// Packet sequence number; 0 for pure control segments.
    pub seq: u32,
    /// Cumulative acknowledgment: the next sequence expected from the peer.
    pub ack: u32,
    /// Advertised receive window, in packets.
    pub window: u32,
    pub flags: TcpFlags,
    /// Out-of-order sequences held by the receiver, as coalesced half-open
    /// ranges.
    pub sacks: Vec<SeqRange>,
    /// Send timestamp (simulated nanoseconds); echoed back for RTT
    /// sampling.
    pub ts_val: u64,
    /// Echo of the latest `ts_val` received from the peer; 0 if none.
    pub ts_echo: u64,
}

impl TcpHeader {
    /// A pure control header (sequence 0, no payload implied).
    pub fn control(src: SockAddr, dst: SockAddr, flags: TcpFlags, now: SimTime) -> Self {
        Self {
            src,
            dst,
            seq: 0,
            ack: 0,
            window: 0,
            flags,
            sacks: Vec::new(),
            ts_val: now.nanos(),
            ts_echo: 0,
        }
    }

    #[inline]
    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN) && !self.flags.contains(TcpFlags::ACK)
    }

    #[inline]
    pub fn is_syn_ack(&self) -> bool {
        self.flags.contains(TcpFlags::SYN | TcpFlags::ACK)
    }

    #[inline]
    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN) && !self.flags.contains(TcpFlags::ACK)
    }

    /// An acknowledgment of a FIN (both flags set); distinct from a bare
    /// FIN, which announces the peer's close.
    #[inline]
    pub fn is_fin_ack(&self) -> bool {
        self.flags.contains(TcpFlags::FIN | TcpFlags::ACK)
    }

    #[inline]
    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    #[inline]
    pub fn has_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    #[inline]
    pub fn is_dup_ack(&self) -> bool {
        self.flags.contains(TcpFlags::DUPACK)
    }
}

/// A wire packet: header plus shared payload bytes.
#[derive(Clone)]
pub struct Packet {
    pub header: TcpHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: TcpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// A payload-less control packet.
    pub fn control(header: TcpHeader) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// `true` if this packet occupies sequence space (data or FIN).
    #[inline]
    pub fn is_sequenced(&self) -> bool {
        self.header.seq != 0
    }

    /// Source port convenience accessor.
    #[inline]
    pub fn src_port(&self) -> Port {
        self.header.src.port
    }

    /// Destination port convenience accessor.
    #[inline]
    pub fn dst_port(&self) -> Port {
        self.header.dst.port
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet({} -> {}, seq {}, ack {}, {:?}, {}B)",
            self.header.src,
            self.header.dst,
            self.header.seq,
            self.header.ack,
            self.header.flags,
            self.payload.len()
        )
    }
}

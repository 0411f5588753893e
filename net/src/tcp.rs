//! TCP connection state machine.
//!
//! One [`TcpConnection`] per stream socket: the eleven-state RFC-793
//! automaton, send/receive sequencing and buffering, reliable delivery
//! (retransmit map + tally-driven loss recovery), congestion control
//! through the pluggable hook table, and buffer autotuning.
//!
//! Sequence numbers count **packets**.  The SYN (and SYN+ACK) occupy
//! sequence 0; data and FIN segments consume sequence numbers from 1.
//! Pure acknowledgments, RSTs and FIN-acknowledgments stay at sequence 0
//! and are never retransmitted.
//!
//! A connection never touches its host directly.  Every operation receives
//! a [`TcpEnv`] that collects outgoing packets, timer registrations and
//! parent/child notices; the host applies them once the borrow ends (the
//! same collect-then-dispatch discipline the round scheduler uses for its
//! queues).
//!
//! # FIN flag convention
//!
//! A segment announcing *our* close carries `FIN` alone.  The response
//! acknowledging a received FIN carries `FIN | ACK`.  The state machine
//! dispatches on that distinction: a bare FIN means "peer is closing", a
//! FIN+ACK means "peer acknowledged our close".

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;

use slopsim_core::event::HostId;
use slopsim_core::topology::Topology;
use slopsim_lib::simtime::NANOS_PER_MSEC;
use slopsim_lib::{IndexedMinHeap, SimTime};

use crate::config::TcpConfig;
use crate::congestion::{CongestionModule, CongestionWindow, RecoveryState, Reno};
use crate::packet::{Packet, TcpFlags, TcpHeader};
use crate::status::{Descriptor, DescriptorStatus, StatusListener};
use crate::tally::RetransmitTally;
use crate::types::{SeqRange, ShutdownHow, SockAddr, SockError, SockHandle};

/// Largest byte count a single `send` call accepts.
pub const MAX_SEND_CHUNK: usize = 65_535;

/// The RFC-793 automaton states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl TcpState {
    /// The Linux `tcp_info` state constant for this state.
    pub const fn linux_code(self) -> u8 {
        match self {
            TcpState::Established => 1,
            TcpState::SynSent => 2,
            TcpState::SynReceived => 3,
            TcpState::FinWait1 => 4,
            TcpState::FinWait2 => 5,
            TcpState::TimeWait => 6,
            TcpState::Closed => 7,
            TcpState::CloseWait => 8,
            TcpState::LastAck => 9,
            TcpState::Listen => 10,
            TcpState::Closing => 11,
        }
    }

    /// `true` once the handshake completed (data may flow or drain).
    const fn is_connected(self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived
        )
    }
}

bitflags::bitflags! {
    /// Connection lifecycle flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ConnFlags: u8 {
        /// The user shut down the write side.
        const HALF_CLOSED         = 1 << 0;
        /// The connection reached ESTABLISHED at least once.
        const ESTABLISHED_ONCE    = 1 << 1;
        /// A non-blocking connect wants a completion signal.
        const CONNECT_SIGNAL      = 1 << 2;
        /// A RST was observed and signalled.
        const RESET_SIGNALED      = 1 << 3;
        /// A FIN is owed as soon as the output queue drains.
        const WRITE_FIN_PENDING   = 1 << 4;
        /// Broken-pipe was already delivered to the user.
        const SEND_EOF_SIGNALED   = 1 << 5;
        /// End-of-file was already delivered to the user.
        const RECV_EOF_SIGNALED   = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Sticky error conditions.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ConnError: u8 {
        const CONN_RESET = 1 << 0;
        const SEND_EOF   = 1 << 1;
        const RECV_EOF   = 1 << 2;
    }
}

/// Typed timer discriminant; the host dispatches timer events back into
/// the owning connection through this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    Retransmit,
    DelayedAck,
    Close,
}

/// A notice from a connection to its host, applied after the borrow ends.
#[derive(Debug)]
pub enum ConnNotice {
    /// This child completed the handshake; the parent should queue it for
    /// accept.
    ChildEstablished,
    /// This child reached CLOSED; the parent should drop its demux entry.
    ChildClosed,
}

/// The collect-then-apply boundary between a connection and its host.
pub struct TcpEnv<'a> {
    now: SimTime,
    local_host: HostId,
    peer_host: Option<HostId>,
    topology: &'a dyn Topology,
    pub(crate) emitted: Vec<Arc<Packet>>,
    pub(crate) timers: Vec<(TimerKind, SimTime)>,
    pub(crate) notices: Vec<ConnNotice>,
}

impl<'a> TcpEnv<'a> {
    pub fn new(
        now: SimTime,
        local_host: HostId,
        peer_host: Option<HostId>,
        topology: &'a dyn Topology,
    ) -> Self {
        Self {
            now,
            local_host,
            peer_host,
            topology,
            emitted: Vec::new(),
            timers: Vec::new(),
            notices: Vec::new(),
        }
    }

    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    fn emit(&mut self, packet: Packet) {
        self.emitted.push(Arc::new(packet));
    }

    fn emit_shared(&mut self, packet: Arc<Packet>) {
        self.emitted.push(packet);
    }

    fn schedule_timer(&mut self, kind: TimerKind, at: SimTime) {
        self.timers.push((kind, at));
    }

    fn notify(&mut self, notice: ConnNotice) {
        self.notices.push(notice);
    }

    /// Decompose into the collected outputs for the host to apply.
    pub(crate) fn into_outputs(
        self,
    ) -> (
        Vec<Arc<Packet>>,
        Vec<(TimerKind, SimTime)>,
        Vec<ConnNotice>,
    ) {
        (self.emitted, self.timers, self.notices)
    }

    /// The delivery layer applies no backpressure in this simulator; the
    /// hook exists because the flush contract consults it.
    fn has_buffer_space(&self) -> bool {
        true
    }

    fn is_loopback(&self) -> bool {
        self.peer_host == Some(self.local_host)
    }

    fn bw_up_self(&self) -> u64 {
        self.topology.bandwidth_up_kib(self.local_host)
    }

    fn bw_down_self(&self) -> u64 {
        self.topology.bandwidth_down_kib(self.local_host)
    }

    fn bw_up_peer(&self) -> u64 {
        self.topology
            .bandwidth_up_kib(self.peer_host.unwrap_or(self.local_host))
    }

    fn bw_down_peer(&self) -> u64 {
        self.topology
            .bandwidth_down_kib(self.peer_host.unwrap_or(self.local_host))
    }
}

// ---------------------------------------------------------------------------
// Per-direction window state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ReceiveState {
    /// First data sequence expected from the peer.
    pub start: u32,
    /// Next in-order sequence expected.
    pub next: u32,
    /// Current receive window, in packets.
    pub window: u32,
    /// The peer's FIN sequence, once seen.
    pub end: Option<u32>,
    /// Loss-recovery exit point: recovery ends when the cumulative ack
    /// reaches it.
    pub recovery_point: u32,
    /// Window most recently advertised to the peer.
    pub last_window_adv: u32,
    /// Acknowledgment most recently sent to the peer.
    pub last_ack_sent: u32,
    /// Out-of-order sequences held for SACK.
    pub sacked: BTreeSet<u32>,
}

#[derive(Debug)]
pub(crate) struct SendState {
    /// Oldest unacknowledged sequence.
    pub unacked: u32,
    /// Next sequence to assign.
    pub next: u32,
    /// Effective send window: min(cwnd, peer's advertised window).
    pub window: u32,
    /// Our FIN sequence, once assigned.
    pub end: Option<u32>,
    /// Last cumulative acknowledgment received.
    pub last_ack_rcvd: u32,
    /// Last window the peer advertised.
    pub last_window_rcvd: u32,
    /// Highest sequence ever handed to the wire.
    pub highest_sent: u32,
    /// Sequenced packets sent, lifetime.
    pub packets_sent: u64,
    /// Quick acknowledgments sent so far (drives the delayed-ACK delay).
    pub quick_acks: u32,
    /// A delayed-ACK task is pending; clearing this cancels it.
    pub delayed_ack_scheduled: bool,
    /// Latest peer timestamp, echoed in our next segment.
    pub last_ts_recv: u64,
}

#[derive(Debug)]
pub(crate) struct RetransmitState {
    /// In-flight packets by sequence.  The SYN/SYN+ACK lives at key 0.
    pub map: HashMap<u32, Arc<Packet>>,
    /// Sum of payload bytes in `map`.
    pub queue_bytes: usize,
    /// Current RTO in milliseconds, clamped to the configured bounds.
    pub rto_ms: u32,
    /// Fire times of the timer tasks currently scheduled.
    pub scheduled: IndexedMinHeap<SimTime>,
    /// When the timer should really fire; `None` disables the timer and
    /// makes stale tasks no-ops.
    pub desired: Option<SimTime>,
    /// Exponential-backoff count since the last good acknowledgment.
    pub backoff_count: u32,
    pub tally: RetransmitTally,
}

#[derive(Debug)]
pub(crate) struct RttState {
    pub srtt_ms: u32,
    pub rttvar_ms: u32,
    pub has_sample: bool,
}

#[derive(Debug)]
pub(crate) struct Autotune {
    pub enabled: bool,
    pub initialized: bool,
    pub user_disabled_send: bool,
    pub user_disabled_recv: bool,
    pub bytes_copied: u64,
    pub last_adjust: SimTime,
    /// Receive-space target reported through `get_info`.
    pub space: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ConnStats {
    pub total_retrans: u32,
    pub last_data_sent: SimTime,
    pub last_ack_sent: SimTime,
    pub last_data_recv: SimTime,
    pub last_ack_recv: SimTime,
}

/// Listening-socket state.
#[derive(Debug)]
pub(crate) struct ServerState {
    pub backlog_limit: usize,
    /// Fully established children awaiting accept.
    pub backlog: VecDeque<(SockHandle, SockAddr)>,
    /// Child demux table, keyed by `child_key(peer)`.
    pub children: HashMap<u64, SockHandle>,
    /// Peer of the most recently spawned child.
    pub last_peer: Option<SockAddr>,
}

/// Child-socket back-reference (non-owning; the parent owns the demux
/// entry, which breaks the reference cycle).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildState {
    pub parent: SockHandle,
    pub key: u64,
}

/// Demux key for a child connection.
pub fn child_key(peer: SockAddr) -> u64 {
    (u64::from(u32::from(peer.ip)) << 16) ^ u64::from(peer.port.0)
}

/// A snapshot of connection internals shaped like Linux's `tcp_info`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpInfo {
    pub state: u8,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    pub unacked: u32,
    pub retransmits: u32,
    pub last_data_sent_us: u64,
    pub last_ack_sent_us: u64,
    pub last_data_recv_us: u64,
    pub last_ack_recv_us: u64,
    pub pmtu: u32,
    pub rtt_us: u32,
    pub rttvar_us: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub rcv_rtt_us: u32,
    pub rcv_space: u32,
    pub total_retrans: u32,
}

/// An event queue ordered by packet sequence.
fn packet_queue() -> IndexedMinHeap<Arc<Packet>> {
    IndexedMinHeap::new(
        |a, b| a.header.seq.cmp(&b.header.seq),
        |p| u64::from(p.header.seq),
    )
}

/// A queue of timer fire times.
fn time_queue() -> IndexedMinHeap<SimTime> {
    IndexedMinHeap::new(|a, b| a.cmp(b), |t| t.nanos())
}

// ---------------------------------------------------------------------------
// The connection
// ---------------------------------------------------------------------------

/// One stream socket's transport state.
pub struct TcpConnection {
    pub(crate) local: SockAddr,
    pub(crate) peer: Option<SockAddr>,
    pub(crate) state: TcpState,
    pub(crate) flags: ConnFlags,
    pub(crate) error: ConnError,
    cfg: Arc<TcpConfig>,

    pub(crate) recv: ReceiveState,
    pub(crate) send: SendState,
    pub(crate) rtx: RetransmitState,
    pub(crate) cong: CongestionWindow,
    cong_mod: Box<dyn CongestionModule>,
    pub(crate) rtt: RttState,
    pub(crate) auto: Autotune,

    /// Packets produced but held back by the send window.
    throttled_output: IndexedMinHeap<Arc<Packet>>,
    throttled_bytes: usize,
    /// Accepted in-window packets not yet deliverable in order.
    unordered_input: IndexedMinHeap<Arc<Packet>>,
    unordered_bytes: usize,
    /// In-order data awaiting the user.
    input_buffer: VecDeque<Arc<Packet>>,
    input_bytes: usize,
    /// Read cursor into the front input packet (split reads).
    partial_offset: usize,

    pub(crate) send_buf_size: usize,
    pub(crate) recv_buf_size: usize,

    pub(crate) desc: Descriptor,
    pub(crate) server: Option<ServerState>,
    pub(crate) child: Option<ChildState>,
    pub(crate) stats: ConnStats,
}

impl TcpConnection {
    /// A fresh closed connection bound to `local`.
    pub fn new(local: SockAddr, cfg: Arc<TcpConfig>) -> Self {
        let recv_window = (cfg.recv_buf_initial / cfg.mss) as u32;
        let initial_rto = cfg.rto_initial_ms.clamp(cfg.rto_min_ms, cfg.rto_max_ms);
        let initial_cwnd = cfg.initial_cwnd;
        let send_buf = cfg.send_buf_initial;
        let recv_buf = cfg.recv_buf_initial;
        let autotune = cfg.autotune;
        Self {
            local,
            peer: None,
            state: TcpState::Closed,
            flags: ConnFlags::empty(),
            error: ConnError::empty(),
            recv: ReceiveState {
                start: 0,
                next: 0,
                window: recv_window,
                end: None,
                recovery_point: 0,
                last_window_adv: recv_window,
                last_ack_sent: 0,
                sacked: BTreeSet::new(),
            },
            send: SendState {
                unacked: 0,
                next: 1,
                window: initial_cwnd,
                end: None,
                last_ack_rcvd: 0,
                last_window_rcvd: initial_cwnd,
                highest_sent: 0,
                packets_sent: 0,
                quick_acks: 0,
                delayed_ack_scheduled: false,
                last_ts_recv: 0,
            },
            rtx: RetransmitState {
                map: HashMap::new(),
                queue_bytes: 0,
                rto_ms: initial_rto,
                scheduled: time_queue(),
                desired: None,
                backoff_count: 0,
                tally: RetransmitTally::new(),
            },
            cong: CongestionWindow::new(initial_cwnd),
            cong_mod: Box::new(Reno::new()),
            rtt: RttState {
                srtt_ms: 0,
                rttvar_ms: 0,
                has_sample: false,
            },
            auto: Autotune {
                enabled: autotune,
                initialized: false,
                user_disabled_send: false,
                user_disabled_recv: false,
                bytes_copied: 0,
                last_adjust: SimTime::ZERO,
                space: recv_buf,
            },
            throttled_output: packet_queue(),
            throttled_bytes: 0,
            unordered_input: packet_queue(),
            unordered_bytes: 0,
            input_buffer: VecDeque::new(),
            input_bytes: 0,
            partial_offset: 0,
            send_buf_size: send_buf,
            recv_buf_size: recv_buf,
            desc: Descriptor::new(),
            server: None,
            child: None,
            stats: ConnStats::default(),
            cfg,
        }
    }

    /// A child connection spawned by a listener for `peer`.  Starts in
    /// SYN_RECEIVED with the peer's SYN consumed; call
    /// [`on_child_spawned`](Self::on_child_spawned) to emit the SYN+ACK.
    pub fn new_child(local: SockAddr, peer: SockAddr, cfg: Arc<TcpConfig>) -> Self {
        let mut conn = Self::new(local, cfg);
        conn.peer = Some(peer);
        conn.state = TcpState::SynReceived;
        conn.recv.start = 1;
        conn.recv.next = 1;
        conn
    }

    // -- small accessors ---------------------------------------------------

    #[inline]
    pub fn state(&self) -> TcpState {
        self.state
    }

    #[inline]
    pub fn local(&self) -> SockAddr {
        self.local
    }

    #[inline]
    pub fn peer(&self) -> Option<SockAddr> {
        self.peer
    }

    #[inline]
    pub fn status(&self) -> DescriptorStatus {
        self.desc.status()
    }

    pub fn add_status_listener(&mut self, listener: Arc<StatusListener>) {
        self.desc.add_listener(listener);
    }

    /// Bytes of user-readable data buffered.
    #[inline]
    pub fn input_buffered(&self) -> usize {
        self.input_bytes
    }

    /// Spare room in the outgoing direction, in bytes.
    pub fn buffer_space_out(&self) -> usize {
        self.send_buf_size
            .saturating_sub(self.throttled_bytes + self.rtx.queue_bytes)
    }

    /// `true` once both the output queue and the retransmit map drained.
    pub fn output_drained(&self) -> bool {
        self.throttled_output.is_empty() && self.rtx.map.is_empty()
    }

    /// The connection can be destroyed: CLOSED, user closed the
    /// descriptor, and (for servers) every child is gone.
    pub fn reapable(&self) -> bool {
        self.state == TcpState::Closed
            && self.desc.status().contains(DescriptorStatus::CLOSED)
            && self.server.as_ref().is_none_or(|s| s.children.is_empty())
    }

    // -- user operations ---------------------------------------------------

    /// Begin a non-blocking connect to `peer`.  Emits the SYN; completion
    /// is signalled by the descriptor turning writable.
    pub fn connect(&mut self, peer: SockAddr, env: &mut TcpEnv<'_>) -> Result<(), SockError> {
        match self.state {
            TcpState::Closed => {}
            TcpState::SynSent | TcpState::SynReceived => return Err(SockError::Already),
            TcpState::Listen => return Err(SockError::InvalidState),
            _ => return Err(SockError::Already),
        }
        self.peer = Some(peer);
        self.state = TcpState::SynSent;
        self.flags |= ConnFlags::CONNECT_SIGNAL;
        log::debug!("{} -> {}: SYN_SENT", self.local, peer);

        let mut header = TcpHeader::control(self.local, peer, TcpFlags::SYN, env.now());
        header.window = self.recv.last_window_adv;
        self.enqueue_output(Arc::new(Packet::control(header)));
        self.flush(env);
        Ok(())
    }

    /// Move a closed socket into LISTEN.
    pub fn listen(&mut self, backlog: usize) -> Result<(), SockError> {
        if self.state != TcpState::Closed {
            return Err(SockError::InvalidState);
        }
        self.state = TcpState::Listen;
        self.server = Some(ServerState {
            backlog_limit: backlog.max(1),
            backlog: VecDeque::new(),
            children: HashMap::new(),
            last_peer: None,
        });
        log::debug!("{}: LISTEN (backlog {})", self.local, backlog);
        Ok(())
    }

    /// Second half of child spawning: emit the SYN+ACK and arm its
    /// retransmission.
    pub fn on_child_spawned(&mut self, env: &mut TcpEnv<'_>) {
        let peer = self.peer.expect("child has a peer");
        let mut header = TcpHeader::control(
            self.local,
            peer,
            TcpFlags::SYN | TcpFlags::ACK,
            env.now(),
        );
        header.ack = self.recv.next;
        header.window = self.recv.last_window_adv;
        header.ts_echo = self.send.last_ts_recv;
        self.enqueue_output(Arc::new(Packet::control(header)));
        self.flush(env);
        log::debug!("{} -> {}: SYN_RECEIVED", self.local, peer);
    }

    /// Accept user bytes for transmission.  Returns the number queued.
    pub fn send_user_data(&mut self, data: &[u8], env: &mut TcpEnv<'_>) -> Result<usize, SockError> {
        if let Some(err) = self.send_error() {
            return Err(err);
        }
        match self.state {
            TcpState::Established | TcpState::CloseWait => {}
            TcpState::Closed | TcpState::Listen => return Err(SockError::NotConnected),
            TcpState::SynSent | TcpState::SynReceived => return Err(SockError::WouldBlock),
            _ => return Err(SockError::NotConnected),
        }

        let n = data.len().min(MAX_SEND_CHUNK).min(self.buffer_space_out());
        if n == 0 {
            return Err(SockError::WouldBlock);
        }

        let peer = self.peer.expect("connected socket has a peer");
        let mut offset = 0;
        while offset < n {
            let take = (n - offset).min(self.cfg.mss);
            let seq = self.send.next;
            self.send.next += 1;
            let header = TcpHeader {
                src: self.local,
                dst: peer,
                seq,
                ack: self.recv.next,
                window: self.recv.last_window_adv,
                flags: TcpFlags::ACK,
                sacks: self.sack_ranges(),
                ts_val: env.now().nanos(),
                ts_echo: self.send.last_ts_recv,
            };
            let payload = Bytes::copy_from_slice(&data[offset..offset + take]);
            self.enqueue_output(Arc::new(Packet::new(header, payload)));
            offset += take;
        }
        self.flush(env);
        Ok(n)
    }

    /// Copy buffered in-order data to the user.
    pub fn recv_user_data(
        &mut self,
        buf: &mut [u8],
        env: &mut TcpEnv<'_>,
    ) -> Result<usize, SockError> {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.input_buffer.front() else {
                break;
            };
            let avail = front.len() - self.partial_offset;
            let take = avail.min(buf.len() - copied);
            buf[copied..copied + take]
                .copy_from_slice(&front.payload[self.partial_offset..self.partial_offset + take]);
            copied += take;
            self.partial_offset += take;
            if self.partial_offset == front.len() {
                self.input_buffer.pop_front();
                self.partial_offset = 0;
            }
        }

        if copied == 0 {
            if self.error.contains(ConnError::CONN_RESET) {
                return Err(self.reset_error());
            }
            if self.error.contains(ConnError::RECV_EOF) {
                if self.flags.contains(ConnFlags::RECV_EOF_SIGNALED) {
                    return Err(SockError::NotConnected);
                }
                self.flags |= ConnFlags::RECV_EOF_SIGNALED;
                return Ok(0);
            }
            return match self.state {
                TcpState::Closed | TcpState::Listen => Err(SockError::NotConnected),
                _ => Err(SockError::WouldBlock),
            };
        }

        self.input_bytes -= copied;
        let window_was_zero = self.recv.last_window_adv == 0;
        self.autotune_on_read(copied, env);
        self.update_receive_window();
        if window_was_zero && self.recv.last_window_adv > 0 && self.state.is_connected() {
            // Reopen a window the peer saw as closed.
            self.emit_ack(env, false);
        }
        self.refresh_status();
        Ok(copied)
    }

    /// Half-close one or both directions.
    pub fn shutdown(&mut self, how: ShutdownHow, env: &mut TcpEnv<'_>) -> Result<(), SockError> {
        if !self.state.is_connected() {
            return Err(SockError::NotConnected);
        }
        if matches!(how, ShutdownHow::Read | ShutdownHow::Both) {
            self.error |= ConnError::RECV_EOF;
        }
        if matches!(how, ShutdownHow::Write | ShutdownHow::Both)
            && !self.flags.contains(ConnFlags::HALF_CLOSED)
        {
            self.flags |= ConnFlags::HALF_CLOSED;
            self.error |= ConnError::SEND_EOF;
            self.queue_fin(env);
        }
        self.flush(env);
        Ok(())
    }

    /// Close the socket.  With data still queued the FIN is deferred until
    /// the output drains.
    pub fn close(&mut self, env: &mut TcpEnv<'_>) {
        self.desc.adjust(DescriptorStatus::CLOSED, true);
        self.desc.adjust(DescriptorStatus::ACTIVE, false);
        match self.state {
            TcpState::Closed => {}
            TcpState::Listen => {
                // Server teardown waits for the children; reaping checks.
                if self.server.as_ref().is_some_and(|s| s.children.is_empty()) {
                    self.state = TcpState::Closed;
                }
            }
            TcpState::SynSent | TcpState::SynReceived => {
                self.rtx.desired = None;
                self.enter_closed(env);
            }
            TcpState::Established | TcpState::CloseWait => {
                self.error |= ConnError::SEND_EOF;
                self.queue_fin(env);
                self.flush(env);
            }
            _ => {}
        }
    }

    // -- packet receive path ----------------------------------------------

    /// Process one inbound packet.
    pub fn process_packet(&mut self, pkt: &Packet, env: &mut TcpEnv<'_>) {
        let header = &pkt.header;

        if header.is_rst() {
            self.handle_rst(env);
            return;
        }
        if header.ts_val != 0 {
            self.send.last_ts_recv = header.ts_val;
        }

        match self.state {
            // Stray packets on closed or listening sockets are dropped
            // (SYNs never reach here; the host spawns children for them).
            TcpState::Closed | TcpState::Listen => {
                log::debug!("{}: dropping stray packet in {:?}", self.local, self.state);
                return;
            }
            TcpState::SynSent => {
                if header.is_syn_ack() {
                    self.recv.start = 1;
                    self.recv.next = 1;
                    self.enter_established();
                    self.process_ack(header, env);
                    self.emit_ack(env, false);
                } else {
                    log::debug!("{}: unexpected packet in SYN_SENT", self.local);
                }
                self.flush(env);
                return;
            }
            TcpState::SynReceived => {
                if header.has_ack() && !header.is_syn_ack() {
                    self.enter_established();
                    self.process_ack(header, env);
                    env.notify(ConnNotice::ChildEstablished);
                    // The completing ACK may carry data; fall through.
                } else {
                    // A duplicate SYN: re-send the SYN+ACK from the map.
                    if let Some(synack) = self.rtx.map.get(&0) {
                        env.emit_shared(Arc::clone(synack));
                    }
                    self.flush(env);
                    return;
                }
            }
            _ => {}
        }

        // Connected-family processing.
        let mut immediate_dup_ack = false;
        let mut in_order_data = false;

        if header.is_fin() {
            self.handle_fin(header, env);
        }

        if !pkt.payload.is_empty() && pkt.is_sequenced() {
            match self.process_data(pkt, env) {
                DataVerdict::InOrder => in_order_data = true,
                DataVerdict::OutOfOrder | DataVerdict::Duplicate | DataVerdict::OutOfWindow => {
                    immediate_dup_ack = true
                }
            }
        }

        if header.has_ack() {
            self.process_ack(header, env);
        }

        if immediate_dup_ack {
            self.flush(env);
            self.emit_ack(env, true);
        } else if in_order_data {
            self.flush(env);
            self.schedule_delayed_ack(env);
        } else {
            self.flush(env);
        }
    }

    fn handle_rst(&mut self, env: &mut TcpEnv<'_>) {
        if self.flags.contains(ConnFlags::RESET_SIGNALED) || self.state == TcpState::Listen {
            return;
        }
        log::debug!("{}: RST received in {:?}", self.local, self.state);
        self.flags |= ConnFlags::RESET_SIGNALED;
        self.error |= ConnError::CONN_RESET;
        // Cap the stream: nothing past what we already have will arrive.
        self.recv.end = Some(self.recv.next);
        self.rtx.desired = None;
        self.state = TcpState::TimeWait;
        env.schedule_timer(
            TimerKind::Close,
            env.now() + self.cfg.time_wait_ms * NANOS_PER_MSEC,
        );
        self.refresh_status();
    }

    fn handle_fin(&mut self, header: &TcpHeader, env: &mut TcpEnv<'_>) {
        let fin_seq = header.seq;
        if self.recv.end.is_none() {
            self.recv.end = Some(fin_seq);
            self.error |= ConnError::SEND_EOF;
            if fin_seq == self.recv.next {
                self.recv.next += 1;
            }
        } else if fin_seq == self.recv.next {
            // Retransmitted FIN arriving in order.
            self.recv.next += 1;
        }

        let prev = self.state;
        match self.state {
            TcpState::Established => self.state = TcpState::CloseWait,
            TcpState::FinWait1 => self.state = TcpState::Closing,
            TcpState::FinWait2 => self.enter_time_wait(env),
            // Duplicate FIN in any later state: just re-acknowledge.
            _ => {}
        }
        if prev != self.state {
            log::debug!("{}: {:?} -> {:?} (FIN)", self.local, prev, self.state);
        }
        self.emit_fin_ack(env);
    }

    /// Verdict of the data-acceptance check.
    fn process_data(&mut self, pkt: &Packet, env: &mut TcpEnv<'_>) -> DataVerdict {
        let seq = pkt.header.seq;
        self.stats.last_data_recv = env.now();

        if seq < self.recv.next {
            return DataVerdict::Duplicate;
        }
        if seq >= self.recv.next + self.recv.window {
            // Drop-with-status: annotated, never an error.
            log::debug!(
                "{}: seq {} outside window [{}, {})",
                self.local,
                seq,
                self.recv.next,
                self.recv.next + self.recv.window
            );
            return DataVerdict::OutOfWindow;
        }
        if self.unordered_input.contains(u64::from(seq)) {
            return DataVerdict::Duplicate;
        }

        self.unordered_bytes += pkt.len();
        self.unordered_input.push(Arc::new(pkt.clone()));
        if seq == self.recv.next {
            DataVerdict::InOrder
        } else {
            self.recv.sacked.insert(seq);
            DataVerdict::OutOfOrder
        }
    }

    fn process_ack(&mut self, header: &TcpHeader, env: &mut TcpEnv<'_>) {
        let ack = header.ack;
        self.stats.last_ack_recv = env.now();
        self.send.last_window_rcvd = header.window;

        let mut packets_acked = 0;
        if ack > self.send.unacked && ack <= self.send.next {
            packets_acked = ack - self.send.unacked;
            for seq in self.send.unacked..ack {
                if let Some(pkt) = self.rtx.map.remove(&seq) {
                    self.rtx.queue_bytes -= pkt.len();
                }
            }
            self.send.unacked = ack;
            self.send.last_ack_rcvd = ack;

            if header.ts_echo != 0 {
                let sample_ns = env.now().nanos().saturating_sub(header.ts_echo);
                self.note_rtt_sample(sample_ns, env);
            }
            if self.rtx.map.is_empty() {
                // Everything in flight is acknowledged.
                self.rtx.desired = None;
            } else {
                self.set_retransmit_timer(env);
            }
        }

        // Feed the tally: selective acks first, then the cumulative ack.
        self.rtx.tally.mark_sacked(&header.sacks);
        self.rtx
            .tally
            .update(ack, self.send.highest_sent + 1, header.is_dup_ack());

        if packets_acked > 0 {
            self.cong_mod.new_ack(&mut self.cong, packets_acked);
            if self.cong.state != RecoveryState::Open
                && self.send.unacked >= self.recv.recovery_point
            {
                self.cong.state = RecoveryState::Open;
            }
            self.autotune_on_ack(env);
        } else if header.is_dup_ack() {
            let was_open = self.cong.state == RecoveryState::Open;
            self.cong_mod.duplicate_ack(&mut self.cong);
            if was_open && self.cong.state == RecoveryState::Recovery {
                self.recv.recovery_point = self.send.next;
            }
        }

        // Our FIN acknowledged?
        if let Some(end) = self.send.end {
            if self.send.unacked > end {
                let prev = self.state;
                match self.state {
                    TcpState::FinWait1 => self.state = TcpState::FinWait2,
                    TcpState::Closing => self.enter_time_wait(env),
                    TcpState::LastAck => self.enter_closed(env),
                    _ => {}
                }
                if prev != self.state {
                    log::debug!("{}: {:?} -> {:?} (FIN acked)", self.local, prev, self.state);
                }
            }
        }
    }

    // -- timers ------------------------------------------------------------

    /// Retransmission timer task.  Consults the desired-expiration marker:
    /// a cleared or postponed marker turns the task into a no-op or a
    /// reschedule.
    pub fn on_retransmit_timer(&mut self, env: &mut TcpEnv<'_>) {
        while let Some(&t) = self.rtx.scheduled.peek() {
            if t <= env.now() {
                self.rtx.scheduled.pop();
            } else {
                break;
            }
        }
        match self.rtx.desired {
            None => {}
            Some(desired) if desired > env.now() => {
                let need_task = self.rtx.scheduled.peek().is_none_or(|&t| t > desired);
                if need_task {
                    self.rtx.scheduled.push(desired);
                    env.schedule_timer(TimerKind::Retransmit, desired);
                }
            }
            Some(_) => self.expire_retransmit(env),
        }
    }

    fn expire_retransmit(&mut self, env: &mut TcpEnv<'_>) {
        self.rtx.rto_ms = (self.rtx.rto_ms.saturating_mul(2))
            .clamp(self.cfg.rto_min_ms, self.cfg.rto_max_ms);
        self.rtx.backoff_count += 1;
        log::debug!(
            "{}: RTO expired, backoff {} (rto {} ms)",
            self.local,
            self.rtx.backoff_count,
            self.rtx.rto_ms
        );

        self.cong_mod.timeout(&mut self.cong);
        self.recv.recovery_point = self.send.next;
        self.rtx
            .tally
            .mark_lost(self.send.last_ack_rcvd, self.send.highest_sent + 1);
        self.rtx.tally.clear_retransmitted();
        self.rtx.desired = None;
        self.flush(env);
    }

    /// Delayed-ACK timer task; a cleared flag means a piggyback ACK
    /// already went out.
    pub fn on_delayed_ack_timer(&mut self, env: &mut TcpEnv<'_>) {
        if self.send.delayed_ack_scheduled {
            self.emit_ack(env, false);
        }
    }

    /// Close timer task (TIME_WAIT dwell, and RST teardown).
    pub fn on_close_timer(&mut self, env: &mut TcpEnv<'_>) {
        if self.state == TcpState::TimeWait {
            self.enter_closed(env);
        }
    }

    fn set_retransmit_timer(&mut self, env: &mut TcpEnv<'_>) {
        let desired = env.now() + u64::from(self.rtx.rto_ms) * NANOS_PER_MSEC;
        self.rtx.desired = Some(desired);
        let need_task = self.rtx.scheduled.peek().is_none_or(|&t| t > desired);
        if need_task {
            self.rtx.scheduled.push(desired);
            env.schedule_timer(TimerKind::Retransmit, desired);
        }
    }

    fn schedule_delayed_ack(&mut self, env: &mut TcpEnv<'_>) {
        if self.send.delayed_ack_scheduled {
            return;
        }
        self.send.delayed_ack_scheduled = true;
        let delay_ms = if self.send.quick_acks < self.cfg.quick_ack_threshold {
            self.cfg.delayed_ack_early_ms
        } else {
            self.cfg.delayed_ack_late_ms
        };
        self.send.quick_acks += 1;
        env.schedule_timer(TimerKind::DelayedAck, env.now() + delay_ms * NANOS_PER_MSEC);
    }

    // -- RTT / RTO ---------------------------------------------------------

    /// RFC 6298.  First sample initialises SRTT/RTTVAR; later samples blend
    /// with gains 1/8 and 1/4.
    fn note_rtt_sample(&mut self, sample_ns: u64, env: &mut TcpEnv<'_>) {
        let r = ((sample_ns / NANOS_PER_MSEC) as u32).max(1);
        if !self.rtt.has_sample {
            self.rtt.has_sample = true;
            self.rtt.srtt_ms = r;
            self.rtt.rttvar_ms = r / 2;
            self.autotune_init(env);
        } else {
            let srtt = self.rtt.srtt_ms;
            let diff = srtt.abs_diff(r);
            self.rtt.rttvar_ms = (3 * self.rtt.rttvar_ms + diff) / 4;
            self.rtt.srtt_ms = (7 * srtt + r) / 8;
        }
        self.rtx.rto_ms = (self.rtt.srtt_ms + 4 * self.rtt.rttvar_ms)
            .clamp(self.cfg.rto_min_ms, self.cfg.rto_max_ms);
    }

    // -- flush -------------------------------------------------------------

    /// The four-stage output pump: refresh windows, requeue tally-lost
    /// packets, drain the throttled output into the wire, deliver in-order
    /// input — then the post-flush housekeeping (deferred FIN, EOF
    /// signalling, status refresh).
    pub fn flush(&mut self, env: &mut TcpEnv<'_>) {
        self.update_send_window();
        self.update_receive_window();
        self.requeue_lost(env);
        self.drain_output(env);
        self.deliver_in_order();

        if self.flags.contains(ConnFlags::WRITE_FIN_PENDING) && self.throttled_output.is_empty() {
            self.flags.remove(ConnFlags::WRITE_FIN_PENDING);
            self.emit_fin(env);
            self.drain_output(env);
        }

        if let Some(end) = self.recv.end {
            if self.recv.next >= end {
                self.error |= ConnError::RECV_EOF;
            }
        }
        self.refresh_status();
    }

    /// Flush stage 2: pull every tally-lost sequence out of the retransmit
    /// map and requeue it for sending.
    fn requeue_lost(&mut self, env: &mut TcpEnv<'_>) {
        if self.rtx.tally.nothing_lost() {
            return;
        }
        let mut lost = Vec::new();
        self.rtx.tally.populate_lost_ranges(&mut lost);
        for range in &lost {
            for seq in range.begin..range.end {
                if let Some(pkt) = self.rtx.map.remove(&seq) {
                    self.rtx.queue_bytes -= pkt.len();
                    // Fresh send timestamp so the echoed RTT stays honest.
                    let mut repkt = (*pkt).clone();
                    repkt.header.ts_val = env.now().nanos();
                    self.throttled_bytes += repkt.len();
                    self.throttled_output.push(Arc::new(repkt));
                    self.stats.total_retrans += 1;
                    log::debug!("{}: requeueing lost seq {}", self.local, seq);
                }
            }
            self.rtx.tally.mark_retransmitted(range.begin, range.end);
        }
    }

    /// Flush stage 3: emit throttled packets while the send window and the
    /// destination-facing buffer allow.
    fn drain_output(&mut self, env: &mut TcpEnv<'_>) {
        while let Some(head) = self.throttled_output.peek() {
            let seq = head.header.seq;
            let retransmittable =
                head.is_sequenced() || head.header.flags.contains(TcpFlags::SYN);
            if retransmittable && seq >= self.send.unacked + self.send.window {
                break;
            }
            if !env.has_buffer_space() {
                break;
            }
            let pkt = self.throttled_output.pop().expect("peeked head");
            self.throttled_bytes -= pkt.len();

            if retransmittable {
                self.rtx.queue_bytes += pkt.len();
                self.rtx.map.insert(seq, Arc::clone(&pkt));
                self.send.highest_sent = self.send.highest_sent.max(seq);
                self.send.packets_sent += 1;
                self.set_retransmit_timer(env);
            }
            if pkt.header.has_ack() {
                // Piggyback acknowledgment cancels any pending delayed ACK.
                self.send.delayed_ack_scheduled = false;
                self.recv.last_ack_sent = pkt.header.ack;
                self.stats.last_ack_sent = env.now();
            }
            if !pkt.payload.is_empty() {
                self.stats.last_data_sent = env.now();
            }
            env.emit_shared(pkt);
        }
    }

    /// Flush stage 4: move in-order packets from the reassembly queue into
    /// the user-readable buffer.
    fn deliver_in_order(&mut self) {
        while let Some(head) = self.unordered_input.peek() {
            if head.header.seq != self.recv.next {
                break;
            }
            let pkt = self.unordered_input.pop().expect("peeked head");
            self.unordered_bytes -= pkt.len();
            self.recv.sacked.remove(&pkt.header.seq);
            self.recv.next += 1;
            self.input_bytes += pkt.len();
            self.input_buffer.push_back(pkt);
        }
    }

    fn update_send_window(&mut self) {
        self.send.window = self.cong.cwnd.min(self.send.last_window_rcvd);
    }

    fn update_receive_window(&mut self) {
        let space = self
            .recv_buf_size
            .saturating_sub(self.input_bytes + self.unordered_bytes);
        let mut window = (space / self.cfg.mss) as u32;
        if window == 0 && self.input_bytes == 0 {
            // Never stall the peer while the user has nothing to read.
            window = 1;
        }
        self.recv.window = window;
        self.recv.last_window_adv = window;
    }

    // -- emission helpers --------------------------------------------------

    fn enqueue_output(&mut self, pkt: Arc<Packet>) {
        self.throttled_bytes += pkt.len();
        self.throttled_output.push(pkt);
    }

    /// Queue our FIN: it consumes a sequence number and is retransmitted
    /// like data.  If output is still pending the FIN is deferred.
    fn queue_fin(&mut self, env: &mut TcpEnv<'_>) {
        if self.send.end.is_some() || self.flags.contains(ConnFlags::WRITE_FIN_PENDING) {
            return;
        }
        if self.throttled_output.is_empty() {
            self.emit_fin(env);
        } else {
            self.flags |= ConnFlags::WRITE_FIN_PENDING;
            log::debug!("{}: FIN deferred until output drains", self.local);
        }
    }

    fn emit_fin(&mut self, env: &mut TcpEnv<'_>) {
        let peer = self.peer.expect("connected socket has a peer");
        let seq = self.send.next;
        self.send.next += 1;
        self.send.end = Some(seq);

        let mut header = TcpHeader::control(self.local, peer, TcpFlags::FIN, env.now());
        header.seq = seq;
        header.ack = self.recv.next;
        header.window = self.recv.last_window_adv;
        header.ts_echo = self.send.last_ts_recv;
        self.enqueue_output(Arc::new(Packet::control(header)));

        let prev = self.state;
        match self.state {
            TcpState::Established => self.state = TcpState::FinWait1,
            TcpState::CloseWait => self.state = TcpState::LastAck,
            _ => {}
        }
        log::debug!("{}: {:?} -> {:?} (FIN seq {})", self.local, prev, self.state, seq);
    }

    /// Acknowledge a received FIN: a control segment with FIN|ACK.
    fn emit_fin_ack(&mut self, env: &mut TcpEnv<'_>) {
        let peer = self.peer.expect("connected socket has a peer");
        self.update_receive_window();
        let mut header = TcpHeader::control(
            self.local,
            peer,
            TcpFlags::FIN | TcpFlags::ACK,
            env.now(),
        );
        header.ack = self.recv.next;
        header.window = self.recv.last_window_adv;
        header.ts_echo = self.send.last_ts_recv;
        self.recv.last_ack_sent = self.recv.next;
        self.send.delayed_ack_scheduled = false;
        self.stats.last_ack_sent = env.now();
        env.emit(Packet::control(header));
    }

    /// A pure acknowledgment; `dup` marks it as repeating the previous one.
    fn emit_ack(&mut self, env: &mut TcpEnv<'_>, dup: bool) {
        let Some(peer) = self.peer else { return };
        self.update_receive_window();
        let mut flags = TcpFlags::ACK;
        if dup {
            flags |= TcpFlags::DUPACK;
        }
        let mut header = TcpHeader::control(self.local, peer, flags, env.now());
        header.ack = self.recv.next;
        header.window = self.recv.last_window_adv;
        header.sacks = self.sack_ranges();
        header.ts_echo = self.send.last_ts_recv;
        self.recv.last_ack_sent = self.recv.next;
        self.send.delayed_ack_scheduled = false;
        self.stats.last_ack_sent = env.now();
        env.emit(Packet::control(header));
    }

    /// Compress the out-of-order set into coalesced half-open ranges.
    fn sack_ranges(&self) -> Vec<SeqRange> {
        let mut ranges: Vec<SeqRange> = Vec::new();
        for &seq in &self.recv.sacked {
            match ranges.last_mut() {
                Some(last) if last.end == seq => last.end = seq + 1,
                _ => ranges.push(SeqRange::new(seq, seq + 1)),
            }
        }
        ranges
    }

    // -- state transitions -------------------------------------------------

    fn enter_established(&mut self) {
        let prev = self.state;
        self.state = TcpState::Established;
        self.flags |= ConnFlags::ESTABLISHED_ONCE;
        self.flags.remove(ConnFlags::CONNECT_SIGNAL);
        log::debug!("{}: {:?} -> ESTABLISHED", self.local, prev);
    }

    fn enter_time_wait(&mut self, env: &mut TcpEnv<'_>) {
        self.state = TcpState::TimeWait;
        env.schedule_timer(
            TimerKind::Close,
            env.now() + self.cfg.time_wait_ms * NANOS_PER_MSEC,
        );
    }

    fn enter_closed(&mut self, env: &mut TcpEnv<'_>) {
        self.state = TcpState::Closed;
        self.rtx.desired = None;
        self.cong_mod.delete(&self.cong);
        if self.child.is_some() {
            env.notify(ConnNotice::ChildClosed);
        }
        self.refresh_status();
    }

    // -- errors ------------------------------------------------------------

    fn reset_error(&self) -> SockError {
        if self.flags.contains(ConnFlags::ESTABLISHED_ONCE) {
            SockError::ConnectionReset
        } else {
            SockError::ConnectionRefused
        }
    }

    fn send_error(&mut self) -> Option<SockError> {
        if self.error.contains(ConnError::CONN_RESET) {
            return Some(self.reset_error());
        }
        if self.error.contains(ConnError::SEND_EOF) {
            if self.flags.contains(ConnFlags::SEND_EOF_SIGNALED) {
                return Some(SockError::NotConnected);
            }
            self.flags |= ConnFlags::SEND_EOF_SIGNALED;
            return Some(SockError::BrokenPipe);
        }
        None
    }

    // -- autotuning --------------------------------------------------------

    /// KiB/s sustained for `ms` milliseconds, in bytes.
    fn bandwidth_delay_bytes(bw_kib: u64, ms: u64) -> usize {
        (bw_kib * 1024 * ms / 1000) as usize
    }

    /// One-time sizing on the first RTT sample.
    fn autotune_init(&mut self, env: &mut TcpEnv<'_>) {
        if !self.auto.enabled || self.auto.initialized {
            return;
        }
        self.auto.initialized = true;
        let rtt_ms = u64::from(self.rtt.srtt_ms);

        if env.is_loopback() {
            if !self.auto.user_disabled_send {
                self.send_buf_size = self.cfg.send_buf_max;
            }
            if !self.auto.user_disabled_recv {
                self.recv_buf_size = self.cfg.recv_buf_max;
            }
        } else {
            let up = env.bw_up_self().min(env.bw_down_peer());
            let down = env.bw_down_self().min(env.bw_up_peer());
            if !self.auto.user_disabled_send {
                let bdp = Self::bandwidth_delay_bytes(up, rtt_ms) * 5 / 4;
                self.send_buf_size = bdp.clamp(self.cfg.send_buf_min, self.cfg.send_buf_max);
            }
            if !self.auto.user_disabled_recv {
                let bdp = Self::bandwidth_delay_bytes(down, rtt_ms) * 5 / 4;
                self.recv_buf_size = bdp.clamp(self.cfg.recv_buf_min, self.cfg.recv_buf_max);
            }
        }
        self.auto.space = self.recv_buf_size;
        self.auto.last_adjust = env.now();
        log::trace!(
            "{}: autotune init snd {} rcv {} (rtt {} ms)",
            self.local,
            self.send_buf_size,
            self.recv_buf_size,
            rtt_ms
        );
    }

    /// Read-driven receive-buffer growth.
    fn autotune_on_read(&mut self, copied: usize, env: &mut TcpEnv<'_>) {
        if !self.auto.enabled || self.auto.user_disabled_recv {
            return;
        }
        self.auto.bytes_copied += copied as u64;
        if 2 * self.auto.bytes_copied > self.recv_buf_size as u64 {
            let cap = Self::bandwidth_delay_bytes(env.bw_down_self(), u64::from(self.rtt.srtt_ms))
                .saturating_mul(10);
            let grown = (2 * self.auto.bytes_copied as usize).min(cap.max(self.cfg.recv_buf_min));
            if grown > self.recv_buf_size {
                self.recv_buf_size = grown.min(self.cfg.recv_buf_max);
                self.auto.space = self.recv_buf_size;
                log::trace!("{}: autotune rcv -> {}", self.local, self.recv_buf_size);
            }
        }
        // The copied-byte counter resets every smoothed RTT.
        let srtt_ns = u64::from(self.rtt.srtt_ms) * NANOS_PER_MSEC;
        if env.now().saturating_since(self.auto.last_adjust) >= srtt_ns {
            self.auto.bytes_copied = 0;
            self.auto.last_adjust = env.now();
        }
    }

    /// Ack-driven send-buffer sizing.
    fn autotune_on_ack(&mut self, env: &mut TcpEnv<'_>) {
        if !self.auto.enabled || !self.auto.initialized || self.auto.user_disabled_send {
            return;
        }
        let cap = Self::bandwidth_delay_bytes(env.bw_up_self(), u64::from(self.rtt.srtt_ms))
            .saturating_mul(10);
        let target = (2 * self.cong.cwnd as usize * 2404).min(cap.max(self.cfg.send_buf_min));
        self.send_buf_size = target.clamp(self.cfg.send_buf_min, self.cfg.send_buf_max);
    }

    /// User override: pin a buffer size and opt that direction out of
    /// autotuning for good (the opt-out is one-shot sticky).
    pub fn set_send_buffer(&mut self, bytes: usize) {
        self.auto.user_disabled_send = true;
        self.send_buf_size = bytes.clamp(self.cfg.send_buf_min, self.cfg.send_buf_max);
    }

    pub fn set_recv_buffer(&mut self, bytes: usize) {
        self.auto.user_disabled_recv = true;
        self.recv_buf_size = bytes.clamp(self.cfg.recv_buf_min, self.cfg.recv_buf_max);
    }

    // -- status ------------------------------------------------------------

    /// Recompute the readable/writable bits from the buffer and error
    /// state.
    pub(crate) fn refresh_status(&mut self) {
        let readable = self.input_bytes > 0
            || self.error.contains(ConnError::RECV_EOF)
            || self.error.contains(ConnError::CONN_RESET)
            || self.server.as_ref().is_some_and(|s| !s.backlog.is_empty());
        let writable = self.error.contains(ConnError::CONN_RESET)
            || (matches!(self.state, TcpState::Established | TcpState::CloseWait)
                && !self.flags.contains(ConnFlags::HALF_CLOSED)
                && self.buffer_space_out() > 0);
        self.desc.adjust(DescriptorStatus::READABLE, readable);
        self.desc.adjust(DescriptorStatus::WRITABLE, writable);
    }

    // -- info --------------------------------------------------------------

    /// The `tcp_info`-shaped public snapshot.
    pub fn info(&self) -> TcpInfo {
        let mss = self.cfg.mss as u32;
        TcpInfo {
            state: self.state.linux_code(),
            snd_mss: mss,
            rcv_mss: mss,
            unacked: self.send.next.saturating_sub(self.send.unacked.max(1)),
            retransmits: self.rtx.backoff_count,
            last_data_sent_us: self.stats.last_data_sent.as_usecs(),
            last_ack_sent_us: self.stats.last_ack_sent.as_usecs(),
            last_data_recv_us: self.stats.last_data_recv.as_usecs(),
            last_ack_recv_us: self.stats.last_ack_recv.as_usecs(),
            pmtu: mss + 40,
            rtt_us: self.rtt.srtt_ms * 1_000,
            rttvar_us: self.rtt.rttvar_ms * 1_000,
            snd_ssthresh: self.cong.ssthresh,
            snd_cwnd: self.cong.cwnd,
            advmss: mss,
            rcv_rtt_us: self.rtt.srtt_ms * 1_000,
            rcv_space: self.auto.space as u32,
            total_retrans: self.stats.total_retrans,
        }
    }
}

impl core::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("unacked", &self.send.unacked)
            .field("next", &self.send.next)
            .field("recv_next", &self.recv.next)
            .finish()
    }
}

/// Outcome of the in-window data check.
enum DataVerdict {
    InOrder,
    OutOfOrder,
    Duplicate,
    OutOfWindow,
}

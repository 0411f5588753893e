//! Simulated host glue.
//!
//! A [`SimHost`] is what the scheduler owns and drives: it executes the
//! three payload kinds (packet arrival, typed timer callback, control
//! work), demultiplexes inbound packets onto its connection arena, and
//! turns connection emissions into delivery events for the destination
//! host (`delivery time = now + max(latency, 1 ms)`).
//!
//! Connections are owned by value in the arena and addressed by
//! [`SockHandle`]; parent → child links go through the arena (owning demux
//! entry) while child → parent is a plain back-reference, which keeps the
//! ownership graph acyclic.

use std::net::Ipv4Addr;
use std::sync::Arc;

use hashbrown::HashMap;

use slopsim_core::event::HostId;
use slopsim_core::scheduler::{Host, WorkerContext};
use slopsim_lib::SimTime;

use crate::config::TcpConfig;
use crate::packet::Packet;
use crate::tcp::{
    ChildState, ConnNotice, TcpConnection, TcpEnv, TcpState, TimerKind, child_key,
};
use crate::types::{Port, SockAddr, SockError, SockHandle};

/// First ephemeral port handed out by [`SimHost::connect`].
const EPHEMERAL_BASE: u16 = 40_000;

/// IPv4 address → host id, shared (read-only) by every host.
#[derive(Debug, Default)]
pub struct AddressBook {
    map: HashMap<Ipv4Addr, HostId>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host's address.  Called during setup, before the
    /// simulation runs.
    pub fn register(&mut self, ip: Ipv4Addr, host: HostId) {
        let prev = self.map.insert(ip, host);
        assert!(prev.is_none(), "{ip} registered twice");
    }

    pub fn resolve(&self, ip: Ipv4Addr) -> Option<HostId> {
        self.map.get(&ip).copied()
    }
}

/// Host work scheduled as a control event (application scripts, test
/// drivers).
pub type ControlFn = Box<dyn FnOnce(&mut SimHost, &mut WorkerContext<'_, NetPayload>) + Send>;

/// The concrete event payload executed by simulated hosts.
pub enum NetPayload {
    /// A packet arriving off the wire.
    Packet(Arc<Packet>),
    /// A connection timer task.
    Timer { conn: SockHandle, kind: TimerKind },
    /// Arbitrary host work.
    Control(ControlFn),
}

impl core::fmt::Debug for NetPayload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NetPayload::Packet(p) => write!(f, "Packet({p:?})"),
            NetPayload::Timer { conn, kind } => write!(f, "Timer({conn}, {kind:?})"),
            NetPayload::Control(_) => write!(f, "Control"),
        }
    }
}

/// A simulated host: descriptor table, port demux, connection arena.
pub struct SimHost {
    id: HostId,
    ip: Ipv4Addr,
    cfg: Arc<TcpConfig>,
    addresses: Arc<AddressBook>,
    pub(crate) conns: HashMap<SockHandle, TcpConnection>,
    pub(crate) ports: HashMap<Port, SockHandle>,
    next_handle: u32,
    next_ephemeral: u16,
    boot_scripts: Vec<ControlFn>,
    /// Delivery-layer fault injection: a packet is transmitted only if the
    /// filter returns `true`.
    egress_filter: Option<Box<dyn FnMut(&Packet) -> bool + Send>>,
}

impl SimHost {
    pub fn new(id: HostId, ip: Ipv4Addr, cfg: TcpConfig, addresses: Arc<AddressBook>) -> Self {
        Self {
            id,
            ip,
            cfg: Arc::new(cfg),
            addresses,
            conns: HashMap::new(),
            ports: HashMap::new(),
            next_handle: 1,
            next_ephemeral: EPHEMERAL_BASE,
            boot_scripts: Vec::new(),
            egress_filter: None,
        }
    }

    /// Install a delivery-layer filter: every outbound packet is offered
    /// to `f`, and dropped when `f` returns `false`.  Used to inject loss.
    pub fn set_egress_filter(&mut self, f: impl FnMut(&Packet) -> bool + Send + 'static) {
        self.egress_filter = Some(Box::new(f));
    }

    /// Queue work to run when the host boots (before the first round).
    pub fn with_boot(
        mut self,
        f: impl FnOnce(&mut SimHost, &mut WorkerContext<'_, NetPayload>) + Send + 'static,
    ) -> Self {
        self.boot_scripts.push(Box::new(f));
        self
    }

    #[inline]
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    #[inline]
    pub fn addr(&self, port: Port) -> SockAddr {
        SockAddr::new(self.ip, port)
    }

    /// Live socket count (diagnostics).
    pub fn socket_count(&self) -> usize {
        self.conns.len()
    }

    pub(crate) fn config(&self) -> Arc<TcpConfig> {
        Arc::clone(&self.cfg)
    }

    pub(crate) fn alloc_handle(&mut self) -> SockHandle {
        let h = SockHandle(self.next_handle);
        self.next_handle += 1;
        h
    }

    pub(crate) fn alloc_ephemeral(&mut self) -> Port {
        let p = Port(self.next_ephemeral);
        self.next_ephemeral += 1;
        p
    }

    /// Destination host for an address: loopback and our own address short
    /// back to us, everything else goes through the address book.
    fn resolve(&self, ip: Ipv4Addr) -> Option<HostId> {
        if ip.is_loopback() || ip == self.ip {
            Some(self.id)
        } else {
            self.addresses.resolve(ip)
        }
    }

    /// Run a connection operation and apply its collected outputs.
    pub(crate) fn drive<R>(
        &mut self,
        handle: SockHandle,
        ctx: &mut WorkerContext<'_, NetPayload>,
        f: impl FnOnce(&mut TcpConnection, &mut TcpEnv<'_>) -> R,
    ) -> Result<R, SockError> {
        if !self.conns.contains_key(&handle) {
            return Err(SockError::BadHandle);
        }
        let mut env = self.env_for(handle, ctx.now(), ctx);
        let conn = self.conns.get_mut(&handle).expect("checked above");
        let result = f(conn, &mut env);
        self.apply_env(handle, env, ctx);
        Ok(result)
    }

    fn env_for<'t>(
        &self,
        handle: SockHandle,
        now: SimTime,
        ctx: &WorkerContext<'t, NetPayload>,
    ) -> TcpEnv<'t> {
        let peer_host = self
            .conns
            .get(&handle)
            .and_then(|c| c.peer())
            .and_then(|peer| self.resolve(peer.ip));
        TcpEnv::new(now, self.id, peer_host, ctx.topology())
    }

    /// Apply everything a connection operation produced: packets onto the
    /// wire, timers into the event queue, notices into the parent.
    fn apply_env(
        &mut self,
        handle: SockHandle,
        env: TcpEnv<'_>,
        ctx: &mut WorkerContext<'_, NetPayload>,
    ) {
        let (emitted, timers, notices) = env.into_outputs();
        for pkt in emitted {
            self.transmit(pkt, ctx);
        }
        for (kind, at) in timers {
            ctx.schedule(self.id, at, NetPayload::Timer { conn: handle, kind });
        }
        for notice in notices {
            self.apply_notice(handle, notice);
        }
        self.maybe_reap(handle);
    }

    /// Hand a packet to the delivery layer.
    fn transmit(&mut self, pkt: Arc<Packet>, ctx: &mut WorkerContext<'_, NetPayload>) {
        if let Some(filter) = self.egress_filter.as_mut() {
            if !filter(&pkt) {
                log::debug!("{}: egress filter dropped {pkt:?}", self.id);
                return;
            }
        }
        let dst_ip = pkt.header.dst.ip;
        let Some(dst_host) = self.resolve(dst_ip) else {
            log::warn!("{}: no route to {dst_ip}, dropping {pkt:?}", self.id);
            return;
        };
        let at = ctx.delivery_time(dst_host);
        ctx.schedule(dst_host, at, NetPayload::Packet(pkt));
    }

    fn apply_notice(&mut self, child_h: SockHandle, notice: ConnNotice) {
        let Some(link) = self.conns.get(&child_h).and_then(|c| c.child) else {
            return;
        };
        match notice {
            ConnNotice::ChildEstablished => {
                let peer = self.conns[&child_h].peer().expect("child has a peer");
                let Some(parent) = self.conns.get_mut(&link.parent) else {
                    return;
                };
                let Some(server) = parent.server.as_mut() else {
                    return;
                };
                if server.backlog.len() < server.backlog_limit {
                    server.backlog.push_back((child_h, peer));
                    parent.refresh_status();
                } else {
                    // Accept queue overflow: the child is discarded.
                    log::warn!(
                        "{}: accept backlog full, dropping child for {peer}",
                        self.id
                    );
                    server.children.remove(&link.key);
                    self.conns.remove(&child_h);
                }
            }
            ConnNotice::ChildClosed => {
                let parent_h = link.parent;
                if let Some(parent) = self.conns.get_mut(&parent_h) {
                    let mut children_left = true;
                    if let Some(server) = parent.server.as_mut() {
                        server.children.remove(&link.key);
                        server.backlog.retain(|&(h, _)| h != child_h);
                        children_left = !server.children.is_empty();
                    }
                    // A closing server waits for its last child.
                    if !children_left
                        && parent
                            .status()
                            .contains(crate::status::DescriptorStatus::CLOSED)
                        && parent.state() == TcpState::Listen
                    {
                        parent.state = TcpState::Closed;
                    }
                    self.maybe_reap(parent_h);
                }
            }
        }
    }

    /// Destroy a connection once it is fully closed and unreferenced.
    pub(crate) fn maybe_reap(&mut self, handle: SockHandle) {
        let Some(conn) = self.conns.get(&handle) else {
            return;
        };
        if !conn.reapable() {
            return;
        }
        log::debug!("{}: reaping {handle}", self.id);
        self.conns.remove(&handle);
        self.ports.retain(|_, &mut h| h != handle);
    }

    // -- event execution ---------------------------------------------------

    fn deliver_packet(&mut self, pkt: Arc<Packet>, ctx: &mut WorkerContext<'_, NetPayload>) {
        let dst_port = pkt.header.dst.port;
        let src = pkt.header.src;
        let Some(&owner) = self.ports.get(&dst_port) else {
            log::debug!("{}: no socket on port {dst_port}, dropping {pkt:?}", self.id);
            return;
        };

        enum Route {
            Conn(SockHandle),
            Spawn,
        }
        let route = {
            let conn = &self.conns[&owner];
            if conn.state() == TcpState::Listen {
                let key = child_key(src);
                let server = conn.server.as_ref().expect("listener has server state");
                if let Some(&child) = server.children.get(&key) {
                    Route::Conn(child)
                } else if pkt.header.is_syn()
                    && !conn.status().contains(crate::status::DescriptorStatus::CLOSED)
                {
                    Route::Spawn
                } else {
                    log::debug!("{}: stray packet for listener, dropped", self.id);
                    return;
                }
            } else {
                Route::Conn(owner)
            }
        };

        match route {
            Route::Conn(h) => {
                let _ = self.drive(h, ctx, |conn, env| conn.process_packet(&pkt, env));
            }
            Route::Spawn => self.spawn_child(owner, &pkt, ctx),
        }
    }

    /// LISTEN × SYN: multiplex a new child keyed by the peer endpoint.
    fn spawn_child(
        &mut self,
        parent_h: SockHandle,
        syn: &Packet,
        ctx: &mut WorkerContext<'_, NetPayload>,
    ) {
        let peer = syn.header.src;
        let key = child_key(peer);
        let local = self.conns[&parent_h].local();
        let child_h = self.alloc_handle();

        let mut child = TcpConnection::new_child(local, peer, Arc::clone(&self.cfg));
        child.child = Some(ChildState {
            parent: parent_h,
            key,
        });
        child.send.last_ts_recv = syn.header.ts_val;
        self.conns.insert(child_h, child);

        {
            let parent = self.conns.get_mut(&parent_h).expect("parent exists");
            let server = parent.server.as_mut().expect("listener has server state");
            server.children.insert(key, child_h);
            server.last_peer = Some(peer);
        }

        log::debug!("{}: spawned child {child_h} for {peer}", self.id);
        let _ = self.drive(child_h, ctx, |conn, env| conn.on_child_spawned(env));
    }

    fn dispatch_timer(
        &mut self,
        handle: SockHandle,
        kind: TimerKind,
        ctx: &mut WorkerContext<'_, NetPayload>,
    ) {
        // A reaped connection's timers fire into the void.
        if !self.conns.contains_key(&handle) {
            return;
        }
        let _ = self.drive(handle, ctx, |conn, env| match kind {
            TimerKind::Retransmit => conn.on_retransmit_timer(env),
            TimerKind::DelayedAck => conn.on_delayed_ack_timer(env),
            TimerKind::Close => conn.on_close_timer(env),
        });
    }
}

impl Host for SimHost {
    type Payload = NetPayload;

    fn id(&self) -> HostId {
        self.id
    }

    fn boot(&mut self, ctx: &mut WorkerContext<'_, NetPayload>) {
        log::debug!("{}: boot", self.id);
        let scripts = core::mem::take(&mut self.boot_scripts);
        for script in scripts {
            script(self, ctx);
        }
    }

    fn execute(&mut self, payload: NetPayload, ctx: &mut WorkerContext<'_, NetPayload>) {
        match payload {
            NetPayload::Packet(pkt) => self.deliver_packet(pkt, ctx),
            NetPayload::Timer { conn, kind } => self.dispatch_timer(conn, kind, ctx),
            NetPayload::Control(work) => work(self, ctx),
        }
    }

    fn shutdown(&mut self, _ctx: &mut WorkerContext<'_, NetPayload>) {
        log::debug!("{}: shutdown ({} sockets live)", self.id, self.conns.len());
    }
}

impl core::fmt::Debug for SimHost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimHost")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("sockets", &self.conns.len())
            .finish()
    }
}

//! `slopsim-tests` — cross-crate simulation harness.
//!
//! Builders for small simulations (hosts, address book, topology) and the
//! scripted-application plumbing the end-to-end scenario tests in
//! `tests/` drive: probes write observations into shared cells, and a
//! generic server pump accepts and drains a connection by rescheduling
//! itself as a control event.

use std::net::Ipv4Addr;
use std::sync::Arc;

use spin::Mutex;

use slopsim_core::{HostId, PolicyKind, Scheduler, StaticTopology};
use slopsim_lib::SimTime;
use slopsim_lib::simtime::NANOS_PER_MSEC;
use slopsim_net::host::ControlFn;
use slopsim_net::{AddressBook, NetPayload, Port, SimHost, SockAddr, SockHandle, TcpConfig};

pub const HOST_A: HostId = HostId(1);
pub const HOST_B: HostId = HostId(2);
pub const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const SERVER_PORT: Port = Port(80);

/// Observation cell shared between test code and scripted apps.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// The server's listening address as the client dials it.
pub fn server_addr() -> SockAddr {
    SockAddr::new(IP_B, SERVER_PORT)
}

/// An address book with both standard hosts registered.
pub fn address_book() -> Arc<AddressBook> {
    let mut book = AddressBook::new();
    book.register(IP_A, HOST_A);
    book.register(IP_B, HOST_B);
    Arc::new(book)
}

/// A two-host simulation, A and B `latency_ms` apart, with per-host
/// configs and boot scripts.
#[allow(clippy::too_many_arguments)]
pub fn pair_sim(
    kind: PolicyKind,
    workers: usize,
    latency_ms: u64,
    cfg_a: TcpConfig,
    cfg_b: TcpConfig,
    boot_a: impl FnOnce(&mut SimHost, &mut slopsim_core::WorkerContext<'_, NetPayload>)
    + Send
    + 'static,
    boot_b: impl FnOnce(&mut SimHost, &mut slopsim_core::WorkerContext<'_, NetPayload>)
    + Send
    + 'static,
) -> Scheduler<SimHost> {
    let book = address_book();
    let topology = Arc::new(StaticTopology::new(latency_ms));
    let host_a = SimHost::new(HOST_A, IP_A, cfg_a, Arc::clone(&book)).with_boot(boot_a);
    let host_b = SimHost::new(HOST_B, IP_B, cfg_b, book).with_boot(boot_b);
    Scheduler::new(kind, workers, vec![host_a, host_b], topology, 1)
}

/// Schedule a control closure on the current host at an absolute time.
pub fn at_ms(
    ctx: &mut slopsim_core::WorkerContext<'_, NetPayload>,
    ms: u64,
    f: impl FnOnce(&mut SimHost, &mut slopsim_core::WorkerContext<'_, NetPayload>) + Send + 'static,
) {
    ctx.schedule(
        ctx.host_id(),
        SimTime::from_millis(ms),
        NetPayload::Control(Box::new(f)),
    );
}

/// A self-rescheduling server pump: accepts the first child off `srv`,
/// drains it into `total`, records end-of-stream into `eof`, then closes
/// both sockets.  Re-arms itself every `interval_ms` until EOF.
pub fn pump_server(
    srv: SockHandle,
    child: Option<SockHandle>,
    interval_ms: u64,
    total: Shared<usize>,
    eof: Shared<bool>,
) -> ControlFn {
    Box::new(move |host, ctx| {
        let mut child = child;
        if child.is_none() {
            if let Ok((accepted, _peer)) = host.accept(srv) {
                child = Some(accepted);
            }
        }
        if let Some(c) = child {
            let mut buf = [0u8; 8_192];
            loop {
                match host.recv(c, &mut buf, ctx) {
                    Ok(0) => {
                        *eof.lock() = true;
                        let _ = host.close(c, ctx);
                        let _ = host.close(srv, ctx);
                        return;
                    }
                    Ok(n) => *total.lock() += n,
                    Err(_) => break,
                }
            }
        }
        let next = ctx.now() + interval_ms * NANOS_PER_MSEC;
        ctx.schedule(
            ctx.host_id(),
            next,
            NetPayload::Control(pump_server(
                srv,
                child,
                interval_ms,
                Arc::clone(&total),
                Arc::clone(&eof),
            )),
        );
    })
}

//! Scheduler façade: owns the policy, drives the rounds.
//!
//! A simulation runs as `N` worker threads plus the driver (the thread that
//! called [`Scheduler::run`]).  Hosts are shuffled with the injected seed
//! and round-robin assigned to workers at setup; the assignment is frozen
//! for the lifetime of the simulation.
//!
//! # Round protocol
//!
//! Every round executes the window `[window_start, window_end)`:
//!
//! 1. The driver stores the new round end, resets the min-next fold to +∞
//!    and releases the workers from the *prepare* latch.
//! 2. Each worker pops and executes events strictly before the round end.
//!    When its pop runs dry it passes the *execute-events* latch, folds its
//!    `next_time` into the shared minimum under the driver lock, and passes
//!    the *collect-info* latch.
//! 3. The driver, released from collect-info, reads the fold and picks
//!    `window_end' = min(min_next + safe_delta, simulation_end)`.
//!
//! `safe_delta` is the topology's global minimum latency: no event can be
//! generated with a delivery time earlier than `now + safe_delta`, so the
//! window length never admits a causality violation.  A zero minimum
//! latency is rejected and 1 ms substituted.
//!
//! With `n_workers == 0` the driver runs everything inline (serial-global
//! policy): no worker threads, no latches.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use spin::Mutex;

use slopsim_lib::simtime::NANOS_PER_MSEC;
use slopsim_lib::{CountDownLatch, SimTime};

use crate::event::{Event, HostId, ThreadIdx};
use crate::policy::{EventPolicy, PolicyKind};
use crate::topology::{Topology, clamp_latency_ms};

/// A simulated host as the scheduler sees it: bootable, executable,
/// shutdownable.  Exactly one worker mutates a host at any simulated
/// instant; the scheduler guarantees it, so hosts need no internal locking.
pub trait Host: Send + 'static {
    /// The event payload type this host executes.
    type Payload: Send + 'static;

    /// Stable identifier; must not change after construction.
    fn id(&self) -> HostId;

    /// Called once on the owning worker before the first round.  Initial
    /// events (application start work) are scheduled from here.
    fn boot(&mut self, _ctx: &mut WorkerContext<'_, Self::Payload>) {}

    /// Execute one event.  `ctx.now()` is the event's delivery time.
    fn execute(&mut self, payload: Self::Payload, ctx: &mut WorkerContext<'_, Self::Payload>);

    /// Called once on the owning worker after the last round.
    fn shutdown(&mut self, _ctx: &mut WorkerContext<'_, Self::Payload>) {}
}

/// Everything a host may touch while running: the clock, the push path
/// into the policy, and the topology oracle.  Replaces process-global
/// state; one context is materialised per executed event.
pub struct WorkerContext<'a, P> {
    thread: ThreadIdx,
    now: SimTime,
    round_end: SimTime,
    current_host: HostId,
    policy: &'a EventPolicy<P>,
    topology: &'a dyn Topology,
    next_key: &'a AtomicU64,
}

impl<'a, P: Send> WorkerContext<'a, P> {
    /// Current simulated time (the executing event's delivery time).
    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// The worker thread index.
    #[inline]
    pub fn thread(&self) -> ThreadIdx {
        self.thread
    }

    /// The host this context belongs to.
    #[inline]
    pub fn host_id(&self) -> HostId {
        self.current_host
    }

    /// The topology oracle.  The returned borrow is tied to the scheduler,
    /// not to this context, so callers may hold it across context use.
    #[inline]
    pub fn topology(&self) -> &'a dyn Topology {
        self.topology
    }

    /// Delivery time for a packet sent now from this host to `dst`:
    /// `now + max(latency, 1 ms)`.
    pub fn delivery_time(&self, dst: HostId) -> SimTime {
        let ms = clamp_latency_ms(self.topology.latency_ms(self.current_host, dst));
        self.now + ms * NANOS_PER_MSEC
    }

    /// Schedule `payload` for `dst` at `time`.  Scheduling into the past is
    /// a fatal bug.  Cross-thread destinations are subject to the causality
    /// clamp.
    pub fn schedule(&mut self, dst: HostId, time: SimTime, payload: P) {
        assert!(
            time >= self.now,
            "scheduling into the past: {time:?} < {:?}",
            self.now
        );
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.policy
            .push(Event::new(key, dst, time, payload), self.current_host, self.round_end);
    }
}

/// Shared round state, guarded by the driver lock.
struct RoundState {
    round_end: SimTime,
    min_next: SimTime,
    running: bool,
}

/// The scheduler façade: policy, round state, latches, host tables.
pub struct Scheduler<H: Host> {
    policy: EventPolicy<H::Payload>,
    topology: Arc<dyn Topology>,
    n_workers: usize,
    safe_delta_ns: u64,
    state: Mutex<RoundState>,
    latch_prepare: CountDownLatch,
    latch_execute: CountDownLatch,
    latch_collect: CountDownLatch,
    latch_finish: CountDownLatch,
    host_tables: Vec<Mutex<Option<HashMap<HostId, H>>>>,
    next_key: AtomicU64,
}

impl<H: Host> Scheduler<H> {
    /// Build a scheduler.  `n_workers == 0` requires (and implies) the
    /// serial-global policy; every parallel policy needs at least one
    /// worker.  `seed` drives the Fisher–Yates host shuffle, so the same
    /// seed yields the same host→thread assignment.
    pub fn new(
        kind: PolicyKind,
        n_workers: usize,
        mut hosts: Vec<H>,
        topology: Arc<dyn Topology>,
        seed: u64,
    ) -> Self {
        match kind {
            PolicyKind::GlobalSingle => {
                assert!(n_workers == 0, "serial-global policy runs on the driver only")
            }
            _ => assert!(n_workers > 0, "parallel policy requires workers"),
        }
        let n_threads = n_workers.max(1);

        let mut rng = StdRng::seed_from_u64(seed);
        hosts.shuffle(&mut rng);

        let mut policy = EventPolicy::new(kind, n_threads);
        let mut tables: Vec<HashMap<HostId, H>> =
            (0..n_threads).map(|_| HashMap::new()).collect();
        for (i, host) in hosts.into_iter().enumerate() {
            let thread = i % n_threads;
            policy.add_host(host.id(), thread);
            tables[thread].insert(host.id(), host);
        }

        let safe_delta_ms = clamp_latency_ms(topology.min_latency_ms());
        let participants = n_workers as u32 + 1;

        Self {
            policy,
            topology,
            n_workers,
            safe_delta_ns: safe_delta_ms * NANOS_PER_MSEC,
            state: Mutex::new(RoundState {
                round_end: SimTime::ZERO,
                min_next: SimTime::MAX,
                running: false,
            }),
            latch_prepare: CountDownLatch::new(participants),
            latch_execute: CountDownLatch::new(participants),
            latch_collect: CountDownLatch::new(participants),
            latch_finish: CountDownLatch::new(participants),
            host_tables: tables.into_iter().map(|t| Mutex::new(Some(t))).collect(),
            next_key: AtomicU64::new(1),
        }
    }

    /// The round look-ahead bound, in nanoseconds.
    #[inline]
    pub fn safe_delta_ns(&self) -> u64 {
        self.safe_delta_ns
    }

    /// Total events pushed so far.
    pub fn total_pushes(&self) -> u64 {
        self.policy.total_pushes()
    }

    /// Total events popped so far.
    pub fn total_pops(&self) -> u64 {
        self.policy.total_pops()
    }

    /// Run the simulation until no events remain before `sim_end`.  Events
    /// at or after `sim_end` never execute.
    pub fn run(&self, sim_end: SimTime) {
        {
            let mut state = self.state.lock();
            state.round_end = SimTime::ZERO;
            state.min_next = SimTime::MAX;
            state.running = true;
        }
        if self.n_workers == 0 {
            self.run_serial(sim_end);
        } else {
            std::thread::scope(|scope| {
                for thread in 0..self.n_workers {
                    let sched = &*self;
                    scope.spawn(move || sched.worker_loop(thread));
                }
                self.driver_loop(sim_end);
            });
        }
        log::debug!(
            "simulation finished: {} events pushed, {} popped",
            self.total_pushes(),
            self.total_pops()
        );
    }

    fn make_ctx<'a>(
        &'a self,
        thread: ThreadIdx,
        now: SimTime,
        round_end: SimTime,
        host: HostId,
    ) -> WorkerContext<'a, H::Payload> {
        WorkerContext {
            thread,
            now,
            round_end,
            current_host: host,
            policy: &self.policy,
            topology: &*self.topology,
            next_key: &self.next_key,
        }
    }

    /// Serial-global execution: the driver does everything inline.
    fn run_serial(&self, sim_end: SimTime) {
        let mut hosts = self.host_tables[0]
            .lock()
            .take()
            .expect("host table already taken");

        for id in self.policy.assigned_hosts(0) {
            let host = hosts.get_mut(&id).expect("assigned host missing");
            let mut ctx = self.make_ctx(0, SimTime::ZERO, SimTime::ZERO, id);
            host.boot(&mut ctx);
        }

        loop {
            let next = self.policy.next_time(0);
            if next.is_max() || next >= sim_end {
                break;
            }
            let window_end = (next + self.safe_delta_ns).min(sim_end);
            log::trace!("serial round end {window_end}");
            while let Some(event) = self.policy.pop(0, window_end) {
                let (time, dst, payload) = event.into_parts();
                let host = hosts.get_mut(&dst).expect("event for unknown host");
                let mut ctx = self.make_ctx(0, time, window_end, dst);
                host.execute(payload, &mut ctx);
            }
        }

        for id in self.policy.assigned_hosts(0) {
            let host = hosts.get_mut(&id).expect("assigned host missing");
            let mut ctx = self.make_ctx(0, sim_end, SimTime::MAX, id);
            host.shutdown(&mut ctx);
        }
        self.state.lock().running = false;
    }

    /// The driver side of the round protocol.
    fn driver_loop(&self, sim_end: SimTime) {
        // Boot phase mirrors a round: workers boot their hosts, then fold
        // the initial next-event times.
        self.latch_execute.pass();
        self.latch_collect.pass();

        loop {
            let proceed = {
                let mut state = self.state.lock();
                let min_next = state.min_next;
                if min_next.is_max() || min_next >= sim_end {
                    state.running = false;
                    false
                } else {
                    let window_end = (min_next + self.safe_delta_ns).min(sim_end);
                    state.round_end = window_end;
                    state.min_next = SimTime::MAX;
                    log::trace!("round end {window_end}");
                    true
                }
            };
            if !proceed {
                break;
            }
            self.latch_prepare.pass(); // release workers into the round
            self.latch_execute.pass(); // wait for every queue to drain
            self.latch_collect.pass(); // wait for the min-next folds
        }

        // One final prepare release: workers observe the cleared running
        // flag and proceed to shutdown.
        self.latch_prepare.pass();
        self.latch_finish.pass();
    }

    /// The worker side: boot, rounds, shutdown.
    fn worker_loop(&self, thread: ThreadIdx) {
        let mut hosts = self.host_tables[thread]
            .lock()
            .take()
            .expect("host table already taken");

        // await_start: boot only this worker's assigned hosts.
        for id in self.policy.assigned_hosts(thread) {
            let host = hosts.get_mut(&id).expect("assigned host missing");
            let mut ctx = self.make_ctx(thread, SimTime::ZERO, SimTime::ZERO, id);
            host.boot(&mut ctx);
        }
        self.latch_execute.pass();
        self.fold_min_next(thread);
        self.latch_collect.pass();

        loop {
            self.latch_prepare.pass();
            let (round_end, running) = {
                let state = self.state.lock();
                (state.round_end, state.running)
            };
            if !running {
                break;
            }

            while let Some(event) = self.policy.pop(thread, round_end) {
                let (time, dst, payload) = event.into_parts();
                let host = hosts.get_mut(&dst).expect("event for non-owned host");
                let mut ctx = self.make_ctx(thread, time, round_end, dst);
                host.execute(payload, &mut ctx);
            }

            self.latch_execute.pass();
            self.fold_min_next(thread);
            self.latch_collect.pass();
        }

        // await_finish: shut down this worker's hosts.
        for id in self.policy.assigned_hosts(thread) {
            let host = hosts.get_mut(&id).expect("assigned host missing");
            let mut ctx = self.make_ctx(thread, sim_end_of(&self.state), SimTime::MAX, id);
            host.shutdown(&mut ctx);
        }
        self.latch_finish.pass();
    }

    fn fold_min_next(&self, thread: ThreadIdx) {
        let next = self.policy.next_time(thread);
        let mut state = self.state.lock();
        state.min_next = state.min_next.min(next);
    }
}

/// The time workers use for shutdown contexts: the last round end.
fn sim_end_of(state: &Mutex<RoundState>) -> SimTime {
    state.lock().round_end
}

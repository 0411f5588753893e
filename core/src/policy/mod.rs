//! Scheduler policies — how hosts and event queues partition across workers.
//!
//! A policy owns every event queue in the simulation and answers five
//! questions: which thread owns a host (`add_host`, fixed at setup), which
//! hosts a thread runs (`assigned_hosts`), where a pushed event goes
//! (`push`), what a thread runs next (`pop`), and how soon a thread has
//! more work (`next_time`).
//!
//! Four concrete variants exist; the choice is fixed at construction:
//!
//! * [`GlobalSingle`] — one global queue, driver-thread only (`nWorkers == 0`).
//! * [`HostSingle`] — one locked queue per host; a worker sweeps its hosts
//!   in unprocessed → processed bucket order each round.
//! * [`ThreadSingle`] — one primary queue per thread plus, per receiver, a
//!   secondary queue per **sender thread**, so any secondary lock is
//!   contended by at most two threads.
//! * [`ThreadPerHost`] — like `ThreadSingle`, with secondaries keyed by
//!   **source host** instead of source thread.
//!
//! # Causality rule
//!
//! A push that crosses threads inside the current round would race the
//! receiving worker, which may already have drained its queues for this
//! round.  Every parallel variant therefore raises such an event's time to
//! the round end before enqueueing it (and logs the adjustment); the event
//! becomes visible in the next round.  Same-thread pushes are never
//! clamped.
//!
//! # Pop contract
//!
//! `pop` returns an event only if its time is strictly before the round
//! end.  Returning `None` tells a worker to enter the round barrier —
//! except under [`GlobalSingle`], where `None` simply ends the driver's
//! round.  Popped times are asserted monotone per queue owner; a violation
//! is a fatal bug, never a recoverable condition.

mod global_single;
mod host_single;
mod thread_per_host;
mod thread_single;

#[cfg(test)]
mod policy_tests;

pub use global_single::GlobalSingle;
pub use host_single::HostSingle;
pub use thread_per_host::ThreadPerHost;
pub use thread_single::ThreadSingle;

use core::sync::atomic::{AtomicU64, Ordering};

use slopsim_lib::SimTime;

use crate::event::{Event, HostId, ThreadIdx};

/// Which partitioning strategy the scheduler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    /// Single global queue on the driver thread.
    GlobalSingle,
    /// Per-host queues, swept per thread.
    HostSingle,
    /// Per-thread primary + per-sender-thread secondaries.
    ThreadSingle,
    /// Per-thread primary + per-source-host secondaries.
    ThreadPerHost,
}

/// Per-thread pop bookkeeping: the round currently being drained and the
/// monotonicity watermark within it.
#[derive(Debug)]
pub(crate) struct ThreadStats {
    pub round_end: SimTime,
    pub last_pop: SimTime,
}

impl ThreadStats {
    pub(crate) fn new() -> Self {
        Self {
            round_end: SimTime::ZERO,
            last_pop: SimTime::ZERO,
        }
    }

    /// Reset the watermark when the round end advances.  Returns `true` if
    /// a new round began (variants use this to migrate secondary queues or
    /// reset host buckets).
    pub(crate) fn observe_round(&mut self, round_end: SimTime) -> bool {
        if round_end > self.round_end {
            self.round_end = round_end;
            self.last_pop = SimTime::ZERO;
            true
        } else {
            false
        }
    }

    /// Record a pop and enforce the monotone-per-owner contract.
    pub(crate) fn note_pop(&mut self, time: SimTime) {
        assert!(
            time >= self.last_pop,
            "event time ran backwards: {time:?} after {:?}",
            self.last_pop
        );
        self.last_pop = time;
    }
}

/// Lock-free push/pop counters, one pair per thread.
#[derive(Debug, Default)]
pub(crate) struct ThreadCounters {
    pub pushes: AtomicU64,
    pub pops: AtomicU64,
}

impl ThreadCounters {
    #[inline]
    pub(crate) fn note_push(&self) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_pop(&self) {
        self.pops.fetch_add(1, Ordering::Relaxed);
    }
}

/// Apply the causality clamp to a cross-thread event.
pub(crate) fn clamp_cross_thread<P>(
    event: &mut Event<P>,
    src_thread: ThreadIdx,
    dst_thread: ThreadIdx,
    round_end: SimTime,
) {
    if src_thread != dst_thread && event.time() < round_end {
        log::debug!(
            "causality clamp: event {} for {} raised {} -> {} (thread {} -> {})",
            event.key(),
            event.dst(),
            event.time(),
            round_end,
            src_thread,
            dst_thread,
        );
        event.clamp_time(round_end);
    }
}

/// The policy strategy object.  Constructed once, then driven through the
/// five-operation contract.
pub enum EventPolicy<P> {
    GlobalSingle(GlobalSingle<P>),
    HostSingle(HostSingle<P>),
    ThreadSingle(ThreadSingle<P>),
    ThreadPerHost(ThreadPerHost<P>),
}

impl<P: Send> EventPolicy<P> {
    /// Build a policy for `n_threads` workers.  `GlobalSingle` ignores
    /// `n_threads` (it always runs on the driver).
    pub fn new(kind: PolicyKind, n_threads: usize) -> Self {
        match kind {
            PolicyKind::GlobalSingle => Self::GlobalSingle(GlobalSingle::new()),
            PolicyKind::HostSingle => Self::HostSingle(HostSingle::new(n_threads)),
            PolicyKind::ThreadSingle => Self::ThreadSingle(ThreadSingle::new(n_threads)),
            PolicyKind::ThreadPerHost => Self::ThreadPerHost(ThreadPerHost::new(n_threads)),
        }
    }

    /// Assign a host to a thread.  Setup-only: must run before any worker
    /// starts popping (host assignment is frozen for the simulation).
    pub fn add_host(&mut self, host: HostId, thread: ThreadIdx) {
        match self {
            Self::GlobalSingle(p) => p.add_host(host),
            Self::HostSingle(p) => p.add_host(host, thread),
            Self::ThreadSingle(p) => p.add_host(host, thread),
            Self::ThreadPerHost(p) => p.add_host(host, thread),
        }
    }

    /// The hosts owned by `thread`.
    pub fn assigned_hosts(&self, thread: ThreadIdx) -> Vec<HostId> {
        match self {
            Self::GlobalSingle(p) => p.assigned_hosts(),
            Self::HostSingle(p) => p.assigned_hosts(thread),
            Self::ThreadSingle(p) => p.assigned_hosts(thread),
            Self::ThreadPerHost(p) => p.assigned_hosts(thread),
        }
    }

    /// The thread that owns `host`, if the host was ever added.
    pub fn owner_of(&self, host: HostId) -> Option<ThreadIdx> {
        match self {
            Self::GlobalSingle(p) => p.owner_of(host),
            Self::HostSingle(p) => p.owner_of(host),
            Self::ThreadSingle(p) => p.owner_of(host),
            Self::ThreadPerHost(p) => p.owner_of(host),
        }
    }

    /// Enqueue `event` for its destination host.  `src` is the pushing
    /// host (the driver pushes initial events with `src == event.dst()`).
    /// Cross-thread pushes inside the round are clamped per the causality
    /// rule.
    pub fn push(&self, event: Event<P>, src: HostId, round_end: SimTime) {
        match self {
            Self::GlobalSingle(p) => p.push(event),
            Self::HostSingle(p) => p.push(event, src, round_end),
            Self::ThreadSingle(p) => p.push(event, src, round_end),
            Self::ThreadPerHost(p) => p.push(event, src, round_end),
        }
    }

    /// Next event for `thread` strictly before `round_end`, if any.
    pub fn pop(&self, thread: ThreadIdx, round_end: SimTime) -> Option<Event<P>> {
        match self {
            Self::GlobalSingle(p) => p.pop(round_end),
            Self::HostSingle(p) => p.pop(thread, round_end),
            Self::ThreadSingle(p) => p.pop(thread, round_end),
            Self::ThreadPerHost(p) => p.pop(thread, round_end),
        }
    }

    /// Earliest event time across `thread`'s queues, or [`SimTime::MAX`].
    pub fn next_time(&self, thread: ThreadIdx) -> SimTime {
        match self {
            Self::GlobalSingle(p) => p.next_time(),
            Self::HostSingle(p) => p.next_time(thread),
            Self::ThreadSingle(p) => p.next_time(thread),
            Self::ThreadPerHost(p) => p.next_time(thread),
        }
    }

    /// Total events pushed so far (all threads).
    pub fn total_pushes(&self) -> u64 {
        match self {
            Self::GlobalSingle(p) => p.counter_totals().0,
            Self::HostSingle(p) => p.counter_totals().0,
            Self::ThreadSingle(p) => p.counter_totals().0,
            Self::ThreadPerHost(p) => p.counter_totals().0,
        }
    }

    /// Total events popped so far (all threads).
    pub fn total_pops(&self) -> u64 {
        match self {
            Self::GlobalSingle(p) => p.counter_totals().1,
            Self::HostSingle(p) => p.counter_totals().1,
            Self::ThreadSingle(p) => p.counter_totals().1,
            Self::ThreadPerHost(p) => p.counter_totals().1,
        }
    }
}

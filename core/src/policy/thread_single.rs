//! Parallel policy: per-thread primary queue, per-sender-thread secondaries.
//!
//! A worker pops exclusively from its own primary queue, so the primary
//! lock is effectively uncontended during a round.  Cross-thread pushes
//! land in the receiver's secondary queue for the **sending thread**, so
//! any secondary lock is contended by at most two threads: the one sender
//! it belongs to and the receiving owner.  Secondary queues migrate into
//! the primary when the owner first pops in a new round.

use hashbrown::HashMap;
use spin::Mutex;

use slopsim_lib::{IndexedMinHeap, SimTime};

use crate::event::{Event, HostId, ThreadIdx};

use super::{ThreadCounters, ThreadStats, clamp_cross_thread};

struct Primary<P> {
    events: IndexedMinHeap<Event<P>>,
    stats: ThreadStats,
}

struct ThreadData<P> {
    assigned: Mutex<Vec<HostId>>,
    primary: Mutex<Primary<P>>,
    /// Future events pushed by each other thread; index is the sender.
    inbound: Vec<Mutex<IndexedMinHeap<Event<P>>>>,
    counters: ThreadCounters,
}

/// The per-thread parallel policy.
pub struct ThreadSingle<P> {
    owners: HashMap<HostId, ThreadIdx>,
    threads: Vec<ThreadData<P>>,
}

impl<P: Send> ThreadSingle<P> {
    pub fn new(n_threads: usize) -> Self {
        assert!(n_threads > 0, "thread-single policy requires workers");
        Self {
            owners: HashMap::new(),
            threads: (0..n_threads)
                .map(|_| ThreadData {
                    assigned: Mutex::new(Vec::new()),
                    primary: Mutex::new(Primary {
                        events: Event::queue(),
                        stats: ThreadStats::new(),
                    }),
                    inbound: (0..n_threads).map(|_| Mutex::new(Event::queue())).collect(),
                    counters: ThreadCounters::default(),
                })
                .collect(),
        }
    }

    pub fn add_host(&mut self, host: HostId, thread: ThreadIdx) {
        assert!(thread < self.threads.len(), "no such thread bucket");
        let prev = self.owners.insert(host, thread);
        assert!(prev.is_none(), "{host} assigned twice");
        self.threads[thread].assigned.lock().push(host);
    }

    pub fn assigned_hosts(&self, thread: ThreadIdx) -> Vec<HostId> {
        self.threads[thread].assigned.lock().clone()
    }

    pub fn owner_of(&self, host: HostId) -> Option<ThreadIdx> {
        self.owners.get(&host).copied()
    }

    pub fn push(&self, mut event: Event<P>, src: HostId, round_end: SimTime) {
        let dst = event.dst();
        let dst_thread = *self
            .owners
            .get(&dst)
            .unwrap_or_else(|| panic!("push into non-existent bucket for {dst}"));
        let data = &self.threads[dst_thread];

        match self.owners.get(&src) {
            Some(&src_thread) if src_thread != dst_thread => {
                clamp_cross_thread(&mut event, src_thread, dst_thread, round_end);
                data.inbound[src_thread].lock().push(event);
            }
            // Same thread (or the setup-time driver): straight into the
            // primary, unclamped.
            _ => {
                data.primary.lock().events.push(event);
            }
        }
        data.counters.note_push();
    }

    pub fn pop(&self, thread: ThreadIdx, round_end: SimTime) -> Option<Event<P>> {
        let data = &self.threads[thread];
        let mut primary = data.primary.lock();

        if primary.stats.observe_round(round_end) {
            // New round: migrate everything the other threads delivered.
            for secondary in &data.inbound {
                let mut secondary = secondary.lock();
                while let Some(event) = secondary.pop() {
                    primary.events.push(event);
                }
            }
        }

        match primary.events.peek() {
            Some(head) if head.time() < round_end => {
                let event = primary.events.pop().expect("peeked head");
                primary.stats.note_pop(event.time());
                drop(primary);
                data.counters.note_pop();
                Some(event)
            }
            _ => None,
        }
    }

    pub fn next_time(&self, thread: ThreadIdx) -> SimTime {
        let data = &self.threads[thread];
        let mut min = data
            .primary
            .lock()
            .events
            .peek()
            .map(|e| e.time())
            .unwrap_or(SimTime::MAX);
        for secondary in &data.inbound {
            if let Some(head) = secondary.lock().peek() {
                min = min.min(head.time());
            }
        }
        min
    }

    pub(super) fn counter_totals(&self) -> (u64, u64) {
        use core::sync::atomic::Ordering;
        self.threads.iter().fold((0, 0), |(pu, po), t| {
            (
                pu + t.counters.pushes.load(Ordering::Relaxed),
                po + t.counters.pops.load(Ordering::Relaxed),
            )
        })
    }
}

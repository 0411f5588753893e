//! Parallel policy: per-thread primary queue, per-source-host secondaries.
//!
//! Identical round structure to [`ThreadSingle`](super::ThreadSingle), but
//! the receiver-side secondary map is keyed by the **source host** rather
//! than the sending thread.  With many hosts per thread this spreads the
//! sender-side contention across more locks; each secondary lock is still
//! touched by at most the one thread owning the source host plus the
//! receiving owner.
//!
//! The secondary map is fully populated at setup (every host gets a slot in
//! every receiver), so pushes never mutate the map itself and reads stay
//! lock-free.

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
    /// Future events keyed by the host that sent them.
    inbound: HashMap<HostId, Mutex<IndexedMinHeap<Event<P>>>>,
    counters: ThreadCounters,
}

/// The per-source-host parallel policy.
pub struct ThreadPerHost<P> {
    owners: HashMap<HostId, ThreadIdx>,
    threads: Vec<ThreadData<P>>,
}

impl<P: Send> ThreadPerHost<P> {
    pub fn new(n_threads: usize) -> Self {
        assert!(n_threads > 0, "thread-per-host policy requires workers");
        Self {
            owners: HashMap::new(),
            threads: (0..n_threads)
                .map(|_| ThreadData {
                    assigned: Mutex::new(Vec::new()),
                    primary: Mutex::new(Primary {
                        events: Event::queue(),
                        stats: ThreadStats::new(),
                    }),
                    inbound: HashMap::new(),
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
        // Every receiver learns about every sender at setup so the inbound
        // map is never mutated once workers run.
        for data in &mut self.threads {
            data.inbound.insert(host, Mutex::new(Event::queue()));
        }
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
                data.inbound
                    .get(&src)
                    .unwrap_or_else(|| panic!("push into non-existent bucket from {src}"))
                    .lock()
                    .push(event);
            }
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
            for secondary in data.inbound.values() {
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
        for secondary in data.inbound.values() {
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

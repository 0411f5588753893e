//! Serial policy: one global queue, driver thread only.

use spin::Mutex;

use slopsim_lib::{IndexedMinHeap, SimTime};

use crate::event::{Event, HostId, ThreadIdx};

use super::{ThreadCounters, ThreadStats};

/// The `nWorkers == 0` policy.  Only the driver thread pushes and pops, so
/// there is no cross-thread traffic and the causality clamp never applies.
/// A `None` from [`pop`](Self::pop) means "round over", not "enter the
/// barrier".
pub struct GlobalSingle<P> {
    hosts: Vec<HostId>,
    queue: Mutex<IndexedMinHeap<Event<P>>>,
    stats: Mutex<ThreadStats>,
    counters: ThreadCounters,
}

impl<P: Send> GlobalSingle<P> {
    pub fn new() -> Self {
        Self {
            hosts: Vec::new(),
            queue: Mutex::new(Event::queue()),
            stats: Mutex::new(ThreadStats::new()),
            counters: ThreadCounters::default(),
        }
    }

    pub fn add_host(&mut self, host: HostId) {
        self.hosts.push(host);
    }

    pub fn assigned_hosts(&self) -> Vec<HostId> {
        self.hosts.clone()
    }

    pub fn owner_of(&self, host: HostId) -> Option<ThreadIdx> {
        self.hosts.contains(&host).then_some(0)
    }

    pub fn push(&self, event: Event<P>) {
        self.queue.lock().push(event);
        self.counters.note_push();
    }

    pub fn pop(&self, round_end: SimTime) -> Option<Event<P>> {
        let mut queue = self.queue.lock();
        match queue.peek() {
            Some(head) if head.time() < round_end => {
                let event = queue.pop().expect("peeked head");
                drop(queue);
                let mut stats = self.stats.lock();
                stats.observe_round(round_end);
                stats.note_pop(event.time());
                self.counters.note_pop();
                Some(event)
            }
            _ => None,
        }
    }

    pub fn next_time(&self) -> SimTime {
        self.queue
            .lock()
            .peek()
            .map(Event::time)
            .unwrap_or(SimTime::MAX)
    }

    pub(super) fn counter_totals(&self) -> (u64, u64) {
        use core::sync::atomic::Ordering;
        (
            self.counters.pushes.load(Ordering::Relaxed),
            self.counters.pops.load(Ordering::Relaxed),
        )
    }
}

impl<P: Send> Default for GlobalSingle<P> {
    fn default() -> Self {
        Self::new()
    }
}

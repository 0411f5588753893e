//! Parallel policy: one locked queue per host.
//!
//! Push acquires only the destination host's queue lock.  Pop sweeps the
//! calling thread's hosts in unprocessed → processed bucket order, draining
//! each host's round events completely before advancing to the next host;
//! when the round end moves forward, every processed host returns to the
//! unprocessed bucket.
//!
//! Because the sweep drains hosts in bucket order rather than merging all
//! queues by time, the monotone-pop watermark is kept **per host queue**
//! here; events of a single host are still delivered in non-decreasing
//! time order, which is the ordering the transport layer depends on.

use std::collections::VecDeque;

use hashbrown::HashMap;
use spin::Mutex;

use slopsim_lib::{IndexedMinHeap, SimTime};

use crate::event::{Event, HostId, ThreadIdx};

use super::{ThreadCounters, ThreadStats, clamp_cross_thread};

/// One host's queue plus its monotonicity watermark.
struct HostQueue<P> {
    queue: Mutex<QueueState<P>>,
}

struct QueueState<P> {
    events: IndexedMinHeap<Event<P>>,
    stats: ThreadStats,
}

/// Per-thread sweep state.
struct SweepState {
    unprocessed: VecDeque<HostId>,
    processed: Vec<HostId>,
    round_end: SimTime,
}

/// The per-host-queue parallel policy.
pub struct HostSingle<P> {
    owners: HashMap<HostId, ThreadIdx>,
    queues: HashMap<HostId, HostQueue<P>>,
    threads: Vec<Mutex<SweepState>>,
    counters: Vec<ThreadCounters>,
}

impl<P: Send> HostSingle<P> {
    pub fn new(n_threads: usize) -> Self {
        assert!(n_threads > 0, "host-single policy requires workers");
        Self {
            owners: HashMap::new(),
            queues: HashMap::new(),
            threads: (0..n_threads)
                .map(|_| {
                    Mutex::new(SweepState {
                        unprocessed: VecDeque::new(),
                        processed: Vec::new(),
                        round_end: SimTime::ZERO,
                    })
                })
                .collect(),
            counters: (0..n_threads).map(|_| ThreadCounters::default()).collect(),
        }
    }

    pub fn add_host(&mut self, host: HostId, thread: ThreadIdx) {
        assert!(thread < self.threads.len(), "no such thread bucket");
        let prev = self.owners.insert(host, thread);
        assert!(prev.is_none(), "{host} assigned twice");
        self.queues.insert(
            host,
            HostQueue {
                queue: Mutex::new(QueueState {
                    events: Event::queue(),
                    stats: ThreadStats::new(),
                }),
            },
        );
        self.threads[thread].lock().unprocessed.push_back(host);
    }

    pub fn assigned_hosts(&self, thread: ThreadIdx) -> Vec<HostId> {
        let state = self.threads[thread].lock();
        state
            .unprocessed
            .iter()
            .chain(state.processed.iter())
            .copied()
            .collect()
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
        if let Some(&src_thread) = self.owners.get(&src) {
            clamp_cross_thread(&mut event, src_thread, dst_thread, round_end);
        }
        self.queues[&dst].queue.lock().events.push(event);
        self.counters[dst_thread].note_push();
    }

    pub fn pop(&self, thread: ThreadIdx, round_end: SimTime) -> Option<Event<P>> {
        let mut sweep = self.threads[thread].lock();
        if round_end > sweep.round_end {
            // New round: every host gets swept again.
            let processed = core::mem::take(&mut sweep.processed);
            sweep.unprocessed.extend(processed);
            sweep.round_end = round_end;
        }

        while let Some(&host) = sweep.unprocessed.front() {
            let mut queue = self.queues[&host].queue.lock();
            match queue.events.peek() {
                Some(head) if head.time() < round_end => {
                    let event = queue.events.pop().expect("peeked head");
                    queue.stats.observe_round(round_end);
                    queue.stats.note_pop(event.time());
                    drop(queue);
                    self.counters[thread].note_pop();
                    return Some(event);
                }
                _ => {
                    // This host is done for the round.
                    drop(queue);
                    let done = sweep.unprocessed.pop_front().expect("front exists");
                    sweep.processed.push(done);
                }
            }
        }
        None
    }

    pub fn next_time(&self, thread: ThreadIdx) -> SimTime {
        let sweep = self.threads[thread].lock();
        let mut min = SimTime::MAX;
        for host in sweep.unprocessed.iter().chain(sweep.processed.iter()) {
            if let Some(head) = self.queues[host].queue.lock().events.peek() {
                min = min.min(head.time());
            }
        }
        min
    }

    pub(super) fn counter_totals(&self) -> (u64, u64) {
        use core::sync::atomic::Ordering;
        self.counters.iter().fold((0, 0), |(pu, po), c| {
            (
                pu + c.pushes.load(Ordering::Relaxed),
                po + c.pops.load(Ordering::Relaxed),
            )
        })
    }
}

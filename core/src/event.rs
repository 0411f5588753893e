//! Timestamped units of simulated work.
//!
//! An [`Event`] is an opaque payload addressed to a host, delivered at a
//! point in virtual time.  The scheduler never looks inside the payload —
//! the host layer defines the concrete payload type (packet arrival, timer
//! callback, control work) and the scheduler is generic over it.
//!
//! Events carry a unique 64-bit key.  The key serves two purposes: it is
//! the identity under which the event lives in the indexed heaps, and it is
//! the deterministic tie-break between events with equal delivery times
//! (keys are allocated monotonically, so FIFO among ties).

use core::cmp::Ordering;
use core::fmt;

use slopsim_lib::{IndexedMinHeap, SimTime};

/// Stable identifier of a simulated host.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(pub u32);

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host{}", self.0)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host{}", self.0)
    }
}

/// Index of a worker thread within the scheduler.
pub type ThreadIdx = usize;

/// A timestamped unit of work targeted at a host.
///
/// Once pushed into a policy queue, the time field is mutated only by the
/// scheduler's causality clamp.  An event is consumed exactly once: by a
/// pop, or by queue teardown at shutdown.
pub struct Event<P> {
    key: u64,
    dst: HostId,
    time: SimTime,
    payload: P,
}

impl<P> Event<P> {
    /// Build an event.  `key` must be unique for the simulation; the
    /// scheduler's worker context is the normal allocator.
    pub fn new(key: u64, dst: HostId, time: SimTime, payload: P) -> Self {
        Self {
            key,
            dst,
            time,
            payload,
        }
    }

    /// Identity of this event.
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Destination host.
    #[inline]
    pub fn dst(&self) -> HostId {
        self.dst
    }

    /// Delivery time.
    #[inline]
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Raise the delivery time (causality clamp).  Policy-internal.
    #[inline]
    pub(crate) fn clamp_time(&mut self, to: SimTime) {
        debug_assert!(to >= self.time);
        self.time = to;
    }

    /// Split into `(time, dst, payload)` for execution.
    #[inline]
    pub fn into_parts(self) -> (SimTime, HostId, P) {
        (self.time, self.dst, self.payload)
    }

    /// The total order used by every event queue: time, then key.
    pub fn order(a: &Self, b: &Self) -> Ordering {
        a.time.cmp(&b.time).then(a.key.cmp(&b.key))
    }

    /// Heap identity extractor.
    pub fn heap_key(e: &Self) -> u64 {
        e.key
    }

    /// An empty event queue with the canonical order.
    pub fn queue() -> IndexedMinHeap<Self> {
        IndexedMinHeap::new(Self::order, Self::heap_key)
    }
}

impl<P> fmt::Debug for Event<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("key", &self.key)
            .field("dst", &self.dst)
            .field("time", &self.time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_orders_by_time_then_key() {
        let mut q = Event::<&str>::queue();
        q.push(Event::new(2, HostId(0), SimTime::from_millis(5), "b"));
        q.push(Event::new(1, HostId(0), SimTime::from_millis(5), "a"));
        q.push(Event::new(3, HostId(0), SimTime::from_millis(1), "c"));
        let order: Vec<u64> = core::iter::from_fn(|| q.pop()).map(|e| e.key()).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }
}

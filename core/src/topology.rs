//! Topology oracle.
//!
//! The scheduler and the transport layer consult an external oracle for
//! link latencies and host bandwidths.  The oracle must be deterministic —
//! the same query returns the same answer on every worker, every run — and
//! safe to call from any worker thread concurrently.
//!
//! The global minimum latency doubles as the scheduler's **safe delta**:
//! the round length is bounded by it, relying on the invariant that no
//! event can be generated with a delivery time earlier than
//! `now + safe_delta`.  A zero latency would collapse the round to nothing,
//! so consumers reject it and substitute 1 ms (see [`clamp_latency_ms`]).

use hashbrown::HashMap;

use crate::event::HostId;

/// Latency/bandwidth oracle consumed by the scheduler and the hosts.
pub trait Topology: Send + Sync {
    /// One-way latency from `src` to `dst`, in milliseconds.
    fn latency_ms(&self, src: HostId, dst: HostId) -> u64;

    /// Upstream bandwidth of `host`, in KiB/s.
    fn bandwidth_up_kib(&self, host: HostId) -> u64;

    /// Downstream bandwidth of `host`, in KiB/s.
    fn bandwidth_down_kib(&self, host: HostId) -> u64;

    /// Minimum latency across the whole topology, in milliseconds.  The
    /// scheduler uses this as its round look-ahead bound.
    fn min_latency_ms(&self) -> u64;
}

/// Reject a zero latency: a 0 ms path would break the round look-ahead
/// invariant, so every consumer substitutes 1 ms.
#[inline]
pub fn clamp_latency_ms(raw_ms: u64) -> u64 {
    raw_ms.max(1)
}

/// A fixed latency matrix with per-host bandwidths.
///
/// Edges not present in the matrix fall back to the default latency.  A
/// host's latency to itself prefers a true self-edge when one was added;
/// otherwise it falls back to twice the host's minimum outgoing edge
/// latency (and twice the default when the host has no explicit edges).
#[derive(Debug)]
pub struct StaticTopology {
    default_latency_ms: u64,
    default_bandwidth_kib: u64,
    edges: HashMap<(HostId, HostId), u64>,
    up: HashMap<HostId, u64>,
    down: HashMap<HostId, u64>,
}

impl StaticTopology {
    /// Default bandwidth when none was configured: 10 MiB/s each way.
    pub const DEFAULT_BANDWIDTH_KIB: u64 = 10 * 1024;

    /// A topology where every pair of distinct hosts is `default_latency_ms`
    /// apart.
    pub fn new(default_latency_ms: u64) -> Self {
        Self {
            default_latency_ms,
            default_bandwidth_kib: Self::DEFAULT_BANDWIDTH_KIB,
            edges: HashMap::new(),
            up: HashMap::new(),
            down: HashMap::new(),
        }
    }

    /// Set the one-way latency of a single directed edge.
    pub fn set_latency(&mut self, src: HostId, dst: HostId, ms: u64) -> &mut Self {
        self.edges.insert((src, dst), ms);
        self
    }

    /// Set a host's up/down bandwidth in KiB/s.
    pub fn set_bandwidth(&mut self, host: HostId, up_kib: u64, down_kib: u64) -> &mut Self {
        self.up.insert(host, up_kib);
        self.down.insert(host, down_kib);
        self
    }

    /// Minimum explicit outgoing edge latency of `host`, if any.
    fn min_outgoing(&self, host: HostId) -> Option<u64> {
        self.edges
            .iter()
            .filter(|((src, dst), _)| *src == host && *dst != host)
            .map(|(_, &ms)| ms)
            .min()
    }
}

impl Topology for StaticTopology {
    fn latency_ms(&self, src: HostId, dst: HostId) -> u64 {
        if let Some(&ms) = self.edges.get(&(src, dst)) {
            return ms;
        }
        if src == dst {
            // No true self-edge: twice the cheapest way out.
            return 2 * self.min_outgoing(src).unwrap_or(self.default_latency_ms);
        }
        self.default_latency_ms
    }

    fn bandwidth_up_kib(&self, host: HostId) -> u64 {
        self.up.get(&host).copied().unwrap_or(self.default_bandwidth_kib)
    }

    fn bandwidth_down_kib(&self, host: HostId) -> u64 {
        self.down
            .get(&host)
            .copied()
            .unwrap_or(self.default_bandwidth_kib)
    }

    fn min_latency_ms(&self) -> u64 {
        self.edges
            .values()
            .copied()
            .min()
            .unwrap_or(self.default_latency_ms)
            .min(self.default_latency_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: HostId = HostId(1);
    const B: HostId = HostId(2);

    #[test]
    fn default_latency_applies_to_unknown_edges() {
        let topo = StaticTopology::new(7);
        assert_eq!(topo.latency_ms(A, B), 7);
        assert_eq!(topo.min_latency_ms(), 7);
    }

    #[test]
    fn explicit_edge_wins() {
        let mut topo = StaticTopology::new(7);
        topo.set_latency(A, B, 3);
        assert_eq!(topo.latency_ms(A, B), 3);
        assert_eq!(topo.latency_ms(B, A), 7);
        assert_eq!(topo.min_latency_ms(), 3);
    }

    #[test]
    fn self_loop_prefers_true_self_edge() {
        let mut topo = StaticTopology::new(10);
        topo.set_latency(A, A, 1);
        assert_eq!(topo.latency_ms(A, A), 1);
    }

    #[test]
    fn self_loop_falls_back_to_twice_min_outgoing() {
        let mut topo = StaticTopology::new(10);
        topo.set_latency(A, B, 4);
        assert_eq!(topo.latency_ms(A, A), 8);
        // Host with no explicit edges: twice the default.
        assert_eq!(topo.latency_ms(B, B), 20);
    }

    #[test]
    fn zero_latency_is_substituted_by_consumers() {
        assert_eq!(clamp_latency_ms(0), 1);
        assert_eq!(clamp_latency_ms(5), 5);
    }
}

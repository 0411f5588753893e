//! Policy unit tests: the causality clamp, the pop contract, and the
//! per-variant queue mechanics.

use slopsim_lib::SimTime;

use crate::event::{Event, HostId};

use super::{EventPolicy, PolicyKind};

const A: HostId = HostId(1);
const B: HostId = HostId(2);

fn ev(key: u64, dst: HostId, ms: u64) -> Event<u32> {
    Event::new(key, dst, SimTime::from_millis(ms), key as u32)
}

/// Two hosts on two threads, for the parallel variants.
fn two_thread_policy(kind: PolicyKind) -> EventPolicy<u32> {
    let mut policy = EventPolicy::new(kind, 2);
    policy.add_host(A, 0);
    policy.add_host(B, 1);
    policy
}

#[test]
fn serial_pops_in_time_order() {
    let mut policy = EventPolicy::new(PolicyKind::GlobalSingle, 0);
    policy.add_host(A, 0);
    policy.add_host(B, 0);
    policy.push(ev(1, A, 30), A, SimTime::ZERO);
    policy.push(ev(2, B, 10), B, SimTime::ZERO);
    policy.push(ev(3, A, 20), A, SimTime::ZERO);

    let end = SimTime::from_millis(100);
    let order: Vec<u64> = core::iter::from_fn(|| policy.pop(0, end))
        .map(|e| e.key())
        .collect();
    assert_eq!(order, vec![2, 3, 1]);
    assert_eq!(policy.total_pushes(), 3);
    assert_eq!(policy.total_pops(), 3);
}

#[test]
fn pop_is_strictly_before_round_end() {
    for kind in [
        PolicyKind::HostSingle,
        PolicyKind::ThreadSingle,
        PolicyKind::ThreadPerHost,
    ] {
        let policy = two_thread_policy(kind);
        policy.push(ev(1, A, 5), A, SimTime::ZERO);
        // An event exactly at the round end must not pop.
        assert!(policy.pop(0, SimTime::from_millis(5)).is_none(), "{kind:?}");
        assert!(policy.pop(0, SimTime::from_millis(6)).is_some(), "{kind:?}");
    }
}

#[test]
fn cross_thread_push_is_clamped_to_round_end() {
    for kind in [
        PolicyKind::HostSingle,
        PolicyKind::ThreadSingle,
        PolicyKind::ThreadPerHost,
    ] {
        let policy = two_thread_policy(kind);
        let round_end = SimTime::from_millis(5);
        // A (thread 0) sends to B (thread 1) inside the round.
        policy.push(ev(1, B, 2), A, round_end);

        // Not visible in the current round...
        assert!(policy.pop(1, round_end).is_none(), "{kind:?}");
        // ...and raised exactly to the round end for the next one.
        assert_eq!(policy.next_time(1), round_end, "{kind:?}");
        let event = policy
            .pop(1, SimTime::from_millis(10))
            .unwrap_or_else(|| panic!("{kind:?}: clamped event lost"));
        assert_eq!(event.time(), round_end, "{kind:?}");
    }
}

#[test]
fn cross_thread_push_beyond_round_end_is_untouched() {
    for kind in [
        PolicyKind::HostSingle,
        PolicyKind::ThreadSingle,
        PolicyKind::ThreadPerHost,
    ] {
        let policy = two_thread_policy(kind);
        policy.push(ev(1, B, 8), A, SimTime::from_millis(5));
        assert_eq!(policy.next_time(1), SimTime::from_millis(8), "{kind:?}");
    }
}

#[test]
fn same_thread_push_is_never_clamped() {
    for kind in [
        PolicyKind::HostSingle,
        PolicyKind::ThreadSingle,
        PolicyKind::ThreadPerHost,
    ] {
        let policy = two_thread_policy(kind);
        // A pushes to itself inside the round.
        policy.push(ev(1, A, 2), A, SimTime::from_millis(5));
        let event = policy.pop(0, SimTime::from_millis(5)).expect("own event");
        assert_eq!(event.time(), SimTime::from_millis(2), "{kind:?}");
    }
}

#[test]
fn thread_single_pops_monotone_across_secondary_migration() {
    let policy = two_thread_policy(PolicyKind::ThreadSingle);
    let round1 = SimTime::from_millis(5);
    // Cross-thread events into B's secondary, clamped to 5 ms.
    policy.push(ev(1, B, 1), A, round1);
    policy.push(ev(2, B, 3), A, round1);
    // B's own later event.
    policy.push(ev(3, B, 7), B, round1);

    let round2 = SimTime::from_millis(20);
    let mut last = SimTime::ZERO;
    let mut keys = Vec::new();
    while let Some(event) = policy.pop(1, round2) {
        assert!(event.time() >= last, "pop went backwards");
        last = event.time();
        keys.push(event.key());
    }
    // Clamped events (both at 5 ms, FIFO by key) run before the 7 ms one.
    assert_eq!(keys, vec![1, 2, 3]);
}

#[test]
fn host_single_drains_each_host_fully_before_advancing() {
    let mut policy = EventPolicy::new(PolicyKind::HostSingle, 1);
    policy.add_host(A, 0);
    policy.add_host(B, 0);
    policy.push(ev(1, A, 3), A, SimTime::ZERO);
    policy.push(ev(2, A, 7), A, SimTime::ZERO);
    policy.push(ev(3, B, 1), B, SimTime::ZERO);

    let end = SimTime::from_millis(10);
    let order: Vec<u64> = core::iter::from_fn(|| policy.pop(0, end))
        .map(|e| e.key())
        .collect();
    // A was added first and is drained fully even though B's event is
    // earlier in time; per-host order is still by time.
    assert_eq!(order, vec![1, 2, 3]);
}

#[test]
fn host_single_buckets_reset_when_round_advances() {
    let mut policy = EventPolicy::new(PolicyKind::HostSingle, 1);
    policy.add_host(A, 0);
    policy.push(ev(1, A, 2), A, SimTime::ZERO);
    policy.push(ev(2, A, 12), A, SimTime::ZERO);

    let round1 = SimTime::from_millis(10);
    assert_eq!(policy.pop(0, round1).unwrap().key(), 1);
    // Host A moved to the processed bucket for this round.
    assert!(policy.pop(0, round1).is_none());
    assert_eq!(policy.next_time(0), SimTime::from_millis(12));

    // Advancing the round sweeps A again.
    let round2 = SimTime::from_millis(20);
    assert_eq!(policy.pop(0, round2).unwrap().key(), 2);
}

#[test]
fn next_time_is_max_when_empty() {
    for kind in [
        PolicyKind::HostSingle,
        PolicyKind::ThreadSingle,
        PolicyKind::ThreadPerHost,
    ] {
        let policy = two_thread_policy(kind);
        assert!(policy.next_time(0).is_max(), "{kind:?}");
        assert!(policy.next_time(1).is_max(), "{kind:?}");
    }
}

#[test]
fn assigned_hosts_reflect_setup() {
    let policy = two_thread_policy(PolicyKind::ThreadPerHost);
    assert_eq!(policy.assigned_hosts(0), vec![A]);
    assert_eq!(policy.assigned_hosts(1), vec![B]);
    assert_eq!(policy.owner_of(A), Some(0));
    assert_eq!(policy.owner_of(HostId(99)), None);
}

#[test]
#[should_panic(expected = "non-existent bucket")]
fn push_to_unknown_host_is_fatal() {
    let policy = two_thread_policy(PolicyKind::ThreadSingle);
    policy.push(ev(1, HostId(99), 1), A, SimTime::ZERO);
}

//! Reusable count-down latch.
//!
//! The round protocol parks every participant (workers plus the driver) at a
//! sequence of latches.  A participant calls [`pass`](CountDownLatch::pass):
//! the count drops by one and the caller spins until the count reaches zero.
//! The last arrival reloads the count **before** publishing the release, so
//! the latch is immediately reusable for the next round — a participant that
//! races ahead and re-enters the same latch decrements the fresh count and
//! blocks for the new round.
//!
//! Release detection is generation-based: waiters spin on a generation
//! counter rather than the count itself, which makes the reload/release pair
//! race-free without a second lock.  Proportional `spin_loop` backoff keeps
//! cache-line traffic down while parked, same discipline as the ticket lock
//! waiters elsewhere in the workspace.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A self-reloading count-down latch for a fixed set of participants.
#[derive(Debug)]
pub struct CountDownLatch {
    /// Reload value — the number of participants.
    initial: u32,
    /// Arrivals still outstanding for the current round.
    remaining: AtomicU32,
    /// Bumped once per release; waiters spin on this.
    generation: AtomicU64,
}

impl CountDownLatch {
    /// A latch released by `count` arrivals per round.
    ///
    /// `count` must be non-zero.
    pub fn new(count: u32) -> Self {
        assert!(count > 0, "latch participant count must be non-zero");
        Self {
            initial: count,
            remaining: AtomicU32::new(count),
            generation: AtomicU64::new(0),
        }
    }

    /// Count down and block until every participant of this round arrived.
    pub fn pass(&self) {
        let gen_before = self.generation.load(Ordering::Acquire);
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "latch counted below zero");

        if prev == 1 {
            // Last arrival: reload for the next round, then release. The
            // reload must be visible before the generation bump, otherwise a
            // racing re-entrant participant would decrement a stale zero.
            self.remaining.store(self.initial, Ordering::Release);
            self.generation.fetch_add(1, Ordering::Release);
            return;
        }

        let mut backoff = 1u32;
        while self.generation.load(Ordering::Acquire) == gen_before {
            for _ in 0..backoff {
                spin_loop();
            }
            backoff = (backoff * 2).min(64);
        }
    }

    /// Number of participants the latch reloads to.
    #[inline]
    pub fn participants(&self) -> u32 {
        self.initial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn single_participant_never_blocks() {
        let latch = CountDownLatch::new(1);
        for _ in 0..3 {
            latch.pass();
        }
    }

    #[test]
    fn releases_all_participants_together() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 50;

        let latch = Arc::new(CountDownLatch::new(THREADS as u32));
        let entered = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let latch = Arc::clone(&latch);
                let entered = Arc::clone(&entered);
                std::thread::spawn(move || {
                    for round in 0..ROUNDS {
                        entered.fetch_add(1, Ordering::SeqCst);
                        latch.pass();
                        // Everyone from this round must have entered before
                        // anyone proceeds past the latch.
                        let seen = entered.load(Ordering::SeqCst);
                        assert!(
                            seen >= (round + 1) * THREADS,
                            "released early: saw {seen} entries in round {round}"
                        );
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), THREADS * ROUNDS);
    }

    #[test]
    fn reload_survives_uneven_pacing() {
        // One fast thread loops through rounds as quickly as it can while a
        // slow thread lags; the self-reload must keep them in lock-step.
        let latch = Arc::new(CountDownLatch::new(2));
        let fast = {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    latch.pass();
                }
            })
        };
        for _ in 0..200 {
            std::thread::yield_now();
            latch.pass();
        }
        fast.join().unwrap();
    }
}

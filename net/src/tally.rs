//! Retransmit tally — per-connection loss bookkeeping.
//!
//! The tally answers one question for the send path: which sequence ranges
//! are currently considered lost and therefore eligible for retransmission
//! on the next flush?  It tracks three primary half-open range sets
//! (marked-lost, sacked, retransmitted) and derives
//!
//! ```text
//! lost = marked-lost \ (sacked ∪ retransmitted)
//! ```
//!
//! after every mutation.  Three consecutive duplicate acknowledgments
//! promote the whole outstanding window into marked-lost (fast
//! retransmit).
//!
//! Every set coalesces adjacent and overlapping ranges on every mutation;
//! without coalescing the sets grow linearly in packets sent, which is the
//! classic unbounded-growth pitfall of this bookkeeping.

use crate::types::SeqRange;

/// Duplicate acks needed to trigger fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

bitflags::bitflags! {
    /// What an [`RetransmitTally::update`] call learned.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TallyFlags: u8 {
        /// The cumulative acknowledgment advanced.
        const DATA_ACKED  = 1 << 0;
        /// New selective-acknowledgment coverage arrived.
        const DATA_SACKED = 1 << 1;
    }
}

/// A sorted, disjoint, coalesced set of half-open sequence ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct RangeSet {
    ranges: Vec<SeqRange>,
}

impl RangeSet {
    fn clear(&mut self) {
        self.ranges.clear();
    }

    fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Insert a range, coalescing with any overlapping or adjacent ones.
    /// Returns `true` if the set's coverage grew.
    fn add(&mut self, range: SeqRange) -> bool {
        if range.is_empty() {
            return false;
        }
        // Find the insertion window: every existing range that overlaps or
        // touches `range` merges into it.
        let mut begin = range.begin;
        let mut end = range.end;
        let mut first = self.ranges.len();
        let mut last = first;
        let mut covered = 0u64;
        for (i, r) in self.ranges.iter().enumerate() {
            if r.end < begin {
                continue;
            }
            if r.begin > end {
                if first == self.ranges.len() {
                    first = i;
                    last = i;
                }
                break;
            }
            // Overlapping or adjacent.
            if first == self.ranges.len() {
                first = i;
            }
            last = i + 1;
            covered += u64::from(r.end.min(end).saturating_sub(r.begin.max(begin)));
            begin = begin.min(r.begin);
            end = end.max(r.end);
        }
        if first == self.ranges.len() {
            // Strictly after everything (or set empty).
            let pos = self
                .ranges
                .iter()
                .position(|r| r.begin > end)
                .unwrap_or(self.ranges.len());
            self.ranges.insert(pos, SeqRange::new(begin, end));
            return true;
        }
        let grew = covered < u64::from(range.len());
        self.ranges
            .splice(first..last, core::iter::once(SeqRange::new(begin, end)));
        grew
    }

    /// Drop all coverage below `seq` (cumulative-ack advance).
    fn remove_below(&mut self, seq: u32) {
        self.ranges.retain_mut(|r| {
            if r.end <= seq {
                return false;
            }
            if r.begin < seq {
                r.begin = seq;
            }
            true
        });
    }

    /// `true` if `seq` is covered.
    fn contains(&self, seq: u32) -> bool {
        self.ranges.iter().any(|r| r.contains(seq))
    }

    /// `self` minus `a` minus `b`, as a fresh coalesced set.
    fn difference2(&self, a: &RangeSet, b: &RangeSet) -> RangeSet {
        let mut out = RangeSet::default();
        for r in &self.ranges {
            let mut pending = vec![*r];
            for sub in a.ranges.iter().chain(b.ranges.iter()) {
                let mut next = Vec::with_capacity(pending.len() + 1);
                for p in pending {
                    if sub.end <= p.begin || sub.begin >= p.end {
                        next.push(p);
                        continue;
                    }
                    if sub.begin > p.begin {
                        next.push(SeqRange::new(p.begin, sub.begin));
                    }
                    if sub.end < p.end {
                        next.push(SeqRange::new(sub.end, p.end));
                    }
                }
                pending = next;
                if pending.is_empty() {
                    break;
                }
            }
            for p in pending {
                out.add(p);
            }
        }
        out
    }
}

/// Per-connection acked/sacked/retransmitted/lost bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct RetransmitTally {
    marked_lost: RangeSet,
    sacked: RangeSet,
    retransmitted: RangeSet,
    lost: RangeSet,
    dup_ack_count: u32,
    last_ack: u32,
    new_sack_info: bool,
}

impl RetransmitTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last cumulative acknowledgment fed to [`update`](Self::update).
    #[inline]
    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    /// Consecutive duplicate acks seen since the last advance.
    #[inline]
    pub fn dup_ack_count(&self) -> u32 {
        self.dup_ack_count
    }

    /// Feed an acknowledgment.  `send_horizon` is `highest_sent + 1`.
    /// Advances the cumulative ack, counts duplicates, and on the third
    /// consecutive duplicate promotes `[last_ack, send_horizon)` into
    /// marked-lost (fast retransmit).
    pub fn update(&mut self, ack: u32, send_horizon: u32, is_dup_ack: bool) -> TallyFlags {
        let mut flags = TallyFlags::empty();

        if ack > self.last_ack {
            flags |= TallyFlags::DATA_ACKED;
            self.last_ack = ack;
            self.dup_ack_count = 0;
            // Acked coverage is gone from every set.
            self.marked_lost.remove_below(ack);
            self.sacked.remove_below(ack);
            self.retransmitted.remove_below(ack);
        } else if is_dup_ack {
            self.dup_ack_count += 1;
            if self.dup_ack_count == DUP_ACK_THRESHOLD && send_horizon > self.last_ack {
                log::debug!(
                    "fast retransmit: marking [{}, {}) lost after {} dup acks",
                    self.last_ack,
                    send_horizon,
                    self.dup_ack_count
                );
                self.marked_lost
                    .add(SeqRange::new(self.last_ack, send_horizon));
            }
        }

        if self.new_sack_info {
            flags |= TallyFlags::DATA_SACKED;
            self.new_sack_info = false;
        }

        self.recompute_lost();
        flags
    }

    /// Record the selective-ack blocks of a received header.
    pub fn mark_sacked(&mut self, sacks: &[SeqRange]) {
        for &range in sacks {
            if self.sacked.add(range) {
                self.new_sack_info = true;
            }
        }
        self.recompute_lost();
    }

    /// Declare `[begin, end)` lost (RTO path).
    pub fn mark_lost(&mut self, begin: u32, end: u32) {
        self.marked_lost.add(SeqRange::new(begin, end));
        self.recompute_lost();
    }

    /// Record that `[begin, end)` has been retransmitted; the range leaves
    /// the lost set until it is marked lost again.
    pub fn mark_retransmitted(&mut self, begin: u32, end: u32) {
        self.retransmitted.add(SeqRange::new(begin, end));
        self.recompute_lost();
    }

    /// Forget retransmission history (invoked on RTO, so the whole window
    /// becomes eligible again).
    pub fn clear_retransmitted(&mut self) {
        self.retransmitted.clear();
        self.recompute_lost();
    }

    /// Number of disjoint ranges currently considered lost.
    pub fn num_lost_ranges(&self) -> usize {
        self.lost.len()
    }

    /// `true` if nothing is currently considered lost.
    pub fn nothing_lost(&self) -> bool {
        self.lost.is_empty()
    }

    /// Append the currently-lost ranges to `out`.
    pub fn populate_lost_ranges(&self, out: &mut Vec<SeqRange>) {
        out.extend_from_slice(&self.lost.ranges);
    }

    fn recompute_lost(&mut self) {
        self.lost = self.marked_lost.difference2(&self.sacked, &self.retransmitted);
        debug_assert!(self.check_invariants());
    }

    /// lost ⊆ marked-lost, lost ∩ sacked = ∅, lost ∩ retransmitted = ∅.
    fn check_invariants(&self) -> bool {
        for r in &self.lost.ranges {
            for seq in r.begin..r.end {
                if !self.marked_lost.contains(seq)
                    || self.sacked.contains(seq)
                    || self.retransmitted.contains(seq)
                {
                    return false;
                }
            }
        }
        true
    }
}

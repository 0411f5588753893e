//! Retransmit-tally tests: coalescing, fast-retransmit promotion, and the
//! lost-set invariants.

use crate::types::SeqRange;

use super::tally::{DUP_ACK_THRESHOLD, RetransmitTally, TallyFlags};

fn lost_ranges(tally: &RetransmitTally) -> Vec<SeqRange> {
    let mut out = Vec::new();
    tally.populate_lost_ranges(&mut out);
    out
}

#[test]
fn advancing_ack_reports_data_acked() {
    let mut tally = RetransmitTally::new();
    let flags = tally.update(3, 6, false);
    assert!(flags.contains(TallyFlags::DATA_ACKED));
    assert_eq!(tally.last_ack(), 3);

    // Same ack again: nothing new.
    let flags = tally.update(3, 6, false);
    assert!(flags.is_empty());
}

#[test]
fn third_duplicate_ack_marks_outstanding_window_lost() {
    let mut tally = RetransmitTally::new();
    tally.update(2, 6, false);

    for i in 1..DUP_ACK_THRESHOLD {
        tally.update(2, 6, true);
        assert_eq!(tally.dup_ack_count(), i);
        assert_eq!(tally.num_lost_ranges(), 0, "promoted too early");
    }
    tally.update(2, 6, true);
    assert_eq!(lost_ranges(&tally), vec![SeqRange::new(2, 6)]);

    // A fourth duplicate does not widen anything.
    tally.update(2, 6, true);
    assert_eq!(lost_ranges(&tally), vec![SeqRange::new(2, 6)]);
}

#[test]
fn sacked_ranges_leave_the_lost_set() {
    let mut tally = RetransmitTally::new();
    tally.mark_lost(1, 6);
    tally.mark_sacked(&[SeqRange::new(3, 4)]);
    assert_eq!(
        lost_ranges(&tally),
        vec![SeqRange::new(1, 3), SeqRange::new(4, 6)]
    );

    let flags = tally.update(1, 6, false);
    assert!(flags.contains(TallyFlags::DATA_SACKED));
}

#[test]
fn retransmitted_ranges_leave_the_lost_set_until_cleared() {
    let mut tally = RetransmitTally::new();
    tally.mark_lost(1, 5);
    tally.mark_retransmitted(1, 5);
    assert_eq!(tally.num_lost_ranges(), 0);

    // RTO forgets retransmission history; the range is lost again.
    tally.clear_retransmitted();
    assert_eq!(lost_ranges(&tally), vec![SeqRange::new(1, 5)]);
}

#[test]
fn mark_lost_then_retransmit_reduces_by_component_count() {
    let mut tally = RetransmitTally::new();
    // Two disjoint lost components.
    tally.mark_lost(1, 3);
    tally.mark_lost(5, 8);
    assert_eq!(tally.num_lost_ranges(), 2);

    tally.mark_retransmitted(1, 3);
    assert_eq!(tally.num_lost_ranges(), 1);
    tally.mark_retransmitted(5, 8);
    assert_eq!(tally.num_lost_ranges(), 0);
}

#[test]
fn coalescing_keeps_range_counts_bounded() {
    let mut tally = RetransmitTally::new();
    // 100 adjacent single-sequence marks collapse into one range.
    for seq in 1..101 {
        tally.mark_lost(seq, seq + 1);
    }
    assert_eq!(lost_ranges(&tally), vec![SeqRange::new(1, 101)]);

    // Overlapping sack blocks collapse too.
    tally.mark_sacked(&[SeqRange::new(10, 20)]);
    tally.mark_sacked(&[SeqRange::new(15, 25)]);
    assert_eq!(
        lost_ranges(&tally),
        vec![SeqRange::new(1, 10), SeqRange::new(25, 101)]
    );
}

#[test]
fn cumulative_ack_trims_every_set() {
    let mut tally = RetransmitTally::new();
    tally.mark_lost(1, 10);
    tally.mark_sacked(&[SeqRange::new(4, 6)]);
    tally.mark_retransmitted(1, 2);

    // Ack past part of everything.
    let flags = tally.update(5, 10, false);
    assert!(flags.contains(TallyFlags::DATA_ACKED));
    // Below 5 is gone; [5,6) is still sacked; [6,10) is lost.
    assert_eq!(lost_ranges(&tally), vec![SeqRange::new(6, 10)]);
}

#[test]
fn dup_acks_below_threshold_then_advance_resets_count() {
    let mut tally = RetransmitTally::new();
    tally.update(2, 6, false);
    tally.update(2, 6, true);
    tally.update(2, 6, true);
    assert_eq!(tally.dup_ack_count(), 2);

    // The ack advances: the duplicate streak is over.
    tally.update(4, 6, false);
    assert_eq!(tally.dup_ack_count(), 0);
    assert_eq!(tally.num_lost_ranges(), 0);
}

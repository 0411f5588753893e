//! Congestion-control hooks.
//!
//! The connection state machine never implements a congestion scheme
//! itself; it drives a [`CongestionModule`] through a small hook surface
//! (new ack, duplicate ack, timeout) and reads the resulting window.  Reno
//! is the concrete module shipped here; other schemes slot in without
//! touching the state machine.

use core::fmt;

/// Sender-side recovery state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    /// Normal operation.
    Open,
    /// Fast retransmit triggered; recovering from isolated loss.
    Recovery,
    /// Retransmission timeout; window collapsed.
    Loss,
}

/// The congestion window the module mutates, in packets.
#[derive(Clone, Debug)]
pub struct CongestionWindow {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub state: RecoveryState,
}

impl CongestionWindow {
    pub fn new(initial_cwnd: u32) -> Self {
        Self {
            cwnd: initial_cwnd.max(1),
            ssthresh: u32::MAX,
            state: RecoveryState::Open,
        }
    }
}

/// The hook table.  One call per acknowledgment event; the module owns all
/// scheme-specific counters.
pub trait CongestionModule: Send + fmt::Debug {
    /// `packets_acked` new packets were cumulatively acknowledged.
    fn new_ack(&mut self, window: &mut CongestionWindow, packets_acked: u32);

    /// A duplicate acknowledgment arrived.
    fn duplicate_ack(&mut self, window: &mut CongestionWindow);

    /// The retransmission timer expired.
    fn timeout(&mut self, window: &mut CongestionWindow);

    /// The current slow-start threshold.
    fn ssthresh(&self, window: &CongestionWindow) -> u32 {
        window.ssthresh
    }

    /// The connection reached CLOSED; release any scheme-specific state.
    /// Deallocation itself is the owner's job (the connection drops its
    /// boxed module), so the default is a no-op.
    fn delete(&mut self, _window: &CongestionWindow) {}
}

/// Minimum congestion window after any reduction.
const MIN_CWND: u32 = 2;

/// Classic Reno: slow start below ssthresh, additive increase above it,
/// halve on fast retransmit, collapse to one packet on timeout.
#[derive(Debug, Default)]
pub struct Reno {
    /// Consecutive duplicate acks in the current streak.
    dup_count: u32,
    /// Fractional-increase accumulator for congestion avoidance.
    increase_accum: u32,
}

impl Reno {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CongestionModule for Reno {
    fn new_ack(&mut self, window: &mut CongestionWindow, packets_acked: u32) {
        self.dup_count = 0;
        if window.cwnd < window.ssthresh {
            // Slow start: one packet per acked packet.
            window.cwnd = window.cwnd.saturating_add(packets_acked);
        } else {
            // Congestion avoidance: one packet per window's worth of acks.
            self.increase_accum += packets_acked;
            if self.increase_accum >= window.cwnd {
                self.increase_accum -= window.cwnd;
                window.cwnd += 1;
            }
        }
    }

    fn duplicate_ack(&mut self, window: &mut CongestionWindow) {
        self.dup_count += 1;
        if self.dup_count == crate::tally::DUP_ACK_THRESHOLD
            && window.state == RecoveryState::Open
        {
            window.ssthresh = (window.cwnd / 2).max(MIN_CWND);
            window.cwnd = window.ssthresh;
            window.state = RecoveryState::Recovery;
            log::debug!("reno: fast retransmit, cwnd halved to {}", window.cwnd);
        }
    }

    fn timeout(&mut self, window: &mut CongestionWindow) {
        window.ssthresh = (window.cwnd / 2).max(MIN_CWND);
        window.cwnd = 1;
        window.state = RecoveryState::Loss;
        self.dup_count = 0;
        self.increase_accum = 0;
        log::debug!("reno: timeout, cwnd collapsed (ssthresh {})", window.ssthresh);
    }

    fn delete(&mut self, window: &CongestionWindow) {
        self.dup_count = 0;
        self.increase_accum = 0;
        log::trace!("reno: deleted (final cwnd {})", window.cwnd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_doubles_per_window() {
        let mut reno = Reno::new();
        let mut win = CongestionWindow::new(2);
        reno.new_ack(&mut win, 2);
        assert_eq!(win.cwnd, 4);
        reno.new_ack(&mut win, 4);
        assert_eq!(win.cwnd, 8);
    }

    #[test]
    fn congestion_avoidance_grows_linearly() {
        let mut reno = Reno::new();
        let mut win = CongestionWindow::new(10);
        win.ssthresh = 10;
        // A full window of acks buys one packet.
        for _ in 0..10 {
            reno.new_ack(&mut win, 1);
        }
        assert_eq!(win.cwnd, 11);
    }

    #[test]
    fn third_dup_ack_halves_once() {
        let mut reno = Reno::new();
        let mut win = CongestionWindow::new(16);
        win.ssthresh = 16;
        reno.duplicate_ack(&mut win);
        reno.duplicate_ack(&mut win);
        assert_eq!(win.cwnd, 16);
        reno.duplicate_ack(&mut win);
        assert_eq!(win.cwnd, 8);
        assert_eq!(win.state, RecoveryState::Recovery);
        // Further duplicates inside recovery do not halve again.
        reno.duplicate_ack(&mut win);
        assert_eq!(win.cwnd, 8);
    }

    #[test]
    fn timeout_collapses_to_one() {
        let mut reno = Reno::new();
        let mut win = CongestionWindow::new(16);
        reno.timeout(&mut win);
        assert_eq!(win.cwnd, 1);
        assert_eq!(win.ssthresh, 8);
        assert_eq!(win.state, RecoveryState::Loss);
    }

    #[test]
    fn delete_clears_scheme_counters() {
        let mut reno = Reno::new();
        let mut win = CongestionWindow::new(8);
        reno.duplicate_ack(&mut win);
        reno.duplicate_ack(&mut win);
        reno.delete(&win);
        // The streak is gone: one more duplicate must not trigger fast
        // retransmit.
        reno.duplicate_ack(&mut win);
        assert_eq!(win.state, RecoveryState::Open);
        assert_eq!(win.cwnd, 8);
    }

    #[test]
    fn reduction_never_goes_below_minimum() {
        let mut reno = Reno::new();
        let mut win = CongestionWindow::new(2);
        for _ in 0..3 {
            reno.duplicate_ack(&mut win);
        }
        assert_eq!(win.ssthresh, 2);
        assert_eq!(win.cwnd, 2);
    }
}

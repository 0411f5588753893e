//! `slopsim-net` — the simulated TCP transport.
//!
//! The host-side half of the simulator: wire packets ([`packet`]), the
//! retransmit tally ([`tally`]), the TCP connection state machine
//! ([`tcp`]), descriptor status plumbing ([`status`]), congestion hooks
//! ([`congestion`]), and the host glue that executes scheduler events and
//! exposes the user socket surface ([`host`], [`socket`]).
//!
//! Hosts implement `slopsim_core::Host`, so a simulation is assembled by
//! handing a set of [`host::SimHost`]s to a `slopsim_core::Scheduler`.

pub mod config;
pub mod congestion;
pub mod host;
pub mod packet;
pub mod socket;
pub mod status;
pub mod tally;
pub mod tcp;
pub mod types;

#[cfg(test)]
mod tally_tests;

pub use config::TcpConfig;
pub use host::{AddressBook, ControlFn, NetPayload, SimHost};
pub use packet::{Packet, TcpFlags, TcpHeader};
pub use status::{DescriptorStatus, StatusFilter, StatusListener};
pub use tally::{RetransmitTally, TallyFlags};
pub use tcp::{TcpConnection, TcpInfo, TcpState, TimerKind};
pub use types::{Port, SeqRange, ShutdownHow, SockAddr, SockError, SockHandle};

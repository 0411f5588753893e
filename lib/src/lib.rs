//! `slopsim-lib` — foundation types for the slopsim simulator.
//!
//! Deliberately small: the simulated-time newtype, the indexed min-heap
//! every event queue is built on, and the count-down latch the round
//! protocol parks on.  Anything protocol- or scheduler-shaped lives in
//! `slopsim-core` and `slopsim-net`.

pub mod latch;
pub mod pqueue;
pub mod simtime;

pub use latch::CountDownLatch;
pub use pqueue::IndexedMinHeap;
pub use simtime::SimTime;

//! Descriptor status bits and listeners.
//!
//! Every socket carries a small status bit-set the transport flips as the
//! connection evolves.  Poll-like waiters register a [`StatusListener`]
//! with a monitored mask and a direction filter; the descriptor invokes the
//! callback on exactly the transitions the listener asked for, without the
//! transport ever reaching into the waiter.

use std::sync::Arc;

bitflags::bitflags! {
    /// Descriptor readiness bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct DescriptorStatus: u8 {
        /// The descriptor is open and usable.
        const ACTIVE   = 1 << 0;
        /// A read would make progress (data buffered, accept queue
        /// non-empty, or EOF pending).
        const READABLE = 1 << 1;
        /// A write would make progress (send buffer has room).
        const WRITABLE = 1 << 2;
        /// The descriptor has been closed by the user.
        const CLOSED   = 1 << 3;
    }
}

/// Which direction of a bit flip a listener cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusFilter {
    /// Only off → on transitions.
    OffToOn,
    /// Only on → off transitions.
    OnToOff,
    /// Both directions.
    Both,
}

/// Callback invoked with `(current_status, transitions)`.
pub type StatusCallback = dyn Fn(DescriptorStatus, DescriptorStatus) + Send + Sync;

/// A registered status waiter.
pub struct StatusListener {
    monitored: DescriptorStatus,
    filter: StatusFilter,
    callback: Box<StatusCallback>,
}

impl StatusListener {
    pub fn new(
        monitored: DescriptorStatus,
        filter: StatusFilter,
        callback: Box<StatusCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            monitored,
            filter,
            callback,
        })
    }

    /// Invoke the callback iff `transitions` intersects the monitored mask
    /// and the flip direction matches the filter.
    fn notify(&self, current: DescriptorStatus, transitions: DescriptorStatus) {
        let interesting = self.monitored & transitions;
        if interesting.is_empty() {
            return;
        }
        let went_on = current & interesting;
        let fires = match self.filter {
            StatusFilter::OffToOn => !went_on.is_empty(),
            StatusFilter::OnToOff => went_on != interesting,
            StatusFilter::Both => true,
        };
        if fires {
            (self.callback)(current, transitions);
        }
    }
}

impl core::fmt::Debug for StatusListener {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusListener")
            .field("monitored", &self.monitored)
            .field("filter", &self.filter)
            .finish()
    }
}

/// A descriptor: the status bits plus its reference-counted listeners.
#[derive(Debug, Default)]
pub struct Descriptor {
    status: DescriptorStatus,
    listeners: Vec<Arc<StatusListener>>,
}

impl Descriptor {
    pub fn new() -> Self {
        Self {
            status: DescriptorStatus::ACTIVE,
            listeners: Vec::new(),
        }
    }

    #[inline]
    pub fn status(&self) -> DescriptorStatus {
        self.status
    }

    pub fn add_listener(&mut self, listener: Arc<StatusListener>) {
        self.listeners.push(listener);
    }

    /// Set or clear `bits`, notifying listeners of any actual flips.
    pub fn adjust(&mut self, bits: DescriptorStatus, on: bool) {
        let new = if on {
            self.status | bits
        } else {
            self.status - bits
        };
        let transitions = self.status ^ new;
        if transitions.is_empty() {
            return;
        }
        self.status = new;
        self.on_status_changed(transitions);
    }

    fn on_status_changed(&self, transitions: DescriptorStatus) {
        for listener in &self.listeners {
            listener.notify(self.status, transitions);
        }
    }
}

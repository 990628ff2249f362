//! Protocol trackers.
//!
//! A tracker subscribes to decode events by name, maintains per-session
//! state in one or more [`TimeWheel`](crate::cache::TimeWheel) instances,
//! and emits records through the pipeline's [`Sink`]. Trackers are driven
//! two ways: once per matching packet, and once per synthesized clock tick.

mod dns;
mod flow;

pub use dns::DnsTracker;
pub use flow::FlowTracker;

use crate::decode::Property;
use crate::output::Sink;
use crate::Result;

/// A stateful consumer of decoded packet events.
pub trait Tracker {
    /// Event names this tracker wants delivered to [`Tracker::on_packet`].
    fn events(&self) -> &'static [&'static str];

    /// Handle one decoded packet carrying a subscribed event.
    fn on_packet(&mut self, prop: &Property, sink: &mut dyn Sink) -> Result<()>;

    /// Handle a clock tick. `elapsed` is the number of whole seconds of
    /// capture time since the previous tick, `now` the current capture
    /// clock in epoch seconds.
    fn on_tick(&mut self, elapsed: u64, now: i64, sink: &mut dyn Sink) -> Result<()>;

    /// Flush remaining state at end of capture.
    fn shutdown(&mut self, sink: &mut dyn Sink) -> Result<()>;
}

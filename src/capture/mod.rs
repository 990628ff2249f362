//! Capture reading and event dispatch.
//!
//! [`Pipeline`] wires the decode layer to the trackers: frames come in,
//! decoded events are routed to trackers subscribed by event name, and
//! clock ticks are synthesized from the capture timestamps so TTL state
//! decays at capture speed rather than wall-clock speed.

mod source;

pub use source::{PcapSource, RawFrame};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{info, warn};

use crate::config::{DnsConfig, FlowConfig};
use crate::decode::{self, Property};
use crate::error::ConfigError;
use crate::output::Sink;
use crate::track::{DnsTracker, FlowTracker, Tracker};
use crate::Result;

/// Counters accumulated over one capture run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    /// Frames read from the source.
    pub frames: u64,
    /// Frames that decoded into an event.
    pub decoded: u64,
    /// Tracker deliveries.
    pub deliveries: u64,
    /// Tracker or sink failures that were skipped over.
    pub errors: u64,
}

type SharedTracker = Rc<RefCell<dyn Tracker>>;

/// Single-threaded correlation pipeline.
///
/// Packet ordering is the capture's own. Per-event tracker failures are
/// logged and counted but do not stop the run; only source-level errors
/// abort it.
pub struct Pipeline {
    trackers: Vec<SharedTracker>,
    routes: HashMap<&'static str, Vec<SharedTracker>>,
    sink: Box<dyn Sink>,
    clock: Option<i64>,
    stats: RunStats,
}

impl Pipeline {
    /// Build the standard tracker set: DNS plus flows, with the flow
    /// tracker resolving names through the DNS tracker's caches.
    pub fn new(
        dns_cfg: DnsConfig,
        flow_cfg: FlowConfig,
        sink: Box<dyn Sink>,
    ) -> std::result::Result<Self, ConfigError> {
        let dns = Rc::new(RefCell::new(DnsTracker::new(dns_cfg)?));
        let flow = Rc::new(RefCell::new(FlowTracker::new(flow_cfg, Rc::clone(&dns))?));

        let mut pipeline = Self {
            trackers: Vec::new(),
            routes: HashMap::new(),
            sink,
            clock: None,
            stats: RunStats::default(),
        };
        pipeline.register(dns);
        pipeline.register(flow);
        Ok(pipeline)
    }

    fn register(&mut self, tracker: SharedTracker) {
        for event in tracker.borrow().events() {
            self.routes
                .entry(event)
                .or_default()
                .push(Rc::clone(&tracker));
        }
        self.trackers.push(tracker);
    }

    /// Consume a capture source to exhaustion, then flush the trackers.
    pub fn run(&mut self, source: &mut PcapSource) -> Result<RunStats> {
        while let Some(frame) = source.next_frame()? {
            self.stats.frames += 1;
            let Some(prop) =
                decode::decode(frame.ts_sec, frame.ts_usec, frame.orig_len, &frame.data)
            else {
                continue;
            };
            self.process(&prop);
        }
        self.finish()?;
        info!(
            frames = self.stats.frames,
            decoded = self.stats.decoded,
            errors = self.stats.errors,
            "capture complete"
        );
        Ok(self.stats)
    }

    /// Dispatch one decoded event, synthesizing ticks first if its
    /// timestamp moved the capture clock forward.
    pub fn process(&mut self, prop: &Property) {
        self.stats.decoded += 1;
        self.tick_to(prop.tv_sec());
        for event in prop.events() {
            let Some(subscribers) = self.routes.get(event) else {
                continue;
            };
            for tracker in subscribers {
                self.stats.deliveries += 1;
                if let Err(e) = tracker.borrow_mut().on_packet(prop, &mut *self.sink) {
                    warn!(event, error = %e, "tracker failed on packet");
                    self.stats.errors += 1;
                }
            }
        }
    }

    /// Flush every tracker's remaining state. Called automatically by
    /// [`Pipeline::run`]; embedders driving [`Pipeline::process`] directly
    /// call it once at end of input.
    pub fn finish(&mut self) -> Result<()> {
        // A closing tick flushes partially accumulated aggregates.
        if let Some(now) = self.clock {
            self.tick_all(0, now);
        }
        for tracker in &self.trackers {
            tracker.borrow_mut().shutdown(&mut *self.sink)?;
        }
        Ok(())
    }

    /// Stats so far.
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    fn tick_to(&mut self, sec: i64) {
        let Some(prev) = self.clock else {
            self.clock = Some(sec);
            return;
        };
        if sec <= prev {
            return;
        }
        self.clock = Some(sec);
        self.tick_all((sec - prev) as u64, sec);
    }

    fn tick_all(&mut self, elapsed: u64, now: i64) {
        for tracker in &self.trackers {
            if let Err(e) = tracker.borrow_mut().on_tick(elapsed, now, &mut *self.sink) {
                warn!(error = %e, "tracker failed on tick");
                self.stats.errors += 1;
            }
        }
    }
}

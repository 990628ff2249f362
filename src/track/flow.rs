//! Bidirectional flow tracking.
//!
//! Groups packets by canonical session label, counts packets and bytes per
//! direction, and reports each flow three times: once when first seen
//! (`flow.new`, with endpoint names resolved through the DNS tracker's
//! caches), once per tick as part of an aggregate byte-delta record
//! (`flow.update`), and once as a summary when it idles out or the capture
//! ends (`flow.log`).
//!
//! The flow wheel is driven by packet timestamps, not by pipeline ticks: a
//! flow expires `timeout` seconds of capture time after its last renewal.
//! Expiry is lazy. A popped flow that saw traffic since its last renewal is
//! re-inserted for another timeout period instead of being summarized.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::cache::{Keyed, TimeWheel};
use crate::config::FlowConfig;
use crate::decode::{FlowDir, Property};
use crate::error::ConfigError;
use crate::output::{Doc, Sink};
use crate::track::{DnsTracker, Tracker};
use crate::Result;

/// Per-direction traffic counters.
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    pkt: i64,
    size: i64,
}

/// One tracked bidirectional flow.
struct Flow {
    label: Vec<u8>,
    hash: u64,
    id: String,
    proto: &'static str,
    created_at: i64,
    updated_at: i64,
    refreshed_at: i64,
    init: FlowDir,
    l_addr: String,
    r_addr: String,
    l_port: Option<u16>,
    r_port: Option<u16>,
    l_name: Option<String>,
    r_name: Option<String>,
    left: Counters,
    right: Counters,
}

impl Keyed for Flow {
    fn hash(&self) -> u64 {
        self.hash
    }

    fn matches(&self, key: &[u8]) -> bool {
        self.label == key
    }
}

impl Flow {
    fn new(prop: &Property, src_name: Option<String>, dst_name: Option<String>) -> Self {
        let hash = prop.hash_value();
        // Orient endpoint attributes to match the canonical label. For an
        // untagged packet the source is treated as the left endpoint.
        let (l_addr, r_addr, l_port, r_port, l_name, r_name) = match prop.dir() {
            FlowDir::RightToLeft => (
                prop.dst_addr(),
                prop.src_addr(),
                prop.dst_port(),
                prop.src_port(),
                dst_name,
                src_name,
            ),
            FlowDir::LeftToRight | FlowDir::Untagged => (
                prop.src_addr(),
                prop.dst_addr(),
                prop.src_port(),
                prop.dst_port(),
                src_name,
                dst_name,
            ),
        };

        Self {
            label: prop.ssn_label().to_vec(),
            hash,
            id: format!("{hash:016x}"),
            proto: prop.proto(),
            created_at: prop.tv_sec(),
            updated_at: prop.tv_sec(),
            refreshed_at: prop.tv_sec(),
            init: prop.dir(),
            l_addr,
            r_addr,
            l_port,
            r_port,
            l_name,
            r_name,
            left: Counters::default(),
            right: Counters::default(),
        }
    }

    fn update(&mut self, prop: &Property) {
        self.updated_at = prop.tv_sec();
        let counters = match prop.dir() {
            FlowDir::LeftToRight => &mut self.left,
            FlowDir::RightToLeft => &mut self.right,
            FlowDir::Untagged => return,
        };
        counters.pkt += 1;
        counters.size += prop.len() as i64;
    }

    /// Seconds of activity observed since the last expiry renewal. Zero
    /// means the flow has been idle for a full timeout period.
    fn remain(&self) -> i64 {
        (self.updated_at - self.refreshed_at).max(0)
    }

    fn endpoints(&self, doc: &mut Doc) {
        doc.set("l_addr", self.l_addr.as_str());
        doc.set("r_addr", self.r_addr.as_str());
        if let Some(p) = self.l_port {
            doc.set("l_port", p as i64);
        }
        if let Some(p) = self.r_port {
            doc.set("r_port", p as i64);
        }
        if let Some(n) = &self.l_name {
            doc.set("l_name", n.as_str());
        }
        if let Some(n) = &self.r_name {
            doc.set("r_name", n.as_str());
        }
        doc.set("proto", self.proto);
    }

    fn summary(&self) -> Doc {
        let mut doc = Doc::new();
        doc.set("id", self.id.as_str());
        self.endpoints(&mut doc);
        match self.init {
            FlowDir::LeftToRight => doc.set("init", "l"),
            FlowDir::RightToLeft => doc.set("init", "r"),
            FlowDir::Untagged => {}
        }
        doc.set("l_pkt", self.left.pkt);
        doc.set("r_pkt", self.right.pkt);
        doc.set("l_size", self.left.size);
        doc.set("r_size", self.right.size);
        doc.set("init_ts", self.created_at);
        doc.set("last_ts", self.updated_at);
        doc
    }
}

/// Tracker for bidirectional flows.
///
/// Shares the [`DnsTracker`] to annotate new flows with the names their
/// endpoint addresses were resolved from.
pub struct FlowTracker {
    cfg: FlowConfig,
    flows: TimeWheel<Flow>,
    dns: Rc<RefCell<DnsTracker>>,
    // None until the first packet anchors the capture clock.
    last_sec: Option<i64>,
    deltas: HashMap<String, i64>,
}

impl FlowTracker {
    pub fn new(
        cfg: FlowConfig,
        dns: Rc<RefCell<DnsTracker>>,
    ) -> std::result::Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            flows: TimeWheel::new(cfg.wheel),
            cfg,
            dns,
            last_sec: None,
            deltas: HashMap::new(),
        })
    }

    /// Move the flow clock to `sec` and settle everything that expired on
    /// the way. Renewed flows go back on the wheel; idle ones are reported.
    fn advance_to(&mut self, sec: i64, sink: &mut dyn Sink) -> Result<()> {
        let Some(prev) = self.last_sec else {
            self.last_sec = Some(sec);
            return Ok(());
        };
        if sec <= prev {
            return Ok(());
        }
        let delta = (sec - prev) as u64;
        self.last_sec = Some(sec);
        self.flows.advance(delta);

        while let Some(mut flow) = self.flows.pop_expired() {
            if flow.remain() > 0 {
                flow.refreshed_at = sec;
                self.flows.insert(self.cfg.timeout, flow);
            } else {
                debug!(id = %flow.id, "flow idle timeout");
                self.deltas.remove(&flow.id);
                let ts = flow.created_at;
                sink.emit("flow.log", ts, flow.summary())?;
            }
        }
        Ok(())
    }
}

impl Tracker for FlowTracker {
    fn events(&self) -> &'static [&'static str] {
        &["ipv4.packet", "ipv6.packet"]
    }

    fn on_packet(&mut self, prop: &Property, sink: &mut dyn Sink) -> Result<()> {
        self.advance_to(prop.tv_sec(), sink)?;

        let hash = prop.hash_value();
        if self.flows.lookup(hash, prop.ssn_label()).is_none() {
            let (src_name, dst_name) = {
                let dns = self.dns.borrow();
                (
                    dns.resolve_address(&prop.src_addr_raw()).map(String::from),
                    dns.resolve_address(&prop.dst_addr_raw()).map(String::from),
                )
            };
            let flow = Flow::new(prop, src_name, dst_name);

            let mut doc = Doc::new();
            doc.set("id", flow.id.as_str());
            flow.endpoints(&mut doc);
            sink.emit("flow.new", prop.tv_sec(), doc)?;

            self.flows.insert(self.cfg.timeout, flow);
        }

        // The entry is resident: either it survived the advance above or it
        // was just inserted.
        if let Some(flow) = self.flows.lookup_mut(hash, prop.ssn_label()) {
            flow.update(prop);
            *self.deltas.entry(flow.id.clone()).or_insert(0) += prop.len() as i64;
        }
        Ok(())
    }

    fn on_tick(&mut self, _elapsed: u64, now: i64, sink: &mut dyn Sink) -> Result<()> {
        if self.deltas.is_empty() {
            return Ok(());
        }
        let mut doc = Doc::new();
        for (id, bytes) in std::mem::take(&mut self.deltas) {
            doc.set(&id, bytes);
        }
        sink.emit("flow.update", now, doc)?;
        Ok(())
    }

    fn shutdown(&mut self, sink: &mut dyn Sink) -> Result<()> {
        self.flows.purge();
        while let Some(flow) = self.flows.pop_expired() {
            let ts = flow.created_at;
            sink.emit("flow.log", ts, flow.summary())?;
        }
        self.deltas.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsConfig;
    use crate::output::{MemorySink, Value};
    use std::net::{IpAddr, Ipv4Addr};

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn tracker() -> FlowTracker {
        let dns = Rc::new(RefCell::new(DnsTracker::new(DnsConfig::default()).unwrap()));
        FlowTracker::new(FlowConfig::default(), dns).unwrap()
    }

    fn packet(ts: i64, src: IpAddr, dst: IpAddr, sport: u16, dport: u16, len: u32) -> Property {
        Property::builder("ipv4.packet")
            .endpoints(src, dst)
            .ports(sport, dport)
            .proto("tcp")
            .timestamp(ts, 0)
            .wire_len(len)
            .build()
    }

    #[test]
    fn test_first_packet_creates_flow() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&packet(1000, A, B, 1234, 80, 100), &mut sink).unwrap();
        t.on_packet(&packet(1000, B, A, 80, 1234, 200), &mut sink).unwrap();

        let news: Vec<_> = sink.with_tag("flow.new").collect();
        assert_eq!(news.len(), 1);
        assert_eq!(news[0].ts, 1000);
        assert_eq!(news[0].doc.get("proto").and_then(Value::as_str), Some("tcp"));
        // Both endpoints are present, oriented to the canonical label.
        let l = news[0].doc.get("l_addr").and_then(Value::as_str).unwrap();
        let r = news[0].doc.get("r_addr").and_then(Value::as_str).unwrap();
        assert!(l < r);
    }

    #[test]
    fn test_counters_split_by_direction() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&packet(1000, A, B, 1234, 80, 100), &mut sink).unwrap();
        t.on_packet(&packet(1000, B, A, 80, 1234, 200), &mut sink).unwrap();
        t.on_packet(&packet(1001, A, B, 1234, 80, 50), &mut sink).unwrap();
        t.shutdown(&mut sink).unwrap();

        let logs: Vec<_> = sink.with_tag("flow.log").collect();
        assert_eq!(logs.len(), 1);
        let doc = &logs[0].doc;
        // A sorts before B, so A is the left endpoint.
        assert_eq!(doc.get("l_addr").and_then(Value::as_str), Some("10.0.0.1"));
        assert_eq!(doc.get("l_pkt").and_then(Value::as_i64), Some(2));
        assert_eq!(doc.get("l_size").and_then(Value::as_i64), Some(150));
        assert_eq!(doc.get("r_pkt").and_then(Value::as_i64), Some(1));
        assert_eq!(doc.get("r_size").and_then(Value::as_i64), Some(200));
        assert_eq!(doc.get("init").and_then(Value::as_str), Some("l"));
        assert_eq!(doc.get("init_ts").and_then(Value::as_i64), Some(1000));
        assert_eq!(doc.get("last_ts").and_then(Value::as_i64), Some(1001));
    }

    #[test]
    fn test_idle_flow_is_summarized() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&packet(1000, A, B, 1234, 80, 100), &mut sink).unwrap();
        // A packet on an unrelated flow drives the clock past the timeout.
        t.on_packet(&packet(1601, A, B, 9999, 443, 60), &mut sink).unwrap();

        let logs: Vec<_> = sink.with_tag("flow.log").collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].ts, 1000);

        // The expired flow is gone: a new packet on it starts a new flow.
        t.on_packet(&packet(1602, A, B, 1234, 80, 10), &mut sink).unwrap();
        assert_eq!(sink.with_tag("flow.new").count(), 3);
    }

    #[test]
    fn test_active_flow_is_renewed() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        let mut ts = 1000;
        // Traffic every 100 seconds for well over the 600 second timeout.
        for _ in 0..20 {
            t.on_packet(&packet(ts, A, B, 1234, 80, 100), &mut sink).unwrap();
            ts += 100;
        }
        assert_eq!(sink.with_tag("flow.log").count(), 0);
        assert_eq!(sink.with_tag("flow.new").count(), 1);
    }

    #[test]
    fn test_flow_update_deltas() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&packet(1000, A, B, 1234, 80, 100), &mut sink).unwrap();
        t.on_packet(&packet(1000, B, A, 80, 1234, 200), &mut sink).unwrap();
        t.on_tick(1, 1001, &mut sink).unwrap();

        let updates: Vec<_> = sink.with_tag("flow.update").collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].doc.len(), 1);
        let (_, bytes) = updates[0].doc.iter().next().unwrap();
        assert_eq!(bytes.as_i64(), Some(300));

        // Nothing since the last tick: no record at all.
        t.on_tick(1, 1002, &mut sink).unwrap();
        assert_eq!(sink.with_tag("flow.update").count(), 1);
    }

    #[test]
    fn test_shutdown_summarizes_remaining() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&packet(1000, A, B, 1234, 80, 100), &mut sink).unwrap();
        t.on_packet(&packet(1010, A, B, 5555, 22, 40), &mut sink).unwrap();
        t.shutdown(&mut sink).unwrap();

        assert_eq!(sink.with_tag("flow.log").count(), 2);
    }

    #[test]
    fn test_configured_timeout_is_honored() {
        let dns = Rc::new(RefCell::new(DnsTracker::new(DnsConfig::default()).unwrap()));
        let cfg = FlowConfig {
            wheel: 10,
            timeout: 5,
        };
        let mut t = FlowTracker::new(cfg, dns).unwrap();
        let mut sink = MemorySink::new();

        t.on_packet(&packet(1000, A, B, 1234, 80, 100), &mut sink).unwrap();
        // Six idle seconds exceed the five second timeout.
        t.on_packet(&packet(1006, A, B, 9999, 443, 60), &mut sink).unwrap();

        let logs: Vec<_> = sink.with_tag("flow.log").collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].ts, 1000);
    }

    #[test]
    fn test_new_flow_carries_resolved_names() {
        let dns = Rc::new(RefCell::new(DnsTracker::new(DnsConfig::default()).unwrap()));
        dns.borrow_mut()
            .cache_addr(vec![10, 0, 0, 2], "b.test".to_string(), 0.0);
        let mut t = FlowTracker::new(FlowConfig::default(), dns).unwrap();
        let mut sink = MemorySink::new();

        t.on_packet(&packet(1000, A, B, 1234, 80, 100), &mut sink).unwrap();

        let news: Vec<_> = sink.with_tag("flow.new").collect();
        assert_eq!(news[0].doc.get("r_name").and_then(Value::as_str), Some("b.test"));
        assert!(news[0].doc.get("l_name").is_none());
    }
}

//! DNS transaction and name-resolution tracking.
//!
//! Pairs queries with responses by (flow hash, transaction id), reports the
//! outcome of every transaction (success with latency, miss, or timeout),
//! and maintains two short-lived caches built from observed answers: one
//! mapping raw addresses to the name they were returned for, and one
//! mapping alias targets back to the name the client originally asked for.
//! [`DnsTracker::resolve_address`] walks both to answer "what name did this
//! address resolve from?" for other trackers.

use std::hash::Hasher;

use rustc_hash::FxHasher;
use tracing::debug;

use crate::cache::{Keyed, TimeWheel};
use crate::config::DnsConfig;
use crate::decode::Property;
use crate::error::ConfigError;
use crate::output::{Doc, Sink};
use crate::track::Tracker;
use crate::Result;

/// An outstanding query awaiting its response.
struct Query {
    key: [u8; 12],
    hash: u64,
    first_ts: f64,
    last_ts: f64,
    client: String,
    server: String,
    questions: Vec<(String, String)>,
    replied: bool,
}

impl Keyed for Query {
    fn hash(&self) -> u64 {
        self.hash
    }

    fn matches(&self, key: &[u8]) -> bool {
        self.key == key
    }
}

/// Address cache entry: one raw address and the name it answered for.
struct AddrRecord {
    addr: Vec<u8>,
    hash: u64,
    name: String,
    last_ts: f64,
}

impl Keyed for AddrRecord {
    fn hash(&self) -> u64 {
        self.hash
    }

    fn matches(&self, key: &[u8]) -> bool {
        self.addr == key
    }
}

/// Alias cache entry, keyed by the alias target so resolution can walk
/// from a canonical name back to the name that was queried.
struct AliasRecord {
    target: Vec<u8>,
    hash: u64,
    qname: String,
    last_ts: f64,
}

impl Keyed for AliasRecord {
    fn hash(&self) -> u64 {
        self.hash
    }

    fn matches(&self, key: &[u8]) -> bool {
        self.target == key
    }
}

/// Combined lookup key for a transaction: flow hash plus transaction id.
fn query_key(hv: u64, tx_id: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&hv.to_be_bytes());
    key[8..].copy_from_slice(&tx_id.to_be_bytes());
    key
}

/// Hash of a raw resolved address. Defined for IPv4 (4 bytes, the address
/// value itself) and IPv6 (16 bytes, XOR of the two halves).
fn addr_hash(addr: &[u8]) -> Option<u64> {
    match addr.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(addr);
            Some(u32::from_be_bytes(b) as u64)
        }
        16 => {
            let mut hi = [0u8; 8];
            let mut lo = [0u8; 8];
            hi.copy_from_slice(&addr[..8]);
            lo.copy_from_slice(&addr[8..]);
            Some(u64::from_be_bytes(hi) ^ u64::from_be_bytes(lo))
        }
        _ => None,
    }
}

fn name_hash(name: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(name);
    hasher.finish()
}

/// Tracker for DNS transactions and the resolution caches they feed.
pub struct DnsTracker {
    cfg: DnsConfig,
    queries: TimeWheel<Query>,
    addrs: TimeWheel<AddrRecord>,
    aliases: TimeWheel<AliasRecord>,
}

impl DnsTracker {
    pub fn new(cfg: DnsConfig) -> std::result::Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            queries: TimeWheel::new(cfg.query_wheel),
            addrs: TimeWheel::new(cfg.cache_wheel),
            aliases: TimeWheel::new(cfg.cache_wheel),
            cfg,
        })
    }

    /// Reverse-resolve a raw address (4 or 16 bytes) against the caches.
    ///
    /// Returns the name the client originally asked for: the address cache
    /// gives the name the answer carried, and the alias cache is walked
    /// backwards (bounded by `max_alias_hops`) to undo CNAME indirection.
    pub fn resolve_address(&self, addr: &[u8]) -> Option<&str> {
        let hv = addr_hash(addr)?;
        let rec = self.addrs.lookup(hv, addr)?;
        let mut name: &str = &rec.name;
        for _ in 0..self.cfg.max_alias_hops {
            match self.aliases.lookup(name_hash(name.as_bytes()), name.as_bytes()) {
                Some(alias) => name = &alias.qname,
                None => break,
            }
        }
        Some(name)
    }

    fn on_query(&mut self, prop: &Property, hash: u64, key: [u8; 12]) {
        if let Some(q) = self.queries.lookup_mut(hash, &key) {
            // Retransmission: keep the original first-seen time.
            q.last_ts = prop.ts();
            return;
        }

        let mut questions = Vec::new();
        for i in 0..prop.value_count("dns.qd_name") {
            let name = match prop.value_at("dns.qd_name", i) {
                Some(v) => v.repr(),
                None => continue,
            };
            let qtype = prop
                .value_at("dns.qd_type", i)
                .map(|v| v.repr())
                .unwrap_or_default();
            questions.push((name, qtype));
        }

        self.queries.insert(
            self.cfg.query_ttl,
            Query {
                key,
                hash,
                first_ts: prop.ts(),
                last_ts: prop.ts(),
                client: prop.src_addr(),
                server: prop.dst_addr(),
                questions,
                replied: false,
            },
        );
    }

    fn on_response(&mut self, prop: &Property, hash: u64, key: [u8; 12], sink: &mut dyn Sink) -> Result<()> {
        let matched = match self.queries.lookup_mut(hash, &key) {
            Some(q) => {
                q.replied = true;
                Some((q.first_ts, q.client.clone(), q.server.clone(), q.questions.first().cloned()))
            }
            None => None,
        };

        let Some((first_ts, client, server, question)) = matched else {
            // Response with no outstanding query: either the query predates
            // the capture or it already timed out of the table.
            let mut doc = Doc::new();
            doc.set("client", prop.dst_addr());
            doc.set("server", prop.src_addr());
            if let Some(name) = prop.value("dns.qd_name") {
                doc.set("q_name", name.repr());
            }
            doc.set("status", "miss");
            sink.emit("dns.tx", prop.tv_sec(), doc)?;
            return Ok(());
        };

        let mut doc = Doc::new();
        doc.set("client", client.as_str());
        doc.set("server", server.as_str());
        if let Some((name, _)) = &question {
            doc.set("q_name", name.as_str());
        }
        doc.set("status", "success");
        doc.set("latency", prop.ts() - first_ts);
        sink.emit("dns.tx", first_ts as i64, doc)?;

        // Log every answer and fold it into the resolution caches.
        for i in 0..prop.value_count("dns.an_name") {
            let (name, data) = match (
                prop.value_at("dns.an_name", i),
                prop.value_at("dns.an_data", i),
            ) {
                (Some(n), Some(d)) => (n.repr(), d),
                _ => continue,
            };
            let rtype = prop
                .value_at("dns.an_rtype", i)
                .and_then(|v| v.as_u64())
                .unwrap_or(0);

            let mut log = Doc::new();
            log.set("client", prop.dst_addr());
            log.set("server", prop.src_addr());
            log.set("name", name.as_str());
            if let Some(t) = prop.value_at("dns.an_type", i) {
                log.set("type", t.repr());
            }
            log.set("data", data.repr());
            sink.emit("dns.log", first_ts as i64, log)?;

            match rtype {
                // A / AAAA: remember which name this address answered for.
                1 | 28 => {
                    if let Some(addr) = data.as_bytes() {
                        self.cache_addr(addr, name, prop.ts());
                    }
                }
                // CNAME: remember the queried name under the alias target.
                5 => self.cache_alias(data.repr(), name, prop.ts()),
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn cache_addr(&mut self, addr: Vec<u8>, name: String, ts: f64) {
        let Some(hv) = addr_hash(&addr) else { return };
        match self.addrs.lookup_mut(hv, &addr) {
            // First writer wins: the name stays, only the freshness moves.
            Some(rec) => rec.last_ts = ts,
            None => self.addrs.insert(
                self.cfg.cache_ttl,
                AddrRecord {
                    addr,
                    hash: hv,
                    name,
                    last_ts: ts,
                },
            ),
        }
    }

    fn cache_alias(&mut self, target: String, qname: String, ts: f64) {
        let target = target.into_bytes();
        let hv = name_hash(&target);
        match self.aliases.lookup_mut(hv, &target) {
            Some(rec) => rec.last_ts = ts,
            None => self.aliases.insert(
                self.cfg.cache_ttl,
                AliasRecord {
                    target,
                    hash: hv,
                    qname,
                    last_ts: ts,
                },
            ),
        }
    }

    fn flush_timeouts(&mut self, sink: &mut dyn Sink) -> Result<()> {
        while let Some(q) = self.queries.pop_expired() {
            if q.replied {
                continue;
            }
            debug!(client = %q.client, server = %q.server, last_seen = q.last_ts, "query timed out");
            let mut doc = Doc::new();
            doc.set("client", q.client);
            doc.set("server", q.server);
            if let Some((name, _)) = q.questions.into_iter().next() {
                doc.set("q_name", name);
            }
            doc.set("status", "timeout");
            sink.emit("dns.tx", q.first_ts as i64, doc)?;
        }
        Ok(())
    }

    fn drain_caches(&mut self) {
        while let Some(rec) = self.addrs.pop_expired() {
            debug!(name = %rec.name, last_seen = rec.last_ts, "address cache entry expired");
        }
        while let Some(rec) = self.aliases.pop_expired() {
            debug!(qname = %rec.qname, last_seen = rec.last_ts, "alias cache entry expired");
        }
    }
}

impl Tracker for DnsTracker {
    fn events(&self) -> &'static [&'static str] {
        &["dns.packet"]
    }

    fn on_packet(&mut self, prop: &Property, sink: &mut dyn Sink) -> Result<()> {
        let Some(tx_id) = prop.value("dns.tx_id").and_then(|v| v.as_u64()) else {
            return Ok(());
        };
        let tx_id = tx_id as u32;
        let hash = prop.hash_value() ^ tx_id as u64;
        let key = query_key(prop.hash_value(), tx_id);

        let is_response = prop
            .value("dns.query")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            == 1;

        if is_response {
            self.on_response(prop, hash, key, sink)?;
        } else {
            self.on_query(prop, hash, key);
        }
        Ok(())
    }

    fn on_tick(&mut self, elapsed: u64, _now: i64, sink: &mut dyn Sink) -> Result<()> {
        self.queries.advance(elapsed);
        self.addrs.advance(elapsed);
        self.aliases.advance(elapsed);
        self.flush_timeouts(sink)?;
        self.drain_caches();
        Ok(())
    }

    fn shutdown(&mut self, sink: &mut dyn Sink) -> Result<()> {
        self.queries.purge();
        self.flush_timeouts(sink)?;
        self.addrs.purge();
        self.aliases.purge();
        self.drain_caches();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::FieldValue;
    use crate::output::{MemorySink, Value};
    use std::net::{IpAddr, Ipv4Addr};

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 53));

    fn tracker() -> DnsTracker {
        DnsTracker::new(DnsConfig::default()).unwrap()
    }

    fn query(ts: i64, tx_id: u32, name: &str) -> Property {
        Property::builder("udp")
            .event("dns.packet")
            .endpoints(CLIENT, SERVER)
            .ports(40000, 53)
            .proto("udp")
            .timestamp(ts, 0)
            .wire_len(64)
            .field("dns.query", FieldValue::UInt32(0))
            .field("dns.tx_id", FieldValue::UInt32(tx_id))
            .field("dns.qd_name", FieldValue::Str(name.to_string()))
            .field("dns.qd_type", FieldValue::Str("A".to_string()))
            .build()
    }

    fn response_base(ts: i64, tx_id: u32) -> crate::decode::PropertyBuilder {
        Property::builder("udp")
            .event("dns.packet")
            .endpoints(SERVER, CLIENT)
            .ports(53, 40000)
            .proto("udp")
            .timestamp(ts, 0)
            .wire_len(96)
            .field("dns.query", FieldValue::UInt32(1))
            .field("dns.tx_id", FieldValue::UInt32(tx_id))
    }

    fn a_answer(
        builder: crate::decode::PropertyBuilder,
        name: &str,
        addr: [u8; 4],
    ) -> crate::decode::PropertyBuilder {
        builder
            .field("dns.an_name", FieldValue::Str(name.to_string()))
            .field("dns.an_type", FieldValue::Str("A".to_string()))
            .field("dns.an_rtype", FieldValue::UInt16(1))
            .field(
                "dns.an_data",
                FieldValue::IpAddr(IpAddr::V4(Ipv4Addr::from(addr))),
            )
    }

    fn cname_answer(
        builder: crate::decode::PropertyBuilder,
        name: &str,
        target: &str,
    ) -> crate::decode::PropertyBuilder {
        builder
            .field("dns.an_name", FieldValue::Str(name.to_string()))
            .field("dns.an_type", FieldValue::Str("CNAME".to_string()))
            .field("dns.an_rtype", FieldValue::UInt16(5))
            .field("dns.an_data", FieldValue::Str(target.to_string()))
    }

    #[test]
    fn test_query_response_success() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&query(100, 7, "x.test"), &mut sink).unwrap();
        let resp = a_answer(response_base(101, 7), "x.test", [1, 2, 3, 4]).build();
        t.on_packet(&resp, &mut sink).unwrap();

        let tx: Vec<_> = sink.with_tag("dns.tx").collect();
        assert_eq!(tx.len(), 1);
        assert_eq!(tx[0].ts, 100);
        assert_eq!(tx[0].doc.get("status").and_then(Value::as_str), Some("success"));
        assert_eq!(tx[0].doc.get("q_name").and_then(Value::as_str), Some("x.test"));
        assert_eq!(tx[0].doc.get("client").and_then(Value::as_str), Some("10.0.0.1"));
        assert_eq!(tx[0].doc.get("server").and_then(Value::as_str), Some("10.0.0.53"));
        let latency = tx[0].doc.get("latency").and_then(Value::as_f64).unwrap();
        assert!((latency - 1.0).abs() < 1e-9);

        let logs: Vec<_> = sink.with_tag("dns.log").collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].doc.get("name").and_then(Value::as_str), Some("x.test"));
        assert_eq!(logs[0].doc.get("data").and_then(Value::as_str), Some("1.2.3.4"));
    }

    #[test]
    fn test_response_without_query_is_miss() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        let resp = a_answer(response_base(50, 9), "y.test", [5, 6, 7, 8]).build();
        t.on_packet(&resp, &mut sink).unwrap();

        let tx: Vec<_> = sink.with_tag("dns.tx").collect();
        assert_eq!(tx.len(), 1);
        assert_eq!(tx[0].doc.get("status").and_then(Value::as_str), Some("miss"));
        // Answers of an unmatched response are not logged or cached.
        assert_eq!(sink.with_tag("dns.log").count(), 0);
        assert!(t.resolve_address(&[5, 6, 7, 8]).is_none());
    }

    #[test]
    fn test_unanswered_query_times_out() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&query(0, 3, "slow.test"), &mut sink).unwrap();
        t.on_tick(119, 119, &mut sink).unwrap();
        assert_eq!(sink.with_tag("dns.tx").count(), 0);

        t.on_tick(1, 120, &mut sink).unwrap();
        let tx: Vec<_> = sink.with_tag("dns.tx").collect();
        assert_eq!(tx.len(), 1);
        assert_eq!(tx[0].doc.get("status").and_then(Value::as_str), Some("timeout"));
        assert_eq!(tx[0].doc.get("q_name").and_then(Value::as_str), Some("slow.test"));
        assert_eq!(tx[0].ts, 0);
    }

    #[test]
    fn test_retransmission_keeps_first_seen_time() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&query(10, 4, "again.test"), &mut sink).unwrap();
        t.on_packet(&query(12, 4, "again.test"), &mut sink).unwrap();
        let resp = a_answer(response_base(14, 4), "again.test", [9, 9, 9, 9]).build();
        t.on_packet(&resp, &mut sink).unwrap();

        let tx: Vec<_> = sink.with_tag("dns.tx").collect();
        assert_eq!(tx.len(), 1);
        assert_eq!(tx[0].ts, 10);
        let latency = tx[0].doc.get("latency").and_then(Value::as_f64).unwrap();
        assert!((latency - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_answered_query_does_not_time_out() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&query(0, 5, "ok.test"), &mut sink).unwrap();
        let resp = a_answer(response_base(1, 5), "ok.test", [1, 1, 1, 1]).build();
        t.on_packet(&resp, &mut sink).unwrap();
        sink.clear();

        t.on_tick(200, 200, &mut sink).unwrap();
        assert_eq!(sink.with_tag("dns.tx").count(), 0);
    }

    #[test]
    fn test_resolve_walks_alias_chain() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        // Client asked for b.example; the answer aliases it to a.example
        // which resolves to 1.2.3.4.
        t.on_packet(&query(0, 1, "b.example"), &mut sink).unwrap();
        let resp = a_answer(
            cname_answer(response_base(1, 1), "b.example", "a.example"),
            "a.example",
            [1, 2, 3, 4],
        )
        .build();
        t.on_packet(&resp, &mut sink).unwrap();

        assert_eq!(t.resolve_address(&[1, 2, 3, 4]), Some("b.example"));
        assert_eq!(sink.with_tag("dns.log").count(), 2);
    }

    #[test]
    fn test_alias_cycle_is_bounded() {
        let mut t = tracker();
        t.cache_alias("a.test".to_string(), "b.test".to_string(), 0.0);
        t.cache_alias("b.test".to_string(), "a.test".to_string(), 0.0);
        t.cache_addr(vec![2, 2, 2, 2], "a.test".to_string(), 0.0);

        // The walk terminates at the hop bound instead of spinning.
        let name = t.resolve_address(&[2, 2, 2, 2]);
        assert!(matches!(name, Some("a.test") | Some("b.test")));
    }

    #[test]
    fn test_addr_cache_first_writer_wins() {
        let mut t = tracker();
        t.cache_addr(vec![3, 3, 3, 3], "first.test".to_string(), 0.0);
        t.cache_addr(vec![3, 3, 3, 3], "second.test".to_string(), 1.0);
        assert_eq!(t.resolve_address(&[3, 3, 3, 3]), Some("first.test"));
    }

    #[test]
    fn test_addr_cache_expires() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&query(0, 2, "x.test"), &mut sink).unwrap();
        let resp = a_answer(response_base(1, 2), "x.test", [1, 2, 3, 4]).build();
        t.on_packet(&resp, &mut sink).unwrap();

        t.on_tick(599, 599, &mut sink).unwrap();
        assert_eq!(t.resolve_address(&[1, 2, 3, 4]), Some("x.test"));

        t.on_tick(2, 601, &mut sink).unwrap();
        assert!(t.resolve_address(&[1, 2, 3, 4]).is_none());
    }

    #[test]
    fn test_shutdown_flushes_pending_as_timeouts() {
        let mut t = tracker();
        let mut sink = MemorySink::new();

        t.on_packet(&query(7, 11, "late.test"), &mut sink).unwrap();
        t.shutdown(&mut sink).unwrap();

        let tx: Vec<_> = sink.with_tag("dns.tx").collect();
        assert_eq!(tx.len(), 1);
        assert_eq!(tx[0].doc.get("status").and_then(Value::as_str), Some("timeout"));
        assert_eq!(tx[0].ts, 7);
    }

    #[test]
    fn test_addr_hash_shapes() {
        assert_eq!(addr_hash(&[1, 2, 3, 4]), Some(0x01020304));
        let v6 = [
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, //
            0, 0, 0, 0, 0, 0, 0, 0x01,
        ];
        assert_eq!(
            addr_hash(&v6),
            Some(0x2001_0db8_0000_0000u64 ^ 0x0000_0000_0000_0001u64)
        );
        assert_eq!(addr_hash(&[1, 2, 3]), None);
    }
}

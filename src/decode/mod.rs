//! Packet decoding layer.
//!
//! Turns raw link-layer frames into [`Property`] events: named, typed field
//! lookups plus the flow-level attributes (stable flow hash, canonical
//! session label, direction tag, endpoints) the trackers correlate on.
//! Decode failures yield no event; a malformed packet is skipped, never an
//! error.

pub mod dns;
mod field;
mod packet;

pub use field::FieldValue;
pub use packet::decode;

use std::collections::HashMap;
use std::hash::Hasher;
use std::net::{IpAddr, Ipv4Addr};

use rustc_hash::FxHasher;

/// Direction of one packet relative to its canonical flow orientation.
///
/// "Left" is the endpoint that sorts lower in the canonical session label;
/// both directions of a flow therefore share one label and one hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDir {
    /// Sent by the left endpoint
    LeftToRight,
    /// Sent by the right endpoint
    RightToLeft,
    /// Direction could not be determined
    Untagged,
}

/// One decoded packet event.
///
/// Field lookups are by string key with multiplicity (repeated fields such
/// as multiple DNS answers). Missing fields are represented by `None`, not
/// errors.
#[derive(Debug)]
pub struct Property {
    events: Vec<&'static str>,
    fields: HashMap<&'static str, Vec<FieldValue>>,
    flow_hash: u64,
    ssn_label: Vec<u8>,
    dir: FlowDir,
    src_addr: IpAddr,
    dst_addr: IpAddr,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    proto: &'static str,
    ts_sec: i64,
    ts_usec: u32,
    len: u32,
}

impl Property {
    /// Event identifiers this packet should be dispatched under.
    pub fn events(&self) -> &[&'static str] {
        &self.events
    }

    /// First value of a named field.
    pub fn value(&self, key: &str) -> Option<&FieldValue> {
        self.value_at(key, 0)
    }

    /// The `i`-th value of a repeated field.
    pub fn value_at(&self, key: &str, i: usize) -> Option<&FieldValue> {
        self.fields.get(key).and_then(|vals| vals.get(i))
    }

    /// Number of values present for a field key.
    pub fn value_count(&self, key: &str) -> usize {
        self.fields.get(key).map_or(0, Vec::len)
    }

    /// Stable 64-bit hash of the canonical session label.
    pub fn hash_value(&self) -> u64 {
        self.flow_hash
    }

    /// Opaque, direction-independent session label bytes.
    pub fn ssn_label(&self) -> &[u8] {
        &self.ssn_label
    }

    /// Direction tag for this packet.
    pub fn dir(&self) -> FlowDir {
        self.dir
    }

    /// Raw source address bytes (4 or 16).
    pub fn src_addr_raw(&self) -> Vec<u8> {
        addr_bytes(&self.src_addr)
    }

    /// Raw destination address bytes (4 or 16).
    pub fn dst_addr_raw(&self) -> Vec<u8> {
        addr_bytes(&self.dst_addr)
    }

    /// Source address in string form.
    pub fn src_addr(&self) -> String {
        self.src_addr.to_string()
    }

    /// Destination address in string form.
    pub fn dst_addr(&self) -> String {
        self.dst_addr.to_string()
    }

    /// Source port, when the transport has one.
    pub fn src_port(&self) -> Option<u16> {
        self.src_port
    }

    /// Destination port, when the transport has one.
    pub fn dst_port(&self) -> Option<u16> {
        self.dst_port
    }

    /// Transport protocol tag ("tcp", "udp", ...).
    pub fn proto(&self) -> &'static str {
        self.proto
    }

    /// Capture timestamp, whole seconds.
    pub fn tv_sec(&self) -> i64 {
        self.ts_sec
    }

    /// Capture timestamp as fractional seconds.
    pub fn ts(&self) -> f64 {
        self.ts_sec as f64 + self.ts_usec as f64 / 1_000_000.0
    }

    /// Original (on-the-wire) packet length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// True for zero-length packets (possible with some encapsulations).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start building a `Property` by hand, bypassing the wire decoder.
    ///
    /// Intended for alternative front ends and tests.
    pub fn builder(event: &'static str) -> PropertyBuilder {
        PropertyBuilder::new(event)
    }
}

/// Constructs [`Property`] values directly.
pub struct PropertyBuilder {
    events: Vec<&'static str>,
    fields: HashMap<&'static str, Vec<FieldValue>>,
    src_addr: IpAddr,
    dst_addr: IpAddr,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    proto: &'static str,
    ts_sec: i64,
    ts_usec: u32,
    len: u32,
}

impl PropertyBuilder {
    fn new(event: &'static str) -> Self {
        Self {
            events: vec![event],
            fields: HashMap::new(),
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: None,
            dst_port: None,
            proto: "udp",
            ts_sec: 0,
            ts_usec: 0,
            len: 0,
        }
    }

    /// Register an additional event identifier for dispatch.
    pub fn event(mut self, event: &'static str) -> Self {
        self.events.push(event);
        self
    }

    /// Append a value to a (possibly repeated) field.
    pub fn field(mut self, key: &'static str, value: FieldValue) -> Self {
        self.fields.entry(key).or_default().push(value);
        self
    }

    /// Set both endpoints.
    pub fn endpoints(mut self, src: IpAddr, dst: IpAddr) -> Self {
        self.src_addr = src;
        self.dst_addr = dst;
        self
    }

    /// Set both ports.
    pub fn ports(mut self, src: u16, dst: u16) -> Self {
        self.src_port = Some(src);
        self.dst_port = Some(dst);
        self
    }

    /// Set the transport protocol tag.
    pub fn proto(mut self, proto: &'static str) -> Self {
        self.proto = proto;
        self
    }

    /// Set the capture timestamp.
    pub fn timestamp(mut self, sec: i64, usec: u32) -> Self {
        self.ts_sec = sec;
        self.ts_usec = usec;
        self
    }

    /// Set the on-the-wire packet length.
    pub fn wire_len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    /// Finish: derives the canonical session label, flow hash, and
    /// direction tag from the endpoints.
    pub fn build(self) -> Property {
        let (label, dir) = canonical_label(
            &self.src_addr,
            self.src_port.unwrap_or(0),
            &self.dst_addr,
            self.dst_port.unwrap_or(0),
            self.proto,
        );
        let flow_hash = label_hash(&label);
        Property {
            events: self.events,
            fields: self.fields,
            flow_hash,
            ssn_label: label,
            dir,
            src_addr: self.src_addr,
            dst_addr: self.dst_addr,
            src_port: self.src_port,
            dst_port: self.dst_port,
            proto: self.proto,
            ts_sec: self.ts_sec,
            ts_usec: self.ts_usec,
            len: self.len,
        }
    }
}

fn addr_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

/// Build the canonical session label for a 5-tuple.
///
/// The endpoint that sorts lower as an (address, port) pair becomes "left";
/// both packet directions of one session therefore produce identical label
/// bytes. Returns the label and this packet's direction relative to it.
pub(crate) fn canonical_label(
    src: &IpAddr,
    src_port: u16,
    dst: &IpAddr,
    dst_port: u16,
    proto: &str,
) -> (Vec<u8>, FlowDir) {
    let a = (addr_bytes(src), src_port);
    let b = (addr_bytes(dst), dst_port);

    let (left, right, dir) = match a.cmp(&b) {
        std::cmp::Ordering::Less => (a, b, FlowDir::LeftToRight),
        std::cmp::Ordering::Greater => (b, a, FlowDir::RightToLeft),
        std::cmp::Ordering::Equal => (a, b, FlowDir::Untagged),
    };

    let mut label =
        Vec::with_capacity(left.0.len() + right.0.len() + 4 + proto.len());
    label.extend_from_slice(&left.0);
    label.extend_from_slice(&right.0);
    label.extend_from_slice(&left.1.to_be_bytes());
    label.extend_from_slice(&right.1.to_be_bytes());
    label.extend_from_slice(proto.as_bytes());
    (label, dir)
}

/// Stable hash of session-label bytes (stable across runs, unlike the std
/// `HashMap` hasher).
pub(crate) fn label_hash(label: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(label);
    hasher.finish()
}

/// Placeholder IPv6 address helper used by tests.
#[cfg(test)]
pub(crate) fn v6(last: u8) -> IpAddr {
    IpAddr::V6(std::net::Ipv6Addr::new(
        0x2001, 0xdb8, 0, 0, 0, 0, 0, last as u16,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_is_direction_independent() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        let (fwd, fwd_dir) = canonical_label(&a, 1234, &b, 53, "udp");
        let (rev, rev_dir) = canonical_label(&b, 53, &a, 1234, "udp");

        assert_eq!(fwd, rev);
        assert_eq!(fwd_dir, FlowDir::LeftToRight);
        assert_eq!(rev_dir, FlowDir::RightToLeft);
        assert_eq!(label_hash(&fwd), label_hash(&rev));
    }

    #[test]
    fn test_label_distinguishes_ports() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        let (one, _) = canonical_label(&a, 1234, &b, 53, "udp");
        let (two, _) = canonical_label(&a, 1235, &b, 53, "udp");
        assert_ne!(one, two);
    }

    #[test]
    fn test_label_distinguishes_proto() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        let (udp, _) = canonical_label(&a, 53, &b, 53, "udp");
        let (tcp, _) = canonical_label(&a, 53, &b, 53, "tcp");
        assert_ne!(udp, tcp);
    }

    #[test]
    fn test_same_endpoint_is_untagged() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let (_, dir) = canonical_label(&a, 53, &a, 53, "udp");
        assert_eq!(dir, FlowDir::Untagged);
    }

    #[test]
    fn test_builder_fields_and_multiplicity() {
        let prop = Property::builder("dns.packet")
            .field("dns.qd_name", FieldValue::Str("a.test".into()))
            .field("dns.qd_name", FieldValue::Str("b.test".into()))
            .build();

        assert_eq!(prop.value_count("dns.qd_name"), 2);
        assert_eq!(
            prop.value_at("dns.qd_name", 1).map(|v| v.repr()),
            Some("b.test".to_string())
        );
        assert_eq!(prop.value("dns.tx_id"), None);
    }

    #[test]
    fn test_v6_label_uses_sixteen_byte_addrs() {
        let (label, _) = canonical_label(&v6(1), 1, &v6(2), 2, "udp");
        assert!(label.len() > 32);
    }
}

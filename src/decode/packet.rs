//! Wire-format packet decoding into [`Property`] events.

use std::net::IpAddr;

use etherparse::{
    Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice,
    UdpHeaderSlice,
};
use tracing::trace;

use super::dns::{self, RData};
use super::{FieldValue, Property};

/// Well-known EtherTypes.
mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const VLAN: u16 = 0x8100;
    pub const IPV6: u16 = 0x86dd;
}

/// IP protocol numbers.
mod ip_proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMP6: u8 = 58;
}

const DNS_PORT: u16 = 53;

/// Decode one Ethernet frame into a packet event.
///
/// `wire_len` is the original on-the-wire length from the capture header
/// (the frame may be truncated). Returns `None` for frames the trackers do
/// not consume (non-IP, short, or malformed); this is a skip, not an error.
pub fn decode(ts_sec: i64, ts_usec: u32, wire_len: u32, frame: &[u8]) -> Option<Property> {
    let eth = Ethernet2HeaderSlice::from_slice(frame).ok()?;
    let mut ether_type = eth.ether_type().0;
    let mut rest = &frame[eth.slice().len()..];

    // Skip 802.1Q tags (possibly stacked).
    while ether_type == ethertype::VLAN {
        if rest.len() < 4 {
            return None;
        }
        ether_type = u16::from_be_bytes([rest[2], rest[3]]);
        rest = &rest[4..];
    }

    match ether_type {
        ethertype::IPV4 => decode_ipv4(ts_sec, ts_usec, wire_len, rest),
        ethertype::IPV6 => decode_ipv6(ts_sec, ts_usec, wire_len, rest),
        other => {
            trace!(ether_type = other, "skipping non-IP frame");
            None
        }
    }
}

fn decode_ipv4(ts_sec: i64, ts_usec: u32, wire_len: u32, data: &[u8]) -> Option<Property> {
    let ip = Ipv4HeaderSlice::from_slice(data).ok()?;
    let src = IpAddr::V4(ip.source_addr());
    let dst = IpAddr::V4(ip.destination_addr());
    let payload = &data[ip.slice().len()..];

    decode_transport(
        "ipv4.packet",
        ts_sec,
        ts_usec,
        wire_len,
        src,
        dst,
        ip.protocol().0,
        payload,
    )
}

fn decode_ipv6(ts_sec: i64, ts_usec: u32, wire_len: u32, data: &[u8]) -> Option<Property> {
    let ip = Ipv6HeaderSlice::from_slice(data).ok()?;
    let src = IpAddr::V6(ip.source_addr());
    let dst = IpAddr::V6(ip.destination_addr());
    let payload = &data[ip.slice().len()..];

    // Extension headers are rare on monitored traffic; a packet whose next
    // header is not a transport we know still yields a flow event.
    decode_transport(
        "ipv6.packet",
        ts_sec,
        ts_usec,
        wire_len,
        src,
        dst,
        ip.next_header().0,
        payload,
    )
}

#[allow(clippy::too_many_arguments)]
fn decode_transport(
    ip_event: &'static str,
    ts_sec: i64,
    ts_usec: u32,
    wire_len: u32,
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    payload: &[u8],
) -> Option<Property> {
    let mut builder = Property::builder(ip_event)
        .endpoints(src, dst)
        .timestamp(ts_sec, ts_usec)
        .wire_len(wire_len);

    match protocol {
        ip_proto::UDP => {
            let udp = UdpHeaderSlice::from_slice(payload).ok()?;
            let (sport, dport) = (udp.source_port(), udp.destination_port());
            builder = builder.proto("udp").ports(sport, dport);

            if sport == DNS_PORT || dport == DNS_PORT {
                if let Some(msg) = dns::parse(&payload[8..]) {
                    builder = add_dns_fields(builder.event("dns.packet"), msg);
                }
            }
        }
        ip_proto::TCP => {
            let tcp = TcpHeaderSlice::from_slice(payload).ok()?;
            builder = builder
                .proto("tcp")
                .ports(tcp.source_port(), tcp.destination_port());
        }
        ip_proto::ICMP => {
            builder = builder.proto("icmp");
        }
        ip_proto::ICMP6 => {
            builder = builder.proto("icmp6");
        }
        _ => {
            builder = builder.proto("ip");
        }
    }

    Some(builder.build())
}

fn add_dns_fields(
    mut builder: super::PropertyBuilder,
    msg: dns::Message,
) -> super::PropertyBuilder {
    builder = builder
        .field("dns.query", FieldValue::UInt32(msg.is_response as u32))
        .field("dns.tx_id", FieldValue::UInt32(msg.tx_id as u32));

    for q in msg.questions {
        builder = builder
            .field("dns.qd_name", FieldValue::Str(q.name))
            .field("dns.qd_type", FieldValue::Str(dns::type_name(q.qtype)));
    }

    for an in msg.answers {
        let data = match an.data {
            RData::A(addr) => FieldValue::IpAddr(IpAddr::from(addr)),
            RData::Aaaa(addr) => FieldValue::IpAddr(IpAddr::from(addr)),
            RData::Name(name) => FieldValue::Str(name),
            RData::Raw(bytes) => FieldValue::Bytes(bytes),
        };
        builder = builder
            .field("dns.an_name", FieldValue::Str(an.name))
            .field("dns.an_type", FieldValue::Str(dns::type_name(an.rtype)))
            .field("dns.an_rtype", FieldValue::UInt16(an.rtype))
            .field("dns.an_data", data);
    }

    builder
}

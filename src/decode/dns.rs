//! DNS message parsing.
//!
//! Minimal wire-format parser for the header, question section, and answer
//! section, with compressed-name decoding. Anything malformed yields `None`;
//! the caller treats the packet as not-DNS rather than failing the event.

/// Bound on compression-pointer hops while decoding one name.
const MAX_POINTER_HOPS: usize = 32;

/// Upper bound on a decoded name, per RFC 1035.
const MAX_NAME_LEN: usize = 255;

/// A parsed DNS message (header + questions + answers).
#[derive(Debug)]
pub struct Message {
    pub tx_id: u16,
    pub is_response: bool,
    pub questions: Vec<Question>,
    pub answers: Vec<Answer>,
}

/// One entry from the question section.
#[derive(Debug)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
}

/// One resource record from the answer section.
#[derive(Debug)]
pub struct Answer {
    pub name: String,
    pub rtype: u16,
    pub data: RData,
}

/// Answer payload, decoded per record type.
#[derive(Debug)]
pub enum RData {
    /// A record: IPv4 address
    A([u8; 4]),
    /// AAAA record: IPv6 address
    Aaaa([u8; 16]),
    /// CNAME/NS/PTR: a domain name
    Name(String),
    /// Anything else, kept raw
    Raw(Vec<u8>),
}

/// Record type numbers this module decodes specially.
pub mod rtype {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
}

/// Human-readable name for a record type.
pub fn type_name(t: u16) -> String {
    match t {
        rtype::A => "A".to_string(),
        rtype::NS => "NS".to_string(),
        rtype::CNAME => "CNAME".to_string(),
        rtype::PTR => "PTR".to_string(),
        rtype::MX => "MX".to_string(),
        rtype::TXT => "TXT".to_string(),
        rtype::AAAA => "AAAA".to_string(),
        rtype::SRV => "SRV".to_string(),
        other => format!("TYPE{other}"),
    }
}

/// Parse a DNS message from a UDP payload.
pub fn parse(data: &[u8]) -> Option<Message> {
    if data.len() < 12 {
        return None;
    }

    let tx_id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let is_response = flags & 0x8000 != 0;
    let qd_count = u16::from_be_bytes([data[4], data[5]]) as usize;
    let an_count = u16::from_be_bytes([data[6], data[7]]) as usize;

    let mut pos = 12;
    let mut questions = Vec::with_capacity(qd_count.min(16));
    for _ in 0..qd_count {
        let (name, next) = read_name(data, pos)?;
        if next + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[next], data[next + 1]]);
        questions.push(Question { name, qtype });
        pos = next + 4; // type + class
    }

    let mut answers = Vec::with_capacity(an_count.min(16));
    for _ in 0..an_count {
        let (name, next) = read_name(data, pos)?;
        if next + 10 > data.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([data[next], data[next + 1]]);
        let rdlen = u16::from_be_bytes([data[next + 8], data[next + 9]]) as usize;
        let rdata_at = next + 10;
        if rdata_at + rdlen > data.len() {
            return None;
        }
        let rdata = &data[rdata_at..rdata_at + rdlen];

        let data_val = match rtype {
            rtype::A if rdlen == 4 => RData::A([rdata[0], rdata[1], rdata[2], rdata[3]]),
            rtype::AAAA if rdlen == 16 => {
                let mut v6 = [0u8; 16];
                v6.copy_from_slice(rdata);
                RData::Aaaa(v6)
            }
            rtype::CNAME | rtype::NS | rtype::PTR => {
                let (target, _) = read_name(data, rdata_at)?;
                RData::Name(target)
            }
            _ => RData::Raw(rdata.to_vec()),
        };

        answers.push(Answer {
            name,
            rtype,
            data: data_val,
        });
        pos = rdata_at + rdlen;
    }

    Some(Message {
        tx_id,
        is_response,
        questions,
        answers,
    })
}

/// Decode a possibly-compressed name starting at `pos`.
///
/// Returns the dotted name and the offset just past the name in the
/// original (non-pointer) byte stream.
fn read_name(data: &[u8], pos: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut cursor = pos;
    let mut next = None; // resume offset, set at the first pointer
    let mut hops = 0;

    loop {
        let len = *data.get(cursor)? as usize;

        if len & 0xc0 == 0xc0 {
            // Compression pointer.
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return None;
            }
            let lo = *data.get(cursor + 1)? as usize;
            if next.is_none() {
                next = Some(cursor + 2);
            }
            cursor = ((len & 0x3f) << 8) | lo;
            continue;
        }

        if len == 0 {
            cursor += 1;
            break;
        }
        if len > 63 {
            return None;
        }

        let label = data.get(cursor + 1..cursor + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        if name.len() > MAX_NAME_LEN {
            return None;
        }
        cursor += 1 + len;
    }

    Some((name, next.unwrap_or(cursor)))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Query for "x.test", type A, tx id 7.
    fn query_x_test() -> Vec<u8> {
        vec![
            0x00, 0x07, // tx id
            0x01, 0x00, // flags: standard query, RD
            0x00, 0x01, // 1 question
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // no answers/auth/add
            0x01, b'x', 0x04, b't', b'e', b's', b't', 0x00, // x.test
            0x00, 0x01, // type A
            0x00, 0x01, // class IN
        ]
    }

    #[test]
    fn test_parse_query() {
        let msg = parse(&query_x_test()).unwrap();
        assert_eq!(msg.tx_id, 7);
        assert!(!msg.is_response);
        assert_eq!(msg.questions.len(), 1);
        assert_eq!(msg.questions[0].name, "x.test");
        assert_eq!(msg.questions[0].qtype, rtype::A);
        assert!(msg.answers.is_empty());
    }

    #[test]
    fn test_parse_response_with_a_answer() {
        let mut msg = query_x_test();
        msg[2] = 0x81; // QR bit set
        msg[7] = 0x01; // 1 answer
        msg.extend_from_slice(&[
            0xc0, 0x0c, // name: pointer to offset 12 ("x.test")
            0x00, 0x01, // type A
            0x00, 0x01, // class IN
            0x00, 0x00, 0x00, 0x3c, // ttl 60
            0x00, 0x04, // rdlength 4
            1, 2, 3, 4, // 1.2.3.4
        ]);

        let parsed = parse(&msg).unwrap();
        assert!(parsed.is_response);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].name, "x.test");
        assert!(matches!(parsed.answers[0].data, RData::A([1, 2, 3, 4])));
    }

    #[test]
    fn test_parse_cname_answer() {
        let mut msg = query_x_test();
        msg[2] = 0x81;
        msg[7] = 0x01;
        msg.extend_from_slice(&[
            0xc0, 0x0c, // x.test
            0x00, 0x05, // type CNAME
            0x00, 0x01, // class IN
            0x00, 0x00, 0x00, 0x3c, // ttl
            0x00, 0x08, // rdlength
            0x01, b'y', 0x04, b't', b'e', b's', b't', 0x00, // y.test
        ]);

        let parsed = parse(&msg).unwrap();
        match &parsed.answers[0].data {
            RData::Name(n) => assert_eq!(n, "y.test"),
            other => panic!("expected CNAME name, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(parse(&[0x00, 0x07, 0x01]).is_none());
    }

    #[test]
    fn test_truncated_answer_rejected() {
        let mut msg = query_x_test();
        msg[7] = 0x01; // claims one answer that is not present
        assert!(parse(&msg).is_none());
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let msg = vec![
            0x00, 0x07, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0xc0, 0x0c, // name points at itself
            0x00, 0x01, 0x00, 0x01,
        ];
        assert!(parse(&msg).is_none());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(1), "A");
        assert_eq!(type_name(28), "AAAA");
        assert_eq!(type_name(5), "CNAME");
        assert_eq!(type_name(999), "TYPE999");
    }
}

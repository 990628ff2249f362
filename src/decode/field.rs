//! Field value types for decoded packets.

use std::net::IpAddr;

/// Possible values for a named packet field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Unsigned 16-bit integer
    UInt16(u16),
    /// Unsigned 32-bit integer
    UInt32(u32),
    /// UTF-8 string
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// IP address (v4 or v6)
    IpAddr(IpAddr),
}

impl FieldValue {
    /// Try to get as u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt16(v) => Some(*v as u64),
            FieldValue::UInt32(v) => Some(*v as u64),
            _ => None,
        }
    }

    /// Raw byte form, for values that have one (addresses and byte blobs).
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            FieldValue::Bytes(b) => Some(b.clone()),
            FieldValue::IpAddr(IpAddr::V4(a)) => Some(a.octets().to_vec()),
            FieldValue::IpAddr(IpAddr::V6(a)) => Some(a.octets().to_vec()),
            _ => None,
        }
    }

    /// Human-readable rendering, used for record fields.
    pub fn repr(&self) -> String {
        match self {
            FieldValue::UInt16(v) => v.to_string(),
            FieldValue::UInt32(v) => v.to_string(),
            FieldValue::Str(s) => s.clone(),
            FieldValue::Bytes(b) => format!("[{} bytes]", b.len()),
            FieldValue::IpAddr(addr) => addr.to_string(),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repr())
    }
}

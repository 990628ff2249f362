//! Tracker tuning knobs.
//!
//! All intervals are virtual-time units (one unit per second of capture
//! time). Configs are immutable after construction; the trackers validate
//! them once at setup and fail fast on inconsistencies.

use crate::error::ConfigError;

/// Configuration for the DNS transaction tracker.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Expiry slots in the in-flight query wheel.
    pub query_wheel: u64,
    /// TTL for an unanswered query before it is reported as a timeout.
    pub query_ttl: u64,
    /// Expiry slots in the address and alias wheels.
    pub cache_wheel: u64,
    /// TTL for address and alias cache entries.
    pub cache_ttl: u64,
    /// Bound on alias-chain hops during reverse resolution.
    pub max_alias_hops: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            query_wheel: 600,
            query_ttl: 120,
            cache_wheel: 1200,
            cache_ttl: 600,
            max_alias_hops: 32,
        }
    }
}

impl DnsConfig {
    /// Check the TTLs fit their wheels.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ttl("dns query table", self.query_ttl, self.query_wheel)?;
        check_ttl("dns resolution cache", self.cache_ttl, self.cache_wheel)?;
        Ok(())
    }
}

/// Configuration for the flow tracker.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Expiry slots in the flow wheel.
    pub wheel: u64,
    /// Idle timeout after which a flow is summarized and destroyed.
    pub timeout: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            wheel: 3600,
            timeout: 600,
        }
    }
}

impl FlowConfig {
    /// Check the timeout fits the wheel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ttl("flow table", self.timeout, self.wheel)
    }
}

fn check_ttl(what: &'static str, ttl: u64, wheel: u64) -> Result<(), ConfigError> {
    if wheel == 0 {
        return Err(ConfigError::EmptyWheel { what });
    }
    if ttl == 0 || ttl >= wheel {
        return Err(ConfigError::TtlOutOfRange { what, ttl, wheel });
    }
    Ok(())
}

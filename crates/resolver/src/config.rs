//! Channel-wide configuration.
//!
//! Grounded in the `serde` + `toml` configuration layer used by the
//! surrounding project's binary config (default-valued fields, loaded from a
//! TOML file with fallback to the compiled-in defaults).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Behavioral switches on the channel, analogous to c-ares's `ARES_FLAG_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFlags: u32 {
        /// Select servers uniformly at random instead of failover-ordered.
        const ROTATE = 1 << 0;
        /// Ignore the TC (truncated) bit instead of promoting to TCP.
        const IGNORE_TRUNCATION = 1 << 1;
        /// Surface every rcode to the caller instead of retrying
        /// SERVFAIL/NOTIMP/REFUSED against another server.
        const SURFACE_ALL_RCODES = 1 << 2;
        /// Apply DNS 0x20 case randomization to outgoing UDP queries.
        const DNS_0X20 = 1 << 3;
        /// Attach an EDNS OPT record to outgoing queries.
        const EDNS = 1 << 4;
        /// Keep idle TCP connections open across readiness passes instead of
        /// letting `reap_connections` close them.
        const STAYOPEN = 1 << 5;
    }
}

/// Tunables controlling dispatch, retry, and timeout behavior.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChannelConfig {
    #[serde(default = "default_flags_bits")]
    flags_bits: u32,
    /// Baseline per-attempt timeout in milliseconds, used when metrics has no
    /// better estimate for a server yet.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
    /// Upper bound applied to the (possibly doubled) per-attempt timeout.
    /// `None` means unbounded.
    #[serde(default)]
    pub max_timeout_ms: Option<u32>,
    /// Maximum send attempts per server before a query is abandoned.
    #[serde(default = "default_tries")]
    pub tries_per_server: u16,
    /// `udp_max_queries` per UDP connection before a fresh one is opened.
    /// Zero means unlimited.
    #[serde(default)]
    pub udp_max_queries: u32,
    /// Denominator of the probability that `failover_server` gives a failed
    /// server a chance to be retried early. Zero disables early retry.
    #[serde(default = "default_server_retry_chance")]
    pub server_retry_chance: u32,
    /// How long (ms) a server stays excluded from early-retry consideration
    /// after a failure.
    #[serde(default = "default_server_retry_delay_ms")]
    pub server_retry_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            flags_bits: default_flags_bits(),
            timeout_ms: default_timeout_ms(),
            max_timeout_ms: None,
            tries_per_server: default_tries(),
            udp_max_queries: 0,
            server_retry_chance: default_server_retry_chance(),
            server_retry_delay_ms: default_server_retry_delay_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn flags(&self) -> ChannelFlags {
        ChannelFlags::from_bits_truncate(self.flags_bits)
    }

    pub fn set_flags(&mut self, flags: ChannelFlags) {
        self.flags_bits = flags.bits();
    }

    /// Parse a channel configuration from TOML text.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

fn default_flags_bits() -> u32 {
    ChannelFlags::empty().bits()
}

fn default_timeout_ms() -> u32 {
    2000
}

fn default_tries() -> u16 {
    5
}

fn default_server_retry_chance() -> u32 {
    10
}

fn default_server_retry_delay_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = ChannelConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed = ChannelConfig::from_toml(&text).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg = ChannelConfig::from_toml("timeout_ms = 500\n").unwrap();
        assert_eq!(cfg.timeout_ms, 500);
        assert_eq!(cfg.tries_per_server, default_tries());
    }
}

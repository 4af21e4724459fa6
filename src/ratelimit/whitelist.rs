//! IP whitelist matching.
//!
//! Entries are either CIDR ranges (`192.168.1.0/24`) or wildcard patterns
//! where `*` stands for one octet's digits (`10.0.*.*`). Entries that cannot be
//! parsed are kept but never match.

use std::net::Ipv4Addr;

use regex::Regex;
use tracing::warn;

/// A compiled whitelist entry.
#[derive(Debug, Clone)]
enum Pattern {
    Cidr { network: u32, mask: u32 },
    Wildcard(Regex),
    Invalid,
}

impl Pattern {
    fn compile(entry: &str) -> Self {
        let entry = entry.trim();
        let pattern = if entry.contains('/') {
            Self::compile_cidr(entry)
        } else {
            Self::compile_wildcard(entry)
        };
        pattern.unwrap_or_else(|| {
            warn!(entry = %entry, "Ignoring malformed IP whitelist entry");
            Pattern::Invalid
        })
    }

    fn compile_cidr(entry: &str) -> Option<Self> {
        let (subnet, bits) = entry.split_once('/')?;
        let subnet: Ipv4Addr = subnet.parse().ok()?;
        let bits: u32 = bits.parse().ok()?;
        if bits > 32 {
            return None;
        }
        let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
        Some(Pattern::Cidr {
            network: u32::from(subnet) & mask,
            mask,
        })
    }

    fn compile_wildcard(entry: &str) -> Option<Self> {
        if entry.is_empty() {
            return None;
        }
        let body = regex::escape(entry).replace(r"\*", "[0-9]+");
        Regex::new(&format!("^{body}$")).ok().map(Pattern::Wildcard)
    }

    fn matches(&self, ip: &str, parsed: Option<u32>) -> bool {
        match self {
            Pattern::Cidr { network, mask } => {
                parsed.is_some_and(|ip| ip & mask == *network)
            }
            Pattern::Wildcard(regex) => regex.is_match(ip),
            Pattern::Invalid => false,
        }
    }
}

/// Ordered list of whitelisted IP patterns.
#[derive(Debug, Clone, Default)]
pub struct IpWhitelist {
    entries: Vec<(String, Pattern)>,
}

impl IpWhitelist {
    /// Compile a whitelist from its configured entries.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|entry| {
                let entry = entry.as_ref();
                (entry.to_string(), Pattern::compile(entry))
            })
            .collect();
        Self { entries }
    }

    /// Whether `ip` matches any entry.
    pub fn contains(&self, ip: &str) -> bool {
        self.matching_entry(ip).is_some()
    }

    /// The first entry that matches `ip`, as configured.
    pub fn matching_entry(&self, ip: &str) -> Option<&str> {
        let ip = ip.trim();
        let parsed = ip.parse::<Ipv4Addr>().ok().map(u32::from);
        self.entries
            .iter()
            .find(|(_, pattern)| pattern.matches(ip, parsed))
            .map(|(entry, _)| entry.as_str())
    }

    /// Number of configured entries, including malformed ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

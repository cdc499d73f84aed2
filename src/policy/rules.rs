//! Builders for single nftables rule lines
//!
//! A rule is assembled from match clauses in a fixed order:
//!
//! ```text
//! [base] [except] [allow] [port] [log] counter accept comment "<comment>"
//! ```
//!
//! e.g. `ip saddr != { 10.1.0.0/16 } ip saddr { 10.0.0.0/8 } tcp dport { 80, 443 } counter accept comment "..."`

use std::{collections::BTreeSet, fmt};

use ipnet::IpNet;

use super::model::{PolicyPort, Protocol};
use crate::net::{IpVersion, prefix::join_prefixes};

pub const CLUSTER_PREFIXES_V4: &str = "cluster_prefixes";
pub const CLUSTER_PREFIXES_V6: &str = "cluster_prefixes_v6";

const LOG_ACCEPTED: &str = "log prefix \"nftwall-accepted: \" limit rate 10/second";

/// nftables comments are limited to 128 bytes
const MAX_COMMENT_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Source,
    Destination,
}

impl Direction {
    pub const fn keyword(self) -> &'static str {
        match self {
            Direction::Source => "saddr",
            Direction::Destination => "daddr",
        }
    }
}

/// `ip saddr { a, b }` or, negated, `ip saddr != { a, b }`
pub fn address_clause(
    version: IpVersion,
    direction: Direction,
    negate: bool,
    prefixes: &BTreeSet<IpNet>,
) -> String {
    let operator = if negate { "!= " } else { "" };
    format!(
        "{} {} {operator}{{ {} }}",
        version.family(),
        direction.keyword(),
        join_prefixes(prefixes)
    )
}

/// `ip daddr @set`
pub fn set_clause(version: IpVersion, direction: Direction, set_name: &str) -> String {
    format!("{} {} @{set_name}", version.family(), direction.keyword())
}

/// Base clause anchoring egress rules to traffic originating inside the cluster
pub fn cluster_prefix_clause(version: IpVersion) -> String {
    let set = match version {
        IpVersion::V4 => CLUSTER_PREFIXES_V4,
        IpVersion::V6 => CLUSTER_PREFIXES_V6,
    };
    format!("{} saddr == @{set}", version.family())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Ports of one protocol; `all` covers every port and wins over explicit ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBucket {
    pub all: bool,
    pub ranges: BTreeSet<PortRange>,
}

impl PortBucket {
    pub fn is_empty(&self) -> bool {
        !self.all && self.ranges.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBuckets {
    pub tcp: PortBucket,
    pub udp: PortBucket,
}

impl PortBuckets {
    /// Bucket policy ports by protocol, TCP when unspecified
    pub fn from_policy_ports(ports: &[PolicyPort]) -> Result<Self, String> {
        let mut buckets = Self::default();
        for port in ports {
            let bucket = buckets.bucket_mut(port.protocol.unwrap_or_default());
            match (port.port, port.end_port) {
                (None, None) => bucket.all = true,
                (None, Some(end)) => {
                    return Err(format!("endPort {end} given without a port"));
                }
                (Some(start), end) => {
                    let end = end.unwrap_or(start);
                    if end < start {
                        return Err(format!("endPort {end} is lower than port {start}"));
                    }
                    bucket.ranges.insert(PortRange { start, end });
                }
            }
        }
        Ok(buckets)
    }

    pub fn insert(&mut self, protocol: Protocol, port: u16) {
        self.bucket_mut(protocol).ranges.insert(PortRange {
            start: port,
            end: port,
        });
    }

    fn bucket_mut(&mut self, protocol: Protocol) -> &mut PortBucket {
        match protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }

    /// One match clause per non-empty protocol bucket
    pub fn clauses(&self) -> Vec<(Protocol, String)> {
        [(Protocol::Tcp, &self.tcp), (Protocol::Udp, &self.udp)]
            .into_iter()
            .filter_map(|(protocol, bucket)| {
                port_clause(protocol, bucket).map(|clause| (protocol, clause))
            })
            .collect()
    }
}

/// `tcp dport { 22, 8000-8080 }`, or `meta l4proto tcp` when all ports are selected
pub fn port_clause(protocol: Protocol, bucket: &PortBucket) -> Option<String> {
    if bucket.all {
        return Some(format!("meta l4proto {protocol}"));
    }
    if bucket.ranges.is_empty() {
        return None;
    }
    let ports = bucket
        .ranges
        .iter()
        .map(PortRange::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("{protocol} dport {{ {ports} }}"))
}

/// Join constraints, optional port clause and the accept action into one rule line
pub fn assemble_rule(
    constraints: &[String],
    port_clause: Option<&str>,
    log_accepted: bool,
    comment: &str,
) -> String {
    let mut parts: Vec<&str> = constraints.iter().map(String::as_str).collect();
    if let Some(clause) = port_clause {
        parts.push(clause);
    }
    if log_accepted {
        parts.push(LOG_ACCEPTED);
    }
    parts.push("counter accept");

    let comment = format!("comment \"{}\"", sanitize_comment(comment));
    parts.push(&comment);
    parts.join(" ")
}

fn sanitize_comment(comment: &str) -> String {
    let mut sanitized: String = comment
        .chars()
        .map(|c| if c == '"' || c.is_control() { '\'' } else { c })
        .collect();
    if sanitized.len() > MAX_COMMENT_LEN {
        let mut cut = MAX_COMMENT_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
    }
    sanitized
}

/// Deduplicate and sort rules so identical input always renders identically
pub fn unique_sorted(mut rules: Vec<String>) -> Vec<String> {
    rules.sort();
    rules.dedup();
    rules
}

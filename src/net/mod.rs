pub mod cache;
pub mod prefix;
pub mod proxy;
pub mod resolver;
pub mod selector;

use std::{fmt, net::IpAddr};

use serde::{Deserialize, Serialize};

// Re-export main types and functions
pub use cache::{CacheAt, DnsCache, FqdnCache, IpSet};
pub use prefix::{PrefixSet, parse_prefix};
pub use proxy::{DnsProxy, DnsProxyConfig, DnsProxyHandle};
pub use resolver::system_upstream;
pub use selector::FqdnSelector;

/// IP protocol version, serialized with the nftables family keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum IpVersion {
    #[serde(rename = "ip")]
    V4,
    #[serde(rename = "ip6")]
    V6,
}

impl IpVersion {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// nftables family keyword used in match expressions ("ip saddr ...")
    pub const fn family(self) -> &'static str {
        match self {
            IpVersion::V4 => "ip",
            IpVersion::V6 => "ip6",
        }
    }

    /// nftables set element type
    pub const fn set_type(self) -> &'static str {
        match self {
            IpVersion::V4 => "ipv4_addr",
            IpVersion::V6 => "ipv6_addr",
        }
    }

    pub const fn suffix(self) -> &'static str {
        match self {
            IpVersion::V4 => "v4",
            IpVersion::V6 => "v6",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family())
    }
}

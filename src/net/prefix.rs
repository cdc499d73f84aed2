use std::{collections::BTreeSet, net::IpAddr};

use ipnet::IpNet;

use crate::{error::NftwallError, net::IpVersion};

/// Parse a single prefix entry
///
/// Accepts CIDR notation ("10.0.0.0/8", "2001:db8::/32") and bare addresses,
/// which become host prefixes (/32 or /128). Host bits below the prefix
/// length are cleared, so "10.1.2.3/8" normalizes to "10.0.0.0/8".
///
/// # Examples
/// ```
/// use nftwall::net::prefix::parse_prefix;
///
/// let net = parse_prefix("192.168.1.7/24").unwrap();
/// assert_eq!(net.to_string(), "192.168.1.0/24");
/// ```
pub fn parse_prefix(entry: &str) -> Result<IpNet, NftwallError> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err(NftwallError::InvalidCidr {
            entry: entry.to_string(),
            reason: "empty value".to_string(),
        });
    }

    if let Ok(net) = trimmed.parse::<IpNet>() {
        return Ok(net.trunc());
    }

    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(IpNet::from(ip));
    }

    let reason = match trimmed.split_once('/') {
        Some((_, len)) if len.parse::<u8>().is_err() => "invalid prefix length",
        Some(_) => "invalid address or prefix length out of range",
        None => "not an IP address or CIDR",
    };

    Err(NftwallError::InvalidCidr {
        entry: entry.to_string(),
        reason: reason.to_string(),
    })
}

pub fn version_of(net: &IpNet) -> IpVersion {
    match net {
        IpNet::V4(_) => IpVersion::V4,
        IpNet::V6(_) => IpVersion::V6,
    }
}

/// Normalized set of network prefixes
///
/// Prefixes are aggregated on construction: overlapping and adjacent ranges
/// are merged, so `contains` only has to find one covering prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSet {
    prefixes: Vec<IpNet>,
}

impl PrefixSet {
    pub fn new<I: IntoIterator<Item = IpNet>>(prefixes: I) -> Self {
        let collected: Vec<IpNet> = prefixes.into_iter().collect();
        Self {
            prefixes: IpNet::aggregate(&collected),
        }
    }

    /// Build a set from textual entries, failing on the first invalid one
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, NftwallError> {
        let parsed = entries
            .iter()
            .map(|entry| parse_prefix(entry.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(parsed))
    }

    /// Whether `net` lies entirely inside one of the prefixes of this set
    pub fn contains(&self, net: &IpNet) -> bool {
        self.prefixes.iter().any(|prefix| prefix.contains(net))
    }

    pub fn merge(&mut self, other: &PrefixSet) {
        let mut all = self.prefixes.clone();
        all.extend(other.prefixes.iter().copied());
        self.prefixes = IpNet::aggregate(&all);
    }

    pub fn prefixes(&self) -> &[IpNet] {
        &self.prefixes
    }

    pub fn by_version(&self, version: IpVersion) -> Vec<IpNet> {
        self.prefixes
            .iter()
            .filter(|net| version_of(net) == version)
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

/// Prefixes of one address family taken from a list of peers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyTargets {
    pub allow: BTreeSet<IpNet>,
    pub except: BTreeSet<IpNet>,
}

impl FamilyTargets {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.except.is_empty()
    }

    /// True when the allow list is exactly the unrestricted range and nothing is excluded
    pub fn allows_everything(&self) -> bool {
        self.except.is_empty()
            && self.allow.len() == 1
            && self.allow.iter().all(|net| net.prefix_len() == 0)
    }
}

pub fn join_prefixes<'a, I: IntoIterator<Item = &'a IpNet>>(prefixes: I) -> String {
    prefixes
        .into_iter()
        .map(IpNet::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.0/8", "10.0.0.0/8", "plain IPv4 CIDR")]
    #[case("10.1.2.3/8", "10.0.0.0/8", "host bits are cleared")]
    #[case("192.0.2.1", "192.0.2.1/32", "bare IPv4 becomes host prefix")]
    #[case("  172.16.0.0/12  ", "172.16.0.0/12", "surrounding whitespace")]
    #[case("2001:db8::/32", "2001:db8::/32", "IPv6 CIDR")]
    #[case("2001:db8::1", "2001:db8::1/128", "bare IPv6 becomes host prefix")]
    #[case("0.0.0.0/0", "0.0.0.0/0", "unrestricted range")]
    fn test_parse_prefix(#[case] entry: &str, #[case] expected: &str, #[case] _description: &str) {
        assert_eq!(parse_prefix(entry).unwrap().to_string(), expected);
    }

    #[rstest]
    #[case("", "empty value")]
    #[case("10.0.0.0/33", "prefix length out of range")]
    #[case("10.0.0.0/abc", "non-numeric prefix length")]
    #[case("example.com", "domain name")]
    #[case("999.1.1.1/8", "invalid octet")]
    fn test_parse_prefix_errors(#[case] entry: &str, #[case] _description: &str) {
        let result = parse_prefix(entry);
        assert!(matches!(result, Err(NftwallError::InvalidCidr { .. })));
    }

    #[test]
    fn prefix_set_aggregates_adjacent_ranges() {
        let set = PrefixSet::parse(&["10.0.0.0/9", "10.128.0.0/9", "10.1.0.0/16"]).unwrap();
        assert_eq!(set.prefixes(), &["10.0.0.0/8".parse::<IpNet>().unwrap()]);
    }

    #[rstest]
    #[case("10.1.0.0/16", true)]
    #[case("10.0.0.1", true)]
    #[case("11.0.0.0/16", false)]
    #[case("0.0.0.0/0", false)]
    #[case("2001:db8::/48", true)]
    #[case("2001:db9::/48", false)]
    fn prefix_set_contains(#[case] entry: &str, #[case] expected: bool) {
        let set = PrefixSet::parse(&["10.0.0.0/8", "2001:db8::/32"]).unwrap();
        assert_eq!(set.contains(&parse_prefix(entry).unwrap()), expected);
    }

    #[test]
    fn prefix_set_merge_and_split_by_version() {
        let mut set = PrefixSet::parse(&["10.0.0.0/8"]).unwrap();
        set.merge(&PrefixSet::parse(&["2001:db8::/32", "10.2.0.0/16"]).unwrap());
        assert_eq!(set.by_version(IpVersion::V4).len(), 1);
        assert_eq!(set.by_version(IpVersion::V6).len(), 1);
    }

    #[test]
    fn family_targets_detects_unrestricted_allow() {
        let mut targets = FamilyTargets::default();
        targets.allow.insert(parse_prefix("0.0.0.0/0").unwrap());
        assert!(targets.allows_everything());

        targets.except.insert(parse_prefix("10.0.0.0/8").unwrap());
        assert!(!targets.allows_everything());
    }
}

use std::collections::{BTreeMap, BTreeSet};

use ipnet::IpNet;

use super::{
    model::{
        ClusterwideNetworkPolicy, EgressRule, FqdnState, IngressRule, IpBlock, Service, ServiceType,
    },
    rules::{
        Direction, PortBuckets, address_clause, assemble_rule, cluster_prefix_clause, set_clause,
        unique_sorted,
    },
};
use crate::{
    error::NftwallError,
    net::{
        FqdnCache, IpVersion, PrefixSet,
        prefix::{FamilyTargets, parse_prefix, version_of},
    },
};

const ALL_VERSIONS: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];

/// Knobs applied to every compiled rule
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Sources outside these prefixes are rejected; `None` allows any source
    pub allowed_ingress: Option<PrefixSet>,
    /// Destinations outside these prefixes are rejected; `None` allows any destination
    pub allowed_egress: Option<PrefixSet>,
    pub log_accepted_connections: bool,
}

/// A policy or service rule that was skipped during compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRule {
    /// Policy name or "<namespace>/<service>"
    pub object: String,
    /// Position of the rule inside the object, e.g. "egress[1]"
    pub rule: String,
    pub reason: String,
}

/// Result of one compilation run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledRules {
    pub ingress: Vec<String>,
    pub egress: Vec<String>,
    /// Policy name to the sets backing its FQDN selectors
    pub fqdn_states: BTreeMap<String, FqdnState>,
    pub rejected: Vec<RejectedRule>,
}

/// Compile policies and services into sorted, deduplicated ingress and egress rules
///
/// Invalid rules are skipped and reported in [`CompiledRules::rejected`];
/// every other rule is still compiled. The only hard error is a policy with
/// FQDN egress rules while no cache is available, checked before any rule is
/// built so that callers never see a partial result.
///
/// # Examples
/// ```
/// use nftwall::policy::{ClusterwideNetworkPolicy, CompileOptions, IngressRule, PolicyPort, compile};
///
/// let policy = ClusterwideNetworkPolicy {
///     name: "allow-ssh".to_string(),
///     ingress: vec![IngressRule { ports: vec![PolicyPort::tcp(22)], from: vec![] }],
///     egress: vec![],
/// };
/// let rules = compile(&[policy], &[], None, &CompileOptions::default()).unwrap();
/// assert_eq!(
///     rules.ingress,
///     vec!["tcp dport { 22 } counter accept comment \"accept traffic for network policy allow-ssh (tcp)\""]
/// );
/// ```
pub fn compile(
    policies: &[ClusterwideNetworkPolicy],
    services: &[Service],
    cache: Option<&dyn FqdnCache>,
    options: &CompileOptions,
) -> Result<CompiledRules, NftwallError> {
    if cache.is_none()
        && let Some(policy) = policies.iter().find(|policy| policy.has_fqdn_rules())
    {
        return Err(NftwallError::FqdnCacheUnavailable {
            policy: policy.name.clone(),
        });
    }

    let mut compiler = Compiler {
        cache,
        options,
        output: CompiledRules::default(),
    };
    for policy in policies {
        compiler.compile_policy(policy);
    }
    for service in services {
        compiler.compile_service(service);
    }

    let mut output = compiler.output;
    output.ingress = unique_sorted(output.ingress);
    output.egress = unique_sorted(output.egress);
    output.rejected.sort_by(|a, b| {
        (&a.object, &a.rule, &a.reason).cmp(&(&b.object, &b.rule, &b.reason))
    });
    output.rejected.dedup();

    log::debug!(
        "Compiled {} ingress and {} egress rules ({} rejected)",
        output.ingress.len(),
        output.egress.len(),
        output.rejected.len()
    );
    Ok(output)
}

/// Match clauses shared by every port variant of one rule
type Constraints = Vec<String>;

struct Compiler<'a> {
    cache: Option<&'a dyn FqdnCache>,
    options: &'a CompileOptions,
    output: CompiledRules,
}

impl Compiler<'_> {
    fn compile_policy(&mut self, policy: &ClusterwideNetworkPolicy) {
        for (index, rule) in policy.ingress.iter().enumerate() {
            let location = format!("ingress[{index}]");
            match self.policy_ingress(&policy.name, rule) {
                Ok(rules) => self.output.ingress.extend(rules),
                Err(reason) => self.reject(&policy.name, location, reason),
            }
        }

        for (index, rule) in policy.egress.iter().enumerate() {
            let location = format!("egress[{index}]");
            match self.policy_egress(&policy.name, rule) {
                Ok(rules) => self.output.egress.extend(rules),
                Err(reason) => self.reject(&policy.name, location, reason),
            }
        }
    }

    fn policy_ingress(&self, policy: &str, rule: &IngressRule) -> Result<Vec<String>, String> {
        let buckets = PortBuckets::from_policy_ports(&rule.ports)?;
        let targets = split_targets(&rule.from, self.options.allowed_ingress.as_ref())?;

        let constraints: Vec<Constraints> = if targets.is_empty() {
            vec![Vec::new()]
        } else {
            targets
                .iter()
                .map(|(version, family)| peer_clauses(*version, Direction::Source, family))
                .collect()
        };

        Ok(self.expand(&constraints, &buckets, |protocol| {
            format!("accept traffic for network policy {policy} ({protocol})")
        }))
    }

    fn policy_egress(&mut self, policy: &str, rule: &EgressRule) -> Result<Vec<String>, String> {
        if !rule.to.is_empty() && !rule.to_fqdns.is_empty() {
            return Err("to and toFQDNs are mutually exclusive".to_string());
        }
        let buckets = PortBuckets::from_policy_ports(&rule.ports)?;

        if !rule.to_fqdns.is_empty() {
            return self.policy_egress_fqdn(policy, rule, &buckets);
        }

        let targets = split_targets(&rule.to, self.options.allowed_egress.as_ref())?;
        let constraints: Vec<Constraints> = if targets.is_empty() {
            ALL_VERSIONS
                .iter()
                .map(|version| vec![cluster_prefix_clause(*version)])
                .collect()
        } else {
            targets
                .iter()
                .map(|(version, family)| {
                    let mut clauses = vec![cluster_prefix_clause(*version)];
                    if !family.allows_everything() {
                        clauses.extend(peer_clauses(*version, Direction::Destination, family));
                    }
                    clauses
                })
                .collect()
        };

        Ok(self.expand(&constraints, &buckets, |protocol| {
            format!("accept egress traffic for network policy {policy} ({protocol})")
        }))
    }

    fn policy_egress_fqdn(
        &mut self,
        policy: &str,
        rule: &EgressRule,
        buckets: &PortBuckets,
    ) -> Result<Vec<String>, String> {
        for selector in &rule.to_fqdns {
            selector.validate().map_err(|err| err.to_string())?;
        }
        // Checked in compile() before any policy is visited
        let Some(cache) = self.cache else {
            return Ok(Vec::new());
        };

        let mut rules = Vec::new();
        for selector in &rule.to_fqdns {
            let sets = cache.get_sets_for_fqdn(selector, true);
            if sets.is_empty() {
                log::debug!(
                    "No resolved sets yet for {} in policy {policy}",
                    selector.get_name()
                );
            }

            let constraints: Vec<Constraints> = sets
                .iter()
                .map(|set| {
                    vec![
                        cluster_prefix_clause(set.version),
                        set_clause(set.version, Direction::Destination, &set.set_name),
                    ]
                })
                .collect();
            let name = selector.get_name();
            rules.extend(self.expand(&constraints, buckets, |protocol| {
                format!("accept egress traffic for network policy {policy} to {name} ({protocol})")
            }));

            self.output
                .fqdn_states
                .entry(policy.to_string())
                .or_default()
                .insert(name.to_string(), sets);
        }
        Ok(rules)
    }

    fn compile_service(&mut self, service: &Service) {
        if !matches!(
            service.service_type,
            ServiceType::LoadBalancer | ServiceType::NodePort
        ) {
            return;
        }
        let name = service.qualified_name();
        match self.service_rules(service) {
            Ok(rules) => self.output.ingress.extend(rules),
            Err(reason) => self.reject(&name, "service".to_string(), reason),
        }
    }

    fn service_rules(&self, service: &Service) -> Result<Vec<String>, String> {
        let sources = parse_all(&service.load_balancer_source_ranges)?;
        if let Some(allowed) = &self.options.allowed_ingress
            && let Some(outside) = sources.iter().find(|net| !allowed.contains(net))
        {
            return Err(format!("source range {outside} is outside the allowed ingress prefixes"));
        }

        let destinations = match service.service_type {
            ServiceType::LoadBalancer => {
                let ips = parse_all(&service.external_ips())?;
                if ips.is_empty() {
                    log::debug!(
                        "Service {} has no external address yet",
                        service.qualified_name()
                    );
                    return Ok(Vec::new());
                }
                ips
            }
            _ => Vec::new(),
        };

        let mut buckets = PortBuckets::default();
        for port in &service.ports {
            let number = match service.service_type {
                ServiceType::NodePort => port.node_port.unwrap_or(port.port),
                _ => port.port,
            };
            buckets.insert(port.protocol.unwrap_or_default(), number);
        }
        if buckets.is_empty() {
            return Ok(Vec::new());
        }

        let sources = group_by_version(sources);
        let destinations = group_by_version(destinations);
        let constraints: Vec<Constraints> = if sources.is_empty() && destinations.is_empty() {
            vec![Vec::new()]
        } else {
            ALL_VERSIONS
                .iter()
                .filter(|version| sources.is_empty() || sources.contains_key(version))
                .filter(|version| destinations.is_empty() || destinations.contains_key(version))
                .map(|version| {
                    let mut clauses = Vec::new();
                    if let Some(nets) = sources.get(version) {
                        clauses.push(address_clause(*version, Direction::Source, false, nets));
                    }
                    if let Some(nets) = destinations.get(version) {
                        clauses.push(address_clause(*version, Direction::Destination, false, nets));
                    }
                    clauses
                })
                .collect()
        };

        let name = service.qualified_name();
        Ok(self.expand(&constraints, &buckets, |protocol| {
            format!("accept traffic for service {name} ({protocol})")
        }))
    }

    /// One rule per constraint list and port clause; no port clause when no ports were given
    fn expand<F>(&self, constraints: &[Constraints], buckets: &PortBuckets, comment: F) -> Vec<String>
    where
        F: Fn(&str) -> String,
    {
        let log = self.options.log_accepted_connections;
        if buckets.is_empty() {
            let comment = comment("any");
            return constraints
                .iter()
                .map(|clauses| assemble_rule(clauses, None, log, &comment))
                .collect();
        }

        let mut rules = Vec::new();
        for (protocol, port_clause) in buckets.clauses() {
            let comment = comment(protocol.as_str());
            for clauses in constraints {
                rules.push(assemble_rule(clauses, Some(&port_clause), log, &comment));
            }
        }
        rules
    }

    fn reject(&mut self, object: &str, rule: String, reason: String) {
        log::warn!("Skipping {rule} of {object}: {reason}");
        self.output.rejected.push(RejectedRule {
            object: object.to_string(),
            rule,
            reason,
        });
    }
}

/// Except clause followed by allow clause for one family
fn peer_clauses(version: IpVersion, direction: Direction, family: &FamilyTargets) -> Constraints {
    let mut clauses = Vec::new();
    if !family.except.is_empty() {
        clauses.push(address_clause(version, direction, true, &family.except));
    }
    if !family.allow.is_empty() {
        clauses.push(address_clause(version, direction, false, &family.allow));
    }
    clauses
}

/// Split peer blocks by address family, checking allowed ranges against `allowed`
///
/// An empty block list means "any peer", which an allow-list never admits.
/// Exceptions must lie inside their block's CIDR.
fn split_targets(
    blocks: &[IpBlock],
    allowed: Option<&PrefixSet>,
) -> Result<BTreeMap<IpVersion, FamilyTargets>, String> {
    if blocks.is_empty() && allowed.is_some() {
        return Err("any peer is outside the allowed prefixes".to_string());
    }

    let mut targets: BTreeMap<IpVersion, FamilyTargets> = BTreeMap::new();
    for block in blocks {
        let cidr = parse_prefix(&block.cidr).map_err(|err| err.to_string())?;
        if let Some(allowed) = allowed
            && !allowed.contains(&cidr)
        {
            return Err(format!("{cidr} is outside the allowed prefixes"));
        }
        targets.entry(version_of(&cidr)).or_default().allow.insert(cidr);

        for except in &block.except {
            let except = parse_prefix(except).map_err(|err| err.to_string())?;
            if !cidr.contains(&except) {
                return Err(format!("except {except} is not inside {cidr}"));
            }
            targets
                .entry(version_of(&except))
                .or_default()
                .except
                .insert(except);
        }
    }
    Ok(targets)
}

fn parse_all(entries: &[String]) -> Result<Vec<IpNet>, String> {
    entries
        .iter()
        .map(|entry| parse_prefix(entry).map_err(|err| err.to_string()))
        .collect()
}

fn group_by_version(nets: Vec<IpNet>) -> BTreeMap<IpVersion, BTreeSet<IpNet>> {
    let mut grouped: BTreeMap<IpVersion, BTreeSet<IpNet>> = BTreeMap::new();
    for net in nets {
        grouped.entry(version_of(&net)).or_default().insert(net);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        net::{
            DnsCache, FqdnSelector, IpSet,
            cache::MockFqdnCache,
            testing::{dns_response, upstream},
        },
        policy::model::{
            LoadBalancerIngress, LoadBalancerStatus, PolicyPort, Protocol, ServicePort,
            ServiceStatus,
        },
    };
    use chrono::{Duration, Utc};
    use hickory_proto::rr::RecordType;
    use rstest::rstest;

    fn policy(name: &str) -> ClusterwideNetworkPolicy {
        ClusterwideNetworkPolicy {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn ingress(ports: Vec<PolicyPort>, from: Vec<IpBlock>) -> IngressRule {
        IngressRule { ports, from }
    }

    fn egress_to(ports: Vec<PolicyPort>, to: Vec<IpBlock>) -> EgressRule {
        EgressRule {
            ports,
            to,
            to_fqdns: vec![],
        }
    }

    fn egress_fqdn(ports: Vec<PolicyPort>, selectors: Vec<FqdnSelector>) -> EgressRule {
        EgressRule {
            ports,
            to: vec![],
            to_fqdns: selectors,
        }
    }

    fn block(cidr: &str, except: &[&str]) -> IpBlock {
        IpBlock {
            cidr: cidr.to_string(),
            except: except.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn compile_default(policies: &[ClusterwideNetworkPolicy]) -> CompiledRules {
        compile(policies, &[], None, &CompileOptions::default()).unwrap()
    }

    #[test]
    fn ingress_with_except_and_ports() {
        let mut p = policy("allow-web");
        p.ingress = vec![ingress(
            vec![PolicyPort::tcp(443), PolicyPort::tcp(80)],
            vec![block("10.0.0.0/8", &["10.1.0.0/16"])],
        )];

        let rules = compile_default(&[p]);
        assert_eq!(
            rules.ingress,
            vec![
                "ip saddr != { 10.1.0.0/16 } ip saddr { 10.0.0.0/8 } tcp dport { 80, 443 } counter accept comment \"accept traffic for network policy allow-web (tcp)\""
            ]
        );
        assert!(rules.egress.is_empty());
        assert!(rules.rejected.is_empty());
    }

    #[test]
    fn ingress_without_ports_matches_all_ports() {
        let mut p = policy("from-office");
        p.ingress = vec![ingress(vec![], vec![block("192.0.2.0/24", &[])])];

        let rules = compile_default(&[p]);
        assert_eq!(
            rules.ingress,
            vec![
                "ip saddr { 192.0.2.0/24 } counter accept comment \"accept traffic for network policy from-office (any)\""
            ]
        );
    }

    #[test]
    fn ingress_splits_families_and_protocols() {
        let mut p = policy("dual");
        p.ingress = vec![ingress(
            vec![PolicyPort::tcp(22), PolicyPort::udp(53)],
            vec![block("192.0.2.0/24", &[]), block("2001:db8::/32", &[])],
        )];

        let rules = compile_default(&[p]);
        assert_eq!(
            rules.ingress,
            vec![
                "ip saddr { 192.0.2.0/24 } tcp dport { 22 } counter accept comment \"accept traffic for network policy dual (tcp)\"",
                "ip saddr { 192.0.2.0/24 } udp dport { 53 } counter accept comment \"accept traffic for network policy dual (udp)\"",
                "ip6 saddr { 2001:db8::/32 } tcp dport { 22 } counter accept comment \"accept traffic for network policy dual (tcp)\"",
                "ip6 saddr { 2001:db8::/32 } udp dport { 53 } counter accept comment \"accept traffic for network policy dual (udp)\"",
            ]
        );
    }

    #[test]
    fn egress_to_anywhere_omits_destination_clause() {
        let mut p = policy("internet");
        p.egress = vec![egress_to(vec![PolicyPort::tcp(443)], vec![block("0.0.0.0/0", &[])])];

        let rules = compile_default(&[p]);
        assert_eq!(
            rules.egress,
            vec![
                "ip saddr == @cluster_prefixes tcp dport { 443 } counter accept comment \"accept egress traffic for network policy internet (tcp)\""
            ]
        );
    }

    #[test]
    fn egress_to_anywhere_with_except_keeps_clauses() {
        let mut p = policy("internet");
        p.egress = vec![egress_to(
            vec![PolicyPort::tcp(443)],
            vec![block("0.0.0.0/0", &["10.0.0.0/8"])],
        )];

        let rules = compile_default(&[p]);
        assert_eq!(
            rules.egress,
            vec![
                "ip saddr == @cluster_prefixes ip daddr != { 10.0.0.0/8 } ip daddr { 0.0.0.0/0 } tcp dport { 443 } counter accept comment \"accept egress traffic for network policy internet (tcp)\""
            ]
        );
    }

    #[test]
    fn egress_without_destinations_covers_both_families() {
        let mut p = policy("dns");
        p.egress = vec![egress_to(vec![PolicyPort::udp(53)], vec![])];

        let rules = compile_default(&[p]);
        assert_eq!(
            rules.egress,
            vec![
                "ip saddr == @cluster_prefixes udp dport { 53 } counter accept comment \"accept egress traffic for network policy dns (udp)\"",
                "ip6 saddr == @cluster_prefixes_v6 udp dport { 53 } counter accept comment \"accept egress traffic for network policy dns (udp)\"",
            ]
        );
    }

    #[test]
    fn compilation_is_independent_of_input_order() {
        let mut a = policy("a");
        a.ingress = vec![
            ingress(vec![PolicyPort::tcp(80), PolicyPort::udp(53)], vec![block("10.0.0.0/8", &[])]),
            ingress(vec![], vec![]),
        ];
        a.egress = vec![egress_to(vec![PolicyPort::tcp(443)], vec![block("198.51.100.0/24", &[])])];
        let mut b = policy("b");
        b.ingress = vec![ingress(vec![PolicyPort::tcp(22)], vec![block("2001:db8::/48", &[])])];

        let mut a_reordered = a.clone();
        a_reordered.ingress.reverse();
        a_reordered.ingress[1].ports.reverse();

        let first = compile_default(&[a, b.clone()]);
        let second = compile_default(&[b.clone(), a_reordered]);
        assert_eq!(first, second);
        assert!(first.ingress.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn duplicate_rules_are_collapsed() {
        let mut p = policy("dup");
        let rule = ingress(vec![PolicyPort::tcp(22)], vec![block("10.0.0.0/8", &[])]);
        p.ingress = vec![rule.clone(), rule];

        assert_eq!(compile_default(&[p]).ingress.len(), 1);
    }

    #[rstest]
    #[case(block("10.0.0.300/8", &[]), "invalid CIDR")]
    #[case(block("10.0.0.0/8", &["bogus"]), "invalid CIDR")]
    #[case(block("203.0.113.0/24", &[]), "outside the allowed prefixes")]
    #[case(block("10.0.0.0/8", &["2001:db8::/32"]), "is not inside 10.0.0.0/8")]
    #[case(block("10.0.0.0/8", &["192.168.0.0/16"]), "is not inside 10.0.0.0/8")]
    fn invalid_ingress_rule_is_rejected_alone(#[case] from: IpBlock, #[case] reason: &str) {
        let mut p = policy("mixed");
        p.ingress = vec![
            ingress(vec![PolicyPort::tcp(22)], vec![from]),
            ingress(vec![PolicyPort::tcp(80)], vec![block("10.0.0.0/8", &[])]),
        ];
        let options = CompileOptions {
            allowed_ingress: Some(PrefixSet::parse(&["10.0.0.0/8"]).unwrap()),
            ..Default::default()
        };

        let rules = compile(&[p], &[], None, &options).unwrap();
        assert_eq!(rules.ingress.len(), 1);
        assert!(rules.ingress[0].contains("tcp dport { 80 }"));
        assert_eq!(rules.rejected.len(), 1);
        assert_eq!(rules.rejected[0].object, "mixed");
        assert_eq!(rules.rejected[0].rule, "ingress[0]");
        assert!(rules.rejected[0].reason.contains(reason), "{}", rules.rejected[0].reason);
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let mut p = policy("ports");
        p.ingress = vec![ingress(
            vec![PolicyPort {
                protocol: Some(Protocol::Tcp),
                port: Some(9000),
                end_port: Some(8000),
            }],
            vec![],
        )];

        let rules = compile_default(&[p]);
        assert!(rules.ingress.is_empty());
        assert_eq!(rules.rejected[0].rule, "ingress[0]");
    }

    #[test]
    fn port_range_is_rendered() {
        let mut p = policy("ports");
        p.ingress = vec![ingress(
            vec![PolicyPort {
                protocol: Some(Protocol::Udp),
                port: Some(30000),
                end_port: Some(32767),
            }],
            vec![],
        )];

        assert_eq!(
            compile_default(&[p]).ingress,
            vec!["udp dport { 30000-32767 } counter accept comment \"accept traffic for network policy ports (udp)\""]
        );
    }

    #[test]
    fn log_accepted_connections_adds_log_statement() {
        let mut p = policy("logged");
        p.ingress = vec![ingress(vec![PolicyPort::tcp(22)], vec![])];
        let options = CompileOptions {
            log_accepted_connections: true,
            ..Default::default()
        };

        let rules = compile(&[p], &[], None, &options).unwrap();
        assert_eq!(
            rules.ingress,
            vec![
                "tcp dport { 22 } log prefix \"nftwall-accepted: \" limit rate 10/second counter accept comment \"accept traffic for network policy logged (tcp)\""
            ]
        );
    }

    #[test]
    fn fqdn_rule_without_cache_is_an_error() {
        let mut p = policy("needs-dns");
        p.egress = vec![egress_fqdn(vec![], vec![FqdnSelector::name("example.com")])];

        let err = compile(&[p], &[], None, &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, NftwallError::FqdnCacheUnavailable { policy } if policy == "needs-dns"));
    }

    #[test]
    fn fqdn_rule_resolves_through_populated_cache() {
        let cache = DnsCache::new(upstream());
        cache
            .update(
                Utc::now(),
                &dns_response("example.com.", RecordType::A, &[("93.184.216.34", 300)]),
            )
            .unwrap();

        let mut p = policy("allow-example");
        p.egress = vec![egress_fqdn(vec![], vec![FqdnSelector::name("example.com")])];

        let rules = compile(&[p], &[], Some(&cache), &CompileOptions::default()).unwrap();
        assert_eq!(
            rules.egress,
            vec![
                "ip saddr == @cluster_prefixes ip daddr @fqdn_example_com_v4 counter accept comment \"accept egress traffic for network policy allow-example to example.com (any)\""
            ]
        );

        let state = &rules.fqdn_states["allow-example"];
        let sets = &state["example.com"];
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].set_name, "fqdn_example_com_v4");
        assert_eq!(sets[0].ips, vec!["93.184.216.34".parse::<std::net::IpAddr>().unwrap()]);

        // The set declaration carries the literal addresses
        let rendered = cache.get_sets_for_rendering();
        assert_eq!(rendered, sets.clone());
    }

    #[test]
    fn unresolved_fqdn_yields_no_rules_but_records_state() {
        let mut cache = MockFqdnCache::new();
        cache
            .expect_get_sets_for_fqdn()
            .withf(|selector, for_persist| selector.get_name() == "*.example.org" && *for_persist)
            .times(1)
            .returning(|_, _| Vec::new());

        let mut p = policy("pattern");
        p.egress = vec![egress_fqdn(
            vec![PolicyPort::tcp(443)],
            vec![FqdnSelector::pattern("*.example.org")],
        )];

        let rules = compile(&[p], &[], Some(&cache), &CompileOptions::default()).unwrap();
        assert!(rules.egress.is_empty());
        assert!(rules.rejected.is_empty());
        assert_eq!(rules.fqdn_states["pattern"]["*.example.org"], Vec::<IpSet>::new());
    }

    #[test]
    fn fqdn_sets_of_both_versions_get_one_rule_per_port_bucket() {
        let expiration_time = Utc::now() + Duration::seconds(60);
        let mut cache = MockFqdnCache::new();
        cache.expect_get_sets_for_fqdn().returning(move |_, _| {
            vec![
                IpSet {
                    fqdn: "api.example.com.".to_string(),
                    set_name: "fqdn_api_example_com_v4".to_string(),
                    ips: vec!["192.0.2.10".parse().unwrap()],
                    expiration_time,
                    version: IpVersion::V4,
                },
                IpSet {
                    fqdn: "api.example.com.".to_string(),
                    set_name: "fqdn_api_example_com_v6".to_string(),
                    ips: vec!["2001:db8::10".parse().unwrap()],
                    expiration_time,
                    version: IpVersion::V6,
                },
            ]
        });

        let mut p = policy("api");
        p.egress = vec![egress_fqdn(
            vec![PolicyPort::tcp(443), PolicyPort::udp(443)],
            vec![FqdnSelector::name("api.example.com")],
        )];

        let rules = compile(&[p], &[], Some(&cache), &CompileOptions::default()).unwrap();
        assert_eq!(rules.egress.len(), 4);
        assert!(rules.egress.iter().any(|rule| rule.starts_with(
            "ip6 saddr == @cluster_prefixes_v6 ip6 daddr @fqdn_api_example_com_v6 udp dport { 443 }"
        )));
        assert_eq!(rules.fqdn_states["api"]["api.example.com"].len(), 2);
    }

    #[test]
    fn mixed_to_and_fqdn_is_rejected() {
        let cache = MockFqdnCache::new();
        let mut p = policy("mixed");
        p.egress = vec![
            EgressRule {
                ports: vec![],
                to: vec![block("198.51.100.0/24", &[])],
                to_fqdns: vec![FqdnSelector::name("example.com")],
            },
            egress_to(vec![PolicyPort::tcp(25)], vec![block("198.51.100.0/24", &[])]),
        ];

        let rules = compile(&[p], &[], Some(&cache), &CompileOptions::default()).unwrap();
        assert_eq!(rules.egress.len(), 1);
        assert_eq!(rules.rejected.len(), 1);
        assert_eq!(rules.rejected[0].rule, "egress[0]");
        assert!(rules.fqdn_states.is_empty());
    }

    #[test]
    fn egress_outside_allowed_prefixes_is_rejected() {
        let mut p = policy("escape");
        p.egress = vec![egress_to(vec![], vec![block("0.0.0.0/0", &[])])];
        let options = CompileOptions {
            allowed_egress: Some(PrefixSet::parse(&["198.51.100.0/24"]).unwrap()),
            ..Default::default()
        };

        let rules = compile(&[p], &[], None, &options).unwrap();
        assert!(rules.egress.is_empty());
        assert_eq!(rules.rejected.len(), 1);
    }

    #[rstest]
    #[case(block("198.51.100.0/24", &["fd00::/8"]), "is not inside 198.51.100.0/24")]
    #[case(block("198.51.100.0/24", &["203.0.113.0/24"]), "is not inside 198.51.100.0/24")]
    #[case(block("203.0.113.0/24", &[]), "outside the allowed prefixes")]
    fn invalid_egress_rule_is_rejected_alone(#[case] to: IpBlock, #[case] reason: &str) {
        let mut p = policy("mixed");
        p.egress = vec![
            egress_to(vec![PolicyPort::tcp(443)], vec![to]),
            egress_to(vec![PolicyPort::tcp(80)], vec![block("198.51.100.0/24", &[])]),
        ];
        let options = CompileOptions {
            allowed_egress: Some(PrefixSet::parse(&["198.51.100.0/24"]).unwrap()),
            ..Default::default()
        };

        let rules = compile(&[p], &[], None, &options).unwrap();
        assert_eq!(
            rules.egress,
            vec![
                "ip saddr == @cluster_prefixes ip daddr { 198.51.100.0/24 } tcp dport { 80 } counter accept comment \"accept egress traffic for network policy mixed (tcp)\""
            ]
        );
        assert_eq!(rules.rejected.len(), 1);
        assert_eq!(rules.rejected[0].rule, "egress[0]");
        assert!(rules.rejected[0].reason.contains(reason), "{}", rules.rejected[0].reason);
    }

    #[test]
    fn cross_family_except_never_opens_the_other_family() {
        let mut p = policy("ssh");
        p.ingress = vec![ingress(
            vec![PolicyPort::tcp(22)],
            vec![block("10.0.0.0/8", &["2001:db8::/32"])],
        )];

        let rules = compile_default(&[p]);
        assert!(rules.ingress.is_empty());
        assert_eq!(rules.rejected.len(), 1);
    }

    #[rstest]
    #[case::egress(false)]
    #[case::ingress(true)]
    fn missing_peers_with_allow_list_is_rejected(#[case] ingress_rule: bool) {
        let mut p = policy("open");
        let options = if ingress_rule {
            p.ingress = vec![ingress(vec![PolicyPort::tcp(443)], vec![])];
            CompileOptions {
                allowed_ingress: Some(PrefixSet::parse(&["10.0.0.0/8"]).unwrap()),
                ..Default::default()
            }
        } else {
            p.egress = vec![egress_to(vec![PolicyPort::tcp(443)], vec![])];
            CompileOptions {
                allowed_egress: Some(PrefixSet::parse(&["198.51.100.0/24"]).unwrap()),
                ..Default::default()
            }
        };

        let rules = compile(&[p], &[], None, &options).unwrap();
        assert!(rules.ingress.is_empty());
        assert!(rules.egress.is_empty());
        assert_eq!(rules.rejected.len(), 1);
        assert!(rules.rejected[0].reason.contains("any peer"));
    }

    fn service(service_type: ServiceType) -> Service {
        Service {
            name: "web".to_string(),
            namespace: "shop".to_string(),
            service_type,
            ports: vec![
                ServicePort {
                    protocol: Some(Protocol::Tcp),
                    port: 443,
                    node_port: Some(30443),
                },
                ServicePort {
                    protocol: None,
                    port: 80,
                    node_port: None,
                },
            ],
            load_balancer_ip: Some("203.0.113.10".to_string()),
            load_balancer_source_ranges: vec![],
            status: ServiceStatus {
                load_balancer: LoadBalancerStatus {
                    ingress: vec![LoadBalancerIngress {
                        ip: Some("203.0.113.11".to_string()),
                    }],
                },
            },
        }
    }

    #[test]
    fn load_balancer_service_targets_external_ips() {
        let mut svc = service(ServiceType::LoadBalancer);
        svc.load_balancer_source_ranges = vec!["192.0.2.0/24".to_string()];

        let rules = compile(&[], &[svc], None, &CompileOptions::default()).unwrap();
        assert_eq!(
            rules.ingress,
            vec![
                "ip saddr { 192.0.2.0/24 } ip daddr { 203.0.113.10/32, 203.0.113.11/32 } tcp dport { 80, 443 } counter accept comment \"accept traffic for service shop/web (tcp)\""
            ]
        );
    }

    #[test]
    fn node_port_service_uses_node_ports() {
        let rules = compile(&[], &[service(ServiceType::NodePort)], None, &CompileOptions::default())
            .unwrap();
        assert_eq!(
            rules.ingress,
            vec!["tcp dport { 80, 30443 } counter accept comment \"accept traffic for service shop/web (tcp)\""]
        );
    }

    #[rstest]
    #[case(ServiceType::ClusterIP)]
    #[case(ServiceType::ExternalName)]
    fn internal_services_yield_no_rules(#[case] service_type: ServiceType) {
        let rules = compile(&[], &[service(service_type)], None, &CompileOptions::default()).unwrap();
        assert!(rules.ingress.is_empty());
        assert!(rules.egress.is_empty());
    }

    #[test]
    fn service_source_outside_allowed_ingress_is_rejected() {
        let mut svc = service(ServiceType::LoadBalancer);
        svc.load_balancer_source_ranges = vec!["0.0.0.0/0".to_string()];
        let options = CompileOptions {
            allowed_ingress: Some(PrefixSet::parse(&["192.0.2.0/24"]).unwrap()),
            ..Default::default()
        };

        let rules = compile(&[], &[svc], None, &options).unwrap();
        assert!(rules.ingress.is_empty());
        assert_eq!(rules.rejected[0].object, "shop/web");
    }

    #[test]
    fn load_balancer_without_address_yields_no_rules() {
        let mut svc = service(ServiceType::LoadBalancer);
        svc.load_balancer_ip = None;
        svc.status = ServiceStatus::default();

        let rules = compile(&[], &[svc], None, &CompileOptions::default()).unwrap();
        assert!(rules.ingress.is_empty());
        assert!(rules.rejected.is_empty());
    }
}

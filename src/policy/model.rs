// Policy and service objects consumed by the rule compiler
use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::net::{FqdnSelector, IpSet};

/// Per-selector sets backing a policy's FQDN rules, published as policy status
pub type FqdnState = BTreeMap<String, Vec<IpSet>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port selector of a policy rule; no port means every port of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPort {
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub end_port: Option<u16>,
}

impl PolicyPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Some(Protocol::Tcp),
            port: Some(port),
            end_port: None,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            protocol: Some(Protocol::Udp),
            port: Some(port),
            end_port: None,
        }
    }
}

/// CIDR peer with optional excluded sub-ranges
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpBlock {
    pub cidr: String,
    #[serde(default)]
    pub except: Vec<String>,
}

impl IpBlock {
    pub fn new(cidr: impl Into<String>) -> Self {
        Self {
            cidr: cidr.into(),
            except: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default)]
    pub ports: Vec<PolicyPort>,
    #[serde(default)]
    pub from: Vec<IpBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressRule {
    #[serde(default)]
    pub ports: Vec<PolicyPort>,
    #[serde(default)]
    pub to: Vec<IpBlock>,
    #[serde(default, rename = "toFQDNs")]
    pub to_fqdns: Vec<FqdnSelector>,
}

/// Cluster-wide network policy
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterwideNetworkPolicy {
    pub name: String,
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    #[serde(default)]
    pub egress: Vec<EgressRule>,
}

impl ClusterwideNetworkPolicy {
    pub fn has_fqdn_rules(&self) -> bool {
        self.egress.iter().any(|rule| !rule.to_fqdns.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub protocol: Option<Protocol>,
    pub port: u16,
    #[serde(default)]
    pub node_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct LoadBalancerIngress {
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<LoadBalancerIngress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    #[serde(default)]
    pub load_balancer: LoadBalancerStatus,
}

/// Service exposure; only LoadBalancer and NodePort services produce rules
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "type", default)]
    pub service_type: ServiceType,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(rename = "loadBalancerIP", default)]
    pub load_balancer_ip: Option<String>,
    #[serde(default)]
    pub load_balancer_source_ranges: Vec<String>,
    #[serde(default)]
    pub status: ServiceStatus,
}

impl Service {
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// Externally assigned addresses, the configured IP first
    pub fn external_ips(&self) -> Vec<String> {
        self.load_balancer_ip
            .iter()
            .chain(
                self.status
                    .load_balancer
                    .ingress
                    .iter()
                    .filter_map(|ingress| ingress.ip.as_ref()),
            )
            .filter(|ip| !ip.is_empty())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_deserializes_from_toml() {
        let policy: ClusterwideNetworkPolicy = toml::from_str(
            r#"
name = "allow-web"

[[ingress]]
ports = [{ protocol = "TCP", port = 443 }, { port = 80 }]
from = [{ cidr = "10.0.0.0/8", except = ["10.1.0.0/16"] }]

[[egress]]
ports = [{ protocol = "UDP", port = 53 }]
toFQDNs = [{ matchName = "example.com" }, { matchPattern = "*.example.org" }]
"#,
        )
        .unwrap();

        assert_eq!(policy.name, "allow-web");
        assert_eq!(policy.ingress[0].ports[0], PolicyPort::tcp(443));
        assert_eq!(policy.ingress[0].ports[1].protocol, None);
        assert_eq!(policy.ingress[0].from[0].except, vec!["10.1.0.0/16"]);
        assert_eq!(policy.egress[0].to_fqdns[1], FqdnSelector::pattern("*.example.org"));
        assert!(policy.has_fqdn_rules());
    }

    #[test]
    fn service_deserializes_from_toml() {
        let service: Service = toml::from_str(
            r#"
name = "web"
namespace = "shop"
type = "LoadBalancer"
loadBalancerIP = "203.0.113.10"
loadBalancerSourceRanges = ["192.0.2.0/24"]
ports = [{ protocol = "TCP", port = 443, nodePort = 30443 }]

[status.loadBalancer]
ingress = [{ ip = "203.0.113.11" }, {}]
"#,
        )
        .unwrap();

        assert_eq!(service.service_type, ServiceType::LoadBalancer);
        assert_eq!(service.qualified_name(), "shop/web");
        assert_eq!(service.external_ips(), vec!["203.0.113.10", "203.0.113.11"]);
        assert_eq!(service.ports[0].node_port, Some(30443));
    }
}

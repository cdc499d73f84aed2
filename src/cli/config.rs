use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::NftwallError,
    net::{DnsProxyConfig, PrefixSet, proxy::DEFAULT_DNS_PORT},
    policy::CompileOptions,
    render::{RateLimit, Snat, validate::DEFAULT_NFT_BINARY},
};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Run the DNS proxy and resolve FQDN egress rules
    pub enabled: bool,
    pub listen: IpAddr,
    pub port: u16,
    /// Upstream resolver; taken from the system resolver configuration when unset
    pub upstream: Option<SocketAddr>,
    pub query_timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_DNS_PORT,
            upstream: None,
            query_timeout_secs: 5,
        }
    }
}

impl DnsConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    pub fn proxy_config(&self) -> DnsProxyConfig {
        DnsProxyConfig {
            listen: self.listen_addr(),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Rendered ruleset location
    pub ruleset_path: PathBuf,
    pub nft_binary: PathBuf,
    /// Prefixes of the cluster; egress rules only match traffic from these
    pub internal_prefixes: Vec<String>,
    /// Allowed ingress sources; unset allows any source
    pub allowed_ingress: Option<Vec<String>>,
    /// Allowed egress destinations; unset allows any destination
    pub allowed_egress: Option<Vec<String>>,
    pub log_accepted_connections: bool,
    pub rate_limits: Vec<RateLimit>,
    pub snat: Vec<Snat>,
    pub reconcile_interval_secs: u64,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            ruleset_path: PathBuf::from("/etc/nftables/nftwall.nft"),
            nft_binary: PathBuf::from(DEFAULT_NFT_BINARY),
            internal_prefixes: Vec::new(),
            allowed_ingress: None,
            allowed_egress: None,
            log_accepted_connections: false,
            rate_limits: Vec::new(),
            snat: Vec::new(),
            reconcile_interval_secs: 10,
        }
    }
}

impl FirewallConfig {
    pub fn compile_options(&self) -> Result<CompileOptions, NftwallError> {
        Ok(CompileOptions {
            allowed_ingress: self
                .allowed_ingress
                .as_deref()
                .map(PrefixSet::parse)
                .transpose()?,
            allowed_egress: self
                .allowed_egress
                .as_deref()
                .map(PrefixSet::parse)
                .transpose()?,
            log_accepted_connections: self.log_accepted_connections,
        })
    }

    pub fn cluster_prefixes(&self) -> Result<PrefixSet, NftwallError> {
        PrefixSet::parse(&self.internal_prefixes)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Policy and service snapshot (TOML)
    pub snapshot: PathBuf,
    /// Persisted FQDN state (JSON), restored on start-up
    pub state: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            snapshot: PathBuf::from("/etc/nftwall/snapshot.toml"),
            state: PathBuf::from("/var/lib/nftwall/fqdn-state.json"),
        }
    }
}

impl ConfigFile {
    /// Load configuration file
    pub fn load(path: &Path) -> Result<Self, NftwallError> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| NftwallError::ConfigParse {
            path: PathBuf::from(path),
            source,
        })
    }
}

pub mod validate;

use std::{
    collections::BTreeMap,
    ffi::OsString,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use validate::{NftValidator, RulesetValidator};

use crate::{
    error::NftwallError,
    net::{
        IpSet, IpVersion, PrefixSet,
        prefix::join_prefixes,
    },
};

const TEMPLATE_NAME: &str = "nftables";

/// Ingress bandwidth cap for one interface
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimit {
    pub interface: String,
    /// Megabits per second
    pub rate_mbps: u32,
}

/// Source NAT for traffic leaving `out_interface`; masquerade unless `to` is set
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Snat {
    pub out_interface: String,
    pub source_prefixes: Vec<String>,
    #[serde(default)]
    pub to: Option<IpAddr>,
}

/// Everything the ruleset template needs
#[derive(Debug, Clone, Default)]
pub struct RenderInput {
    pub ingress: Vec<String>,
    pub egress: Vec<String>,
    pub dns_sets: Vec<IpSet>,
    pub cluster_prefixes: PrefixSet,
    pub rate_limits: Vec<RateLimit>,
    pub snat: Vec<Snat>,
    /// Address the DNS proxy listens on; accepted on the input chain
    pub dns_proxy: Option<SocketAddr>,
}

#[derive(Serialize)]
struct TemplateData<'a> {
    ingress: &'a [String],
    egress: &'a [String],
    dns_sets: Vec<SetData>,
    cluster_prefixes_v4: String,
    cluster_prefixes_v6: String,
    rate_limits: &'a [RateLimit],
    snat: Vec<SnatData>,
    dns_proxy: Option<DnsProxyData>,
}

#[derive(Serialize)]
struct SetData {
    name: String,
    set_type: &'static str,
    fqdn: String,
    elements: String,
}

#[derive(Serialize)]
struct SnatData {
    out_interface: String,
    family: &'static str,
    sources: String,
    action: String,
}

#[derive(Serialize)]
struct DnsProxyData {
    /// Destination match including a trailing space, empty for a wildcard listener
    daddr: String,
    port: u16,
}

/// Renders compiled rules into an nftables ruleset
pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    pub fn new() -> Result<Self, NftwallError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_template_string(
            TEMPLATE_NAME,
            include_str!("../../templates/nftables.hbs"),
        )?;
        Ok(Self { registry })
    }

    /// Render the full ruleset text
    ///
    /// Output only depends on the content of `input`, so identical input
    /// always yields byte-identical text.
    pub fn render(&self, input: &RenderInput) -> Result<String, NftwallError> {
        let data = TemplateData {
            ingress: &input.ingress,
            egress: &input.egress,
            dns_sets: dns_sets(&input.dns_sets),
            cluster_prefixes_v4: join_prefixes(&input.cluster_prefixes.by_version(IpVersion::V4)),
            cluster_prefixes_v6: join_prefixes(&input.cluster_prefixes.by_version(IpVersion::V6)),
            rate_limits: &input.rate_limits,
            snat: snat_rules(&input.snat)?,
            dns_proxy: input.dns_proxy.map(dns_proxy),
        };
        Ok(self.registry.render(TEMPLATE_NAME, &data)?)
    }

    /// Replace the ruleset at `path` with `text` if its content differs
    ///
    /// The new text is written next to the active file as `<path>.new`,
    /// checked by `validator` and then renamed over `path`. A ruleset that
    /// fails validation never becomes active. Returns whether `path` changed.
    pub async fn write_if_changed(
        path: &Path,
        text: &str,
        validator: &dyn RulesetValidator,
    ) -> Result<bool, NftwallError> {
        let active = match tokio::fs::read(path).await {
            Ok(bytes) => Some(content_hash(&bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        if active.as_deref() == Some(content_hash(text.as_bytes()).as_str()) {
            log::debug!("Ruleset {} is up to date", path.display());
            return Ok(false);
        }

        let staged = staged_path(path);
        tokio::fs::write(&staged, text).await?;
        if let Err(err) = validator.validate(&staged).await {
            let _ = tokio::fs::remove_file(&staged).await.inspect_err(|remove_err| {
                log::warn!("Failed to remove {}: {remove_err}", staged.display());
            });
            return Err(err);
        }
        tokio::fs::rename(&staged, path).await?;

        log::info!("Ruleset {} updated", path.display());
        Ok(true)
    }
}

/// Hex encoded SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn staged_path(path: &Path) -> PathBuf {
    let mut staged = OsString::from(path.as_os_str());
    staged.push(".new");
    PathBuf::from(staged)
}

fn dns_sets(sets: &[IpSet]) -> Vec<SetData> {
    let mut by_name: BTreeMap<&str, &IpSet> = BTreeMap::new();
    for set in sets {
        by_name.entry(set.set_name.as_str()).or_insert(set);
    }
    by_name
        .into_values()
        .map(|set| {
            let mut ips = set.ips.clone();
            ips.sort();
            ips.dedup();
            SetData {
                name: set.set_name.clone(),
                set_type: set.version.set_type(),
                fqdn: set.fqdn.clone(),
                elements: ips
                    .iter()
                    .map(IpAddr::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        })
        .collect()
}

/// One NAT rule per configured entry and address family of its sources
fn snat_rules(entries: &[Snat]) -> Result<Vec<SnatData>, NftwallError> {
    let mut rules = Vec::new();
    for entry in entries {
        let sources = PrefixSet::parse(&entry.source_prefixes)?;
        for version in [IpVersion::V4, IpVersion::V6] {
            if let Some(to) = entry.to
                && IpVersion::of(&to) != version
            {
                continue;
            }
            let nets = sources.by_version(version);
            if nets.is_empty() {
                continue;
            }
            let action = match entry.to {
                Some(to) => format!("snat {} to {to}", version.family()),
                None => "masquerade".to_string(),
            };
            rules.push(SnatData {
                out_interface: entry.out_interface.clone(),
                family: version.family(),
                sources: join_prefixes(&nets),
                action,
            });
        }
    }
    Ok(rules)
}

fn dns_proxy(addr: SocketAddr) -> DnsProxyData {
    let daddr = if addr.ip().is_unspecified() {
        String::new()
    } else {
        format!("{} daddr {} ", IpVersion::of(&addr.ip()).family(), addr.ip())
    };
    DnsProxyData {
        daddr,
        port: addr.port(),
    }
}

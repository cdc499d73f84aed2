use thiserror::Error;

use std::{net::SocketAddr, path::PathBuf};

use hickory_resolver::ResolveError;

#[derive(Debug, Error)]
pub enum NftwallError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse snapshot {path}: {source}")]
    SnapshotParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse FQDN state {path}: {source}")]
    StateParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode FQDN state: {source}")]
    StateEncode {
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to initialize DNS resolver: {source}")]
    DnsResolverInit {
        #[source]
        source: ResolveError,
    },

    #[error("no usable nameserver found in system resolver configuration")]
    NoNameserver,

    #[error("failed to bind DNS proxy on {addr}: {source}")]
    DnsBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("DNS upstream {upstream} failed: {source}")]
    DnsUpstream {
        upstream: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("DNS upstream {upstream} did not answer in time")]
    DnsTimeout { upstream: SocketAddr },

    #[error("malformed DNS response: {reason}")]
    MalformedResponse { reason: String },

    #[error("invalid CIDR '{entry}': {reason}")]
    InvalidCidr { entry: String, reason: String },

    #[error("invalid FQDN selector: {reason}")]
    InvalidSelector { reason: String },

    #[error("invalid FQDN pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to register ruleset template: {0}")]
    Template(#[from] handlebars::TemplateError),

    #[error("failed to render ruleset: {0}")]
    Render(#[from] handlebars::RenderError),

    #[error("ruleset {path} failed validation: {stderr}")]
    InvalidRuleset { path: PathBuf, stderr: String },

    #[error("command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("policy {policy} has FQDN egress rules but no DNS cache is available")]
    FqdnCacheUnavailable { policy: String },
}

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::{config::ResolverConfig, system_conf};

use crate::error::NftwallError;

/// Pick the upstream resolver from the system resolver configuration
///
/// Used when no upstream is configured explicitly. Loopback nameservers are
/// skipped when `skip_loopback` is set, since on a firewall node the local
/// stub resolver is usually the proxy itself or forwards back to it.
///
/// # Examples
/// ```no_run
/// use nftwall::net::system_upstream;
///
/// let upstream = system_upstream(true).unwrap();
/// println!("forwarding DNS to {upstream}");
/// ```
pub fn system_upstream(skip_loopback: bool) -> Result<SocketAddr, NftwallError> {
    let config = system_conf::read_system_conf()
        .map_err(|source| NftwallError::DnsResolverInit { source })?
        .0;
    first_nameserver(&config, skip_loopback).ok_or(NftwallError::NoNameserver)
}

/// First nameserver of the configuration, IPv4 preferred
fn first_nameserver(config: &ResolverConfig, skip_loopback: bool) -> Option<SocketAddr> {
    let candidates: Vec<SocketAddr> = config
        .name_servers()
        .iter()
        .map(|ns| ns.socket_addr)
        .filter(|addr| !(skip_loopback && addr.ip().is_loopback()))
        .collect();

    candidates
        .iter()
        .find(|addr| matches!(addr.ip(), IpAddr::V4(_)))
        .or_else(|| candidates.first())
        .copied()
}

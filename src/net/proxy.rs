use std::{
    io::ErrorKind,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use hickory_proto::op::Message;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    task::{JoinHandle, JoinSet},
};

use super::cache::FqdnCache;
use crate::{error::NftwallError, runtime::ShutdownSignal};

pub const DEFAULT_DNS_PORT: u16 = 53;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest DNS message a UDP datagram can carry
const MAX_UDP_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsProxyConfig {
    /// Address the UDP socket and TCP listener bind to
    pub listen: SocketAddr,
    /// Upper bound for one upstream round trip and for an idle TCP client
    pub query_timeout: Duration,
}

impl Default for DnsProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_DNS_PORT)),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// DNS forwarder that feeds every answer it relays into the FQDN cache
pub struct DnsProxy {
    config: DnsProxyConfig,
    cache: Arc<dyn FqdnCache>,
}

/// Running proxy; dropping the handle leaves the listeners running until `stop`
pub struct DnsProxyHandle {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    cache: Arc<dyn FqdnCache>,
    shutdown: Arc<ShutdownSignal>,
    udp_task: JoinHandle<()>,
    tcp_task: JoinHandle<()>,
}

impl DnsProxy {
    pub fn new(config: DnsProxyConfig, cache: Arc<dyn FqdnCache>) -> Self {
        Self { config, cache }
    }

    /// Bind both transports and start serving
    ///
    /// A bind failure on either transport is returned as `DnsBind`; nothing
    /// is left running in that case.
    pub async fn start(self) -> Result<DnsProxyHandle, NftwallError> {
        let listen = self.config.listen;
        let bind_error = |source| NftwallError::DnsBind {
            addr: listen,
            source,
        };

        let udp = UdpSocket::bind(listen).await.map_err(bind_error)?;
        let tcp = TcpListener::bind(listen).await.map_err(bind_error)?;
        let udp_addr = udp.local_addr()?;
        let tcp_addr = tcp.local_addr()?;
        log::info!("DNS proxy listening on {udp_addr} (udp) and {tcp_addr} (tcp)");

        let shutdown = ShutdownSignal::new();
        let udp_task = tokio::spawn(serve_udp(
            Arc::new(udp),
            Arc::clone(&self.cache),
            self.config.query_timeout,
            Arc::clone(&shutdown),
        ));
        let tcp_task = tokio::spawn(serve_tcp(
            tcp,
            Arc::clone(&self.cache),
            self.config.query_timeout,
            Arc::clone(&shutdown),
        ));

        Ok(DnsProxyHandle {
            udp_addr,
            tcp_addr,
            cache: self.cache,
            shutdown,
            udp_task,
            tcp_task,
        })
    }
}

impl DnsProxyHandle {
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Change the forward target; queries already in flight keep the old one
    pub fn update_dns_server_addr(&self, addr: SocketAddr) {
        self.cache.update_dns_server_addr(addr);
    }

    /// Stop accepting queries and wait for in-flight ones to finish
    pub async fn stop(self) {
        self.shutdown.shutdown();
        for (transport, task) in [("udp", self.udp_task), ("tcp", self.tcp_task)] {
            if let Err(err) = task.await {
                log::error!("DNS proxy {transport} loop terminated abnormally: {err}");
            }
        }
        log::info!("DNS proxy stopped");
    }
}

async fn serve_udp(
    socket: Arc<UdpSocket>,
    cache: Arc<dyn FqdnCache>,
    query_timeout: Duration,
    shutdown: Arc<ShutdownSignal>,
) {
    let mut in_flight = JoinSet::new();
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.wait() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(err) => {
                    log::warn!("DNS proxy failed to receive UDP datagram: {err}");
                    continue;
                }
            },
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
        };

        let query = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        let cache = Arc::clone(&cache);
        in_flight.spawn(async move {
            let upstream = cache.dns_server_addr();
            match forward_udp(upstream, &query, query_timeout).await {
                Ok(response) => {
                    observe(cache.as_ref(), &response);
                    if let Err(err) = socket.send_to(&response, peer).await {
                        log::warn!("DNS proxy failed to answer {peer}: {err}");
                    }
                }
                Err(err) => log::warn!("DNS query from {peer} failed: {err}"),
            }
        });
    }

    while in_flight.join_next().await.is_some() {}
    log::debug!("DNS proxy UDP loop exited");
}

async fn serve_tcp(
    listener: TcpListener,
    cache: Arc<dyn FqdnCache>,
    query_timeout: Duration,
    shutdown: Arc<ShutdownSignal>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("DNS proxy failed to accept TCP connection: {err}");
                    continue;
                }
            },
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
        };

        let cache = Arc::clone(&cache);
        let shutdown = Arc::clone(&shutdown);
        in_flight.spawn(async move {
            if let Err(err) = serve_tcp_connection(stream, cache, query_timeout, shutdown).await {
                log::warn!("DNS query over TCP from {peer} failed: {err}");
            }
        });
    }

    drop(listener);
    while in_flight.join_next().await.is_some() {}
    log::debug!("DNS proxy TCP loop exited");
}

/// Relay length-prefixed queries on one client connection until it closes or idles out
async fn serve_tcp_connection(
    mut stream: TcpStream,
    cache: Arc<dyn FqdnCache>,
    query_timeout: Duration,
    shutdown: Arc<ShutdownSignal>,
) -> Result<(), NftwallError> {
    loop {
        if shutdown.is_shutdown() {
            return Ok(());
        }

        let query = match tokio::time::timeout(query_timeout, read_frame(&mut stream)).await {
            Err(_) | Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(query))) => query,
            Ok(Err(err)) => return Err(err.into()),
        };

        let upstream = cache.dns_server_addr();
        let response = forward_tcp(upstream, &query, query_timeout).await?;
        observe(cache.as_ref(), &response);
        write_frame(&mut stream, &response).await?;
    }
}

async fn forward_udp(
    upstream: SocketAddr,
    query: &[u8],
    query_timeout: Duration,
) -> Result<Vec<u8>, NftwallError> {
    let upstream_error = |source| NftwallError::DnsUpstream { upstream, source };

    let socket = UdpSocket::bind(unspecified_for(upstream))
        .await
        .map_err(upstream_error)?;
    socket.connect(upstream).await.map_err(upstream_error)?;
    socket.send(query).await.map_err(upstream_error)?;

    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    let len = tokio::time::timeout(query_timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| NftwallError::DnsTimeout { upstream })?
        .map_err(upstream_error)?;
    buf.truncate(len);
    Ok(buf)
}

async fn forward_tcp(
    upstream: SocketAddr,
    query: &[u8],
    query_timeout: Duration,
) -> Result<Vec<u8>, NftwallError> {
    let exchange = async {
        let mut stream = TcpStream::connect(upstream).await?;
        write_frame(&mut stream, query).await?;
        read_frame(&mut stream)
            .await?
            .ok_or_else(|| std::io::Error::from(ErrorKind::UnexpectedEof))
    };

    tokio::time::timeout(query_timeout, exchange)
        .await
        .map_err(|_| NftwallError::DnsTimeout { upstream })?
        .map_err(|source| NftwallError::DnsUpstream { upstream, source })
}

/// Read one 2-byte length-prefixed DNS message; `None` on a clean close
async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let len = match stream.read_u16().await {
        Ok(len) => usize::from(len),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(Some(message))
}

async fn write_frame(stream: &mut TcpStream, message: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(message.len())
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "DNS message too large"))?;
    stream.write_u16(len).await?;
    stream.write_all(message).await?;
    stream.flush().await
}

fn unspecified_for(upstream: SocketAddr) -> SocketAddr {
    match upstream {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

/// Feed an upstream answer into the cache; the bytes are relayed regardless
fn observe(cache: &dyn FqdnCache, response: &[u8]) {
    let message = match Message::from_vec(response) {
        Ok(message) => message,
        Err(err) => {
            log::debug!("Not caching unparseable DNS response: {err}");
            return;
        }
    };

    match cache.update(Utc::now(), &message) {
        Ok(true) => log::debug!("DNS cache changed after answer {}", message.id()),
        Ok(false) => {}
        Err(err) => log::debug!("DNS answer {} not cached: {err}", message.id()),
    }
}

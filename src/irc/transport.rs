/// Connection establishment: plain TCP or TLS to one of a network's hosts.
///
/// The connection task only sees an [`IrcStream`], so tests can hand it an
/// in-memory duplex pipe through their own [`Connector`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::NetworkConfig;

/// Combined async read+write trait for type-erased transport streams.
pub trait IrcTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IrcTransport for T {}

/// A connected stream suitable for framing with `IrcCodec`.
pub type IrcStream = Box<dyn IrcTransport>;

/// Where a single attempt should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub local_address: Option<IpAddr>,
}

impl ConnectTarget {
    /// Pick a host at random among the network's domain and its
    /// additional addresses.
    pub fn for_network(network: &NetworkConfig, local_address: Option<IpAddr>) -> Self {
        let mut hosts: Vec<&str> = vec![network.domain.as_str()];
        hosts.extend(network.additional_addresses.iter().map(String::as_str));
        let host = hosts
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(network.domain.as_str());
        Self {
            host: host.to_owned(),
            port: network.port,
            tls: network.tls,
            local_address: local_address.or(network.local_address),
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> io::Result<IrcStream>;
}

/// Real network connector.
pub struct TcpConnector {
    tls: TlsConnector,
}

impl TcpConnector {
    /// Trust the bundled web PKI roots, plus any extra PEM bundles.
    pub fn new(ca_files: &[PathBuf]) -> io::Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for path in ca_files {
            let pem = std::fs::read(path)?;
            for cert in rustls_pemfile::certs(&mut &pem[..]) {
                roots
                    .add(cert?)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &ConnectTarget) -> io::Result<IrcStream> {
        let addr = resolve(target).await?;
        debug!(host = %target.host, ?addr, "transport: connecting via TCP");
        let stream = match target.local_address {
            Some(local) => {
                let socket = if addr.is_ipv6() {
                    TcpSocket::new_v6()?
                } else {
                    TcpSocket::new_v4()?
                };
                socket.bind(SocketAddr::new(local, 0))?;
                socket.connect(addr).await?
            }
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;

        if !target.tls {
            return Ok(Box::new(stream));
        }

        let name = ServerName::try_from(target.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = self.tls.connect(name, stream).await?;
        info!(host = %target.host, "transport: TLS established");
        Ok(Box::new(tls))
    }
}

/// Resolve, preferring an address family that matches the bind address.
async fn resolve(target: &ConnectTarget) -> io::Result<SocketAddr> {
    let cleaned = target.host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = cleaned.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, target.port));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((cleaned, target.port))
        .await?
        .collect();
    let wanted_v6 = target.local_address.map(|a| a.is_ipv6());
    addrs
        .iter()
        .find(|a| wanted_v6.map_or(true, |v6| a.is_ipv6() == v6))
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no addresses found for {}", target.host),
            )
        })
}

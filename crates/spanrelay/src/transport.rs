//! Agent transports: UDP datagrams and HTTP posts.
//!
//! A UDP transport writes exactly one serialized batch per datagram; an HTTP
//! transport posts one binary body per batch. Which one a collector uses is
//! decided by the destination address scheme.

use std::net::{SocketAddr, ToSocketAddrs};

use async_trait::async_trait;
use socket2::{Domain, Type};
use tokio::net::UdpSocket;
use tracing::debug;
use url::Url;

use crate::error::{RelayError, Result};

/// Content type of a thrift-encoded HTTP body.
const THRIFT_CONTENT_TYPE: &str = "application/x-thrift";

/// The transport family a destination address selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Datagram transport to a `host:port` agent endpoint.
    Udp,
    /// HTTP post to a collector URL.
    Http,
}

/// Picks the transport family for a destination address.
///
/// An address that parses as a URL whose scheme contains "http" selects
/// HTTP; everything else is treated as a UDP `host:port` endpoint.
pub fn detect_transport(addr: &str) -> TransportKind {
    if let Ok(url) = Url::parse(addr) {
        if url.scheme().contains("http") {
            return TransportKind::Http;
        }
    }
    TransportKind::Udp
}

/// A one-way pipe carrying serialized batches to a single agent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one serialized batch.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Releases the underlying resources. Sends after close are undefined.
    fn close(&self);
}

/// Datagram transport to a Jaeger agent.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Dials `agent_addr` and sizes the socket's write buffer to the packet
    /// budget.
    ///
    /// Must be called within a tokio runtime. Failures surface here rather
    /// than at send time so misconfiguration is visible at registration.
    pub fn open(agent_addr: &str, max_packet_size: usize) -> Result<Self> {
        let remote: SocketAddr = agent_addr
            .to_socket_addrs()
            .map_err(|e| RelayError::TransportOpen {
                addr: agent_addr.to_owned(),
                source: e,
            })?
            .next()
            .ok_or_else(|| RelayError::InvalidAgentAddr {
                addr: agent_addr.to_owned(),
                reason: "address resolved to nothing".to_owned(),
            })?;

        let open = || -> std::io::Result<UdpSocket> {
            let socket = socket2::Socket::new(Domain::for_address(remote), Type::DGRAM, None)?;
            socket.set_send_buffer_size(max_packet_size)?;
            socket.connect(&remote.into())?;
            let std_sock: std::net::UdpSocket = socket.into();
            std_sock.set_nonblocking(true)?;
            UdpSocket::from_std(std_sock)
        };
        let socket = open().map_err(|e| RelayError::TransportOpen {
            addr: agent_addr.to_owned(),
            source: e,
        })?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.socket.send(payload).await?;
        Ok(())
    }

    fn close(&self) {
        // The socket is released when the transport drops.
    }
}

/// HTTP transport posting batches to a collector endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    /// Builds a client for the collector URL.
    pub fn open(agent_addr: &str) -> Result<Self> {
        let endpoint = Url::parse(agent_addr).map_err(|e| RelayError::InvalidAgentAddr {
            addr: agent_addr.to_owned(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, THRIFT_CONTENT_TYPE)
            .body(payload.to_vec())
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            debug!(status = status.as_u16(), "agent rejected batch");
            return Err(RelayError::HttpStatus {
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    fn close(&self) {
        // reqwest clients hold no per-destination state worth tearing down.
    }
}

// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The dial handler capability: how the upstream reaches its endpoint without doing any
//! name resolution of its own.

use async_trait::async_trait;
use std::{io, net::SocketAddr};
use tokio::net::{lookup_host, TcpStream, UdpSocket};

/// The transport-layer network a dial handler is asked to open.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Network {
    /// Stream-oriented, used by the TLS handshake and HTTP/2.
    Tcp,
    /// Datagram-oriented, used by QUIC and HTTP/3.
    Udp,
}

/// A connection opened by a dial handler.
pub enum DialedConn {
    /// An established TCP stream.
    Tcp(TcpStream),
    /// A connected UDP socket.
    Udp(UdpSocket),
}

impl DialedConn {
    /// The remote address this connection is bound for.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.peer_addr(),
            Self::Udp(socket) => socket.peer_addr(),
        }
    }
}

/// The capability that opens a transport-layer connection to the upstream endpoint.
/// It owns bootstrap name resolution, so the upstream itself never issues DNS queries
/// to resolve its own server.
#[async_trait]
pub trait DialHandler: Send + Sync {
    /// Open a connection to the endpoint this handler was configured for.
    async fn dial(&self, network: Network) -> io::Result<DialedConn>;
}

/// The default dial handler: resolve the endpoint with the system stub resolver and
/// connect to the first address it yields.
pub struct BootstrapDialer {
    domain: String,
    port: u16,
}

impl BootstrapDialer {
    /// Create a dialer for `domain:port`.
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            port,
        }
    }

    async fn resolve(&self) -> io::Result<SocketAddr> {
        lookup_host((self.domain.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))
    }
}

#[async_trait]
impl DialHandler for BootstrapDialer {
    async fn dial(&self, network: Network) -> io::Result<DialedConn> {
        let addr = self.resolve().await?;
        Ok(match network {
            Network::Tcp => DialedConn::Tcp(TcpStream::connect(addr).await?),
            Network::Udp => {
                let socket = UdpSocket::bind(bind_addr(addr.is_ipv4())).await?;
                socket.connect(addr).await?;
                DialedConn::Udp(socket)
            }
        })
    }
}

fn bind_addr(is_ipv4: bool) -> SocketAddr {
    if is_ipv4 {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    }
}

#[cfg(test)]
mod tests {
    use super::{BootstrapDialer, DialHandler, DialedConn, Network};
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn udp_dial_connects_to_endpoint() {
        let endpoint = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = endpoint.local_addr().unwrap();

        let dialer = BootstrapDialer::new("127.0.0.1", addr.port());
        let conn = dialer.dial(Network::Udp).await.unwrap();
        assert_eq!(conn.peer_addr().unwrap(), addr);
        assert!(matches!(conn, DialedConn::Udp(_)));
    }
}

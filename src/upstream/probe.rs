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

use super::{
    dial::{DialHandler, DialedConn, Network},
    options::HttpVersion,
    quic,
    tls::TlsTemplate,
};
use crate::error::{Result, UpstreamError};
use log::warn;
use quinn::{Endpoint, EndpointConfig, TokioRuntime};
use socket2::{Socket, TcpKeepalive};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::oneshot, time::timeout};
use tokio_rustls::TlsConnector;

// Dials and probes fall back to this bound when no per-request timeout is configured.
pub(super) const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Decide whether HTTP/3 is preferable to HTTP/2 for this upstream right now by racing a
/// QUIC handshake against a TLS one. Returns the UDP endpoint address to build the HTTP/3
/// transport against, or an error when HTTP/2 should be used instead.
pub(super) async fn probe_h3(
    dialer: &Arc<dyn DialHandler>,
    versions: &[HttpVersion],
    tls: &TlsTemplate,
    server_name: &str,
    probe_timeout: Option<Duration>,
) -> Result<SocketAddr> {
    if !versions.contains(&HttpVersion::H3) {
        return Err(UpstreamError::H3Disabled);
    }

    // Resolve the UDP endpoint once; the socket itself is closed right away.
    let conn = dialer.dial(Network::Udp).await?;
    let addr = conn.peer_addr()?;
    drop(conn);

    // HTTP/3 being the only choice, there is nothing to race.
    if versions.len() == 1 {
        return Ok(addr);
    }

    let bound = probe_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT);

    let (quic_tx, mut quic_rx) = oneshot::channel();
    {
        let dialer = dialer.clone();
        let config = quic::probe_config(tls)?;
        let server_name = server_name.to_string();
        tokio::spawn(async move {
            let _ = quic_tx.send(quic_probe(dialer, config, addr, server_name, bound).await);
        });
    }

    let (tls_tx, mut tls_rx) = oneshot::channel();
    {
        let dialer = dialer.clone();
        let config = Arc::new(tls.probe_config(&tcp_alpn(versions))?);
        let server_name = server_name.to_string();
        tokio::spawn(async move {
            let _ = tls_tx.send(tls_probe(dialer, config, server_name, bound).await);
        });
    }

    // First probe to report decides. A failed TLS probe is inconclusive, so HTTP/3 stays
    // acceptable; a failed QUIC probe rules HTTP/3 out on its own.
    tokio::select! {
        quic_outcome = &mut quic_rx => match quic_outcome {
            Ok(Ok(())) => Ok(addr),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(UpstreamError::H3Disabled),
        },
        tls_outcome = &mut tls_rx => match tls_outcome {
            Ok(Ok(())) => Err(UpstreamError::TlsFaster),
            Ok(Err(e)) => {
                warn!("TLS probe to {} errored: {}", addr, e);
                Ok(addr)
            }
            Err(_) => Ok(addr),
        },
    }
}

// ALPN tokens for the TCP side of the race.
fn tcp_alpn(versions: &[HttpVersion]) -> Vec<Vec<u8>> {
    versions
        .iter()
        .filter(|v| **v != HttpVersion::H3)
        .map(|v| v.alpn().to_vec())
        .collect()
}

async fn quic_probe(
    dialer: Arc<dyn DialHandler>,
    config: quinn::ClientConfig,
    addr: SocketAddr,
    server_name: String,
    bound: Duration,
) -> Result<()> {
    let handshake = async move {
        let socket = match dialer.dial(Network::Udp).await? {
            DialedConn::Udp(socket) => socket,
            DialedConn::Tcp(_) => unreachable!(),
        };
        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            None,
            socket.into_std()?,
            Arc::new(TokioRuntime),
        )?;
        let connection = endpoint.connect_with(config, addr, &server_name)?.await?;
        connection.close(0u32.into(), b"");
        Ok(())
    };
    timeout(bound, handshake).await?
}

async fn tls_probe(
    dialer: Arc<dyn DialHandler>,
    config: Arc<rustls::ClientConfig>,
    server_name: String,
    bound: Duration,
) -> Result<()> {
    let handshake = async move {
        let stream = match dialer.dial(Network::Tcp).await? {
            DialedConn::Tcp(stream) => stream,
            DialedConn::Udp(_) => unreachable!(),
        };

        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(3));
        let socket: Socket = stream.into_std()?.into();
        socket.set_tcp_keepalive(&keepalive)?;
        let stream = TcpStream::from_std(socket.into())?;

        let domain = rustls::pki_types::ServerName::try_from(server_name).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid dnsname")
        })?;
        let stream = TlsConnector::from(config).connect(domain, stream).await?;
        drop(stream);
        Ok(())
    };
    timeout(bound, handshake).await?
}

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
    dial::{DialHandler, Network},
    h3::{H3Connector, H3Transport},
    options::{HttpVersion, Target},
    probe,
    quic::QuicTemplate,
    tls::TlsTemplate,
};
use crate::error::{Result, UpstreamError};
use log::debug;
use reqwest::Client;
use std::{net::SocketAddr, sync::Arc, time::Duration};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
// HTTP/2 multiplexes queries over one stream, so the pool stays small.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_IDLE_CONNS_PER_HOST: usize = 2;
const H2_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// The two client shapes an upstream may end up with. Which one is decided by the probe
/// at construction time and stays until the client is rebuilt.
#[derive(Clone)]
pub(super) enum HttpTransport {
    /// HTTP/2 (or HTTP/1.1) through reqwest.
    H2(Client),
    /// HTTP/3 through the QUIC wrapper.
    H3(Arc<H3Transport>),
}

/// Build a transport for the target: HTTP/3 when the probe prefers it, otherwise an
/// HTTP/2-capable client, otherwise nothing.
pub(super) async fn build(
    target: &Target,
    dialer: &Arc<dyn DialHandler>,
    tls: &Arc<TlsTemplate>,
    quic: &Arc<QuicTemplate>,
    timeout: Option<Duration>,
) -> Result<HttpTransport> {
    match probe::probe_h3(dialer, &target.versions, tls, &target.domain, timeout).await {
        Ok(remote) => {
            debug!("using HTTP/3 for {}", target.redacted);
            return Ok(HttpTransport::H3(Arc::new(H3Transport::new(H3Connector {
                dialer: dialer.clone(),
                remote,
                server_name: Arc::from(target.domain.as_str()),
                tls: tls.clone(),
                quic: quic.clone(),
            }))));
        }
        Err(e) => {
            debug!("not using HTTP/3 for {}: {}", target.redacted, e);
        }
    }

    if !target
        .versions
        .iter()
        .any(|v| matches!(v, HttpVersion::H2 | HttpVersion::Http11))
    {
        return Err(UpstreamError::NoSupportedHttpVersion);
    }

    // Pin the connection to the address the bootstrap resolved, so the HTTP client never
    // falls back to its own resolution.
    let conn = dialer.dial(Network::Udp).await?;
    let addr = conn.peer_addr()?;
    drop(conn);

    let alpn: Vec<Vec<u8>> = target
        .versions
        .iter()
        .filter(|v| **v != HttpVersion::H3)
        .map(|v| v.alpn().to_vec())
        .collect();

    let mut builder = Client::builder()
        // The port in socket addr doesn't take effect here per documentation
        .resolve(&target.domain, SocketAddr::new(addr.ip(), 0))
        .use_preconfigured_tls(tls.client_config(&alpn)?)
        .https_only(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_CONNS_PER_HOST)
        .http2_keep_alive_interval(H2_KEEP_ALIVE_INTERVAL)
        .http2_keep_alive_while_idle(true);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    debug!("using HTTP/2 for {}", target.redacted);
    Ok(HttpTransport::H2(builder.build()?))
}

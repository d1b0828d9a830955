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
    quic::{self, QuicTemplate},
    tls::TlsTemplate,
};
use crate::error::{Result, UpstreamError};
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::poll_fn;
use h3::client::SendRequest;
use h3_quinn::OpenStreams;
use http::{header::CONTENT_LENGTH, Request, StatusCode};
use log::debug;
use quinn::{Endpoint, EndpointConfig, TokioRuntime};
use std::{net::SocketAddr, str::FromStr, sync::Arc};
use tokio::sync::{mpsc, RwLock};

/// The HTTP/3 transport: one QUIC connection at a time, rebuilt on demand, safe to close.
pub(super) struct H3Transport {
    connector: H3Connector,
    state: RwLock<State>,
}

enum State {
    Open(Option<H3Conn>),
    Closed,
}

// Everything needed to (re)establish the underlying connection.
pub(super) struct H3Connector {
    pub dialer: Arc<dyn DialHandler>,
    pub remote: SocketAddr,
    pub server_name: Arc<str>,
    pub tls: Arc<TlsTemplate>,
    pub quic: Arc<QuicTemplate>,
}

#[derive(Clone)]
struct H3Conn {
    send_request: SendRequest<OpenStreams, Bytes>,
    shutdown_tx: mpsc::Sender<()>,
    endpoint: Endpoint,
}

impl H3Connector {
    async fn connect(&self) -> Result<H3Conn> {
        let socket = match self.dialer.dial(Network::Udp).await? {
            DialedConn::Udp(socket) => socket,
            DialedConn::Tcp(_) => unreachable!(),
        };
        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            None,
            socket.into_std()?,
            Arc::new(TokioRuntime),
        )?;

        let snapshot = self.quic.snapshot();
        let config = quic::client_config(&self.tls, &snapshot)?;
        let connecting = endpoint.connect_with(config, self.remote, &self.server_name)?;
        // Ride 0-RTT whenever a cached session allows it. A rejection means the cached
        // state is stale; the caller reacts by resetting the session store.
        let connection = match connecting.into_0rtt() {
            Ok((connection, accepted)) => {
                if !accepted.await {
                    return Err(UpstreamError::ZeroRttRejected);
                }
                connection
            }
            Err(connecting) => connecting.await?,
        };

        let (mut driver, send_request) = h3::client::new(h3_quinn::Connection::new(connection)).await?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let remote = self.remote;
        debug!("h3 connection is ready: {}", remote);
        tokio::spawn(async move {
            tokio::select! {
                _ = poll_fn(|cx| driver.poll_close(cx)) => {
                    debug!("h3 connection closed: {}", remote);
                }
                _ = shutdown_rx.recv() => {
                    debug!("h3 connection is shutting down: {}", remote);
                }
            }
        });

        Ok(H3Conn {
            send_request,
            shutdown_tx,
            endpoint,
        })
    }
}

impl H3Transport {
    pub fn new(connector: H3Connector) -> Self {
        Self {
            connector,
            state: RwLock::new(State::Open(None)),
        }
    }

    /// Issue one request. A live connection is preferred; when it is gone or was never
    /// established, one fresh dial is permitted before the error surfaces.
    pub async fn round_trip(&self, req: Request<()>) -> Result<(StatusCode, Bytes)> {
        {
            let state = self.state.read().await;
            match &*state {
                State::Closed => return Err(UpstreamError::Closed),
                State::Open(Some(conn)) => {
                    match request(conn.send_request.clone(), clone_request(&req)?).await {
                        Ok(outcome) => return Ok(outcome),
                        // The cached connection is unusable; fall through to a fresh dial.
                        Err(UpstreamError::H3Error(e)) => {
                            debug!("cached h3 connection unusable: {}", e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                State::Open(None) => {}
            }
        }

        let send = {
            let mut state = self.state.write().await;
            match &mut *state {
                State::Closed => return Err(UpstreamError::Closed),
                State::Open(slot) => {
                    let conn = self.connector.connect().await?;
                    let send = conn.send_request.clone();
                    if let Some(old) = slot.replace(conn) {
                        let _ = old.shutdown_tx.try_send(());
                    }
                    send
                }
            }
        };
        request(send, req).await
    }

    /// Mark the transport closed and tear the connection down. Round trips racing with
    /// the close finish first; later ones fail deterministically.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if let State::Open(slot) = &mut *state {
            if let Some(conn) = slot.take() {
                let _ = conn.shutdown_tx.try_send(());
                conn.endpoint.close(0u32.into(), b"");
            }
        }
        *state = State::Closed;
    }
}

async fn request(
    mut send: SendRequest<OpenStreams, Bytes>,
    req: Request<()>,
) -> Result<(StatusCode, Bytes)> {
    let mut stream = send.send_request(req).await?;
    stream.finish().await?;

    let response = stream.recv_response().await?;
    let status = response.status();

    let content_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| usize::from_str(v).ok());

    let mut body = BytesMut::with_capacity(content_length.unwrap_or(512).clamp(512, 4_096));
    while let Some(chunk) = stream.recv_data().await? {
        body.put(chunk);
        if let Some(len) = content_length {
            if body.len() >= len {
                break;
            }
        }
    }
    Ok((status, body.freeze()))
}

// `http::Request` isn't `Clone`; rebuild it for the second attempt.
fn clone_request(req: &Request<()>) -> Result<Request<()>> {
    let mut copy = Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .body(())?;
    *copy.headers_mut() = req.headers().clone();
    Ok(copy)
}

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

//! A mock DoH server over TLS for the integration tests. It answers RFC 8484 GET
//! requests by echoing the query back as a response, and can be bent into the various
//! failure shapes the upstream has to survive.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::{Bytes, BytesMut};
use domain::base::Message;
use http_body_util::Full;
use hyper::{body::Incoming, header, service::service_fn, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, time::sleep};
use tokio_rustls::TlsAcceptor;

/// How the mock server treats incoming requests.
#[derive(Clone, Copy)]
pub enum Behavior {
    /// Echo every query back as a response.
    Echo,
    /// Answer everything with the given HTTP status and an empty body.
    Status(u16),
    /// Echo, but delay requests whose 0-based ordinal falls in `from..until`.
    DelayRange {
        from: usize,
        until: usize,
        delay: Duration,
    },
}

pub struct MockDoh {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl MockDoh {
    /// The number of requests the server has seen so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn url(&self, scheme: &str) -> String {
        format!("{}://localhost:{}/dns-query", scheme, self.addr.port())
    }
}

/// Spawn the mock server on an ephemeral port.
pub async fn serve(behavior: Behavior) -> MockDoh {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let certs = vec![cert.cert.der().clone()];
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    // Bind through the same name the upstream resolves, so both end up on the same
    // address family whatever `localhost` means here.
    let listener = TcpListener::bind("localhost:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let server_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let acceptor = acceptor.clone();
            let hits = server_hits.clone();
            tokio::spawn(async move {
                let tls = match acceptor.accept(stream).await {
                    Ok(tls) => tls,
                    Err(_) => return,
                };
                let service = service_fn(move |req: Request<Incoming>| {
                    let hits = hits.clone();
                    async move {
                        let ordinal = hits.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, std::convert::Infallible>(handle(req, behavior, ordinal).await)
                    }
                });
                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });

    MockDoh { addr, hits }
}

async fn handle(req: Request<Incoming>, behavior: Behavior, ordinal: usize) -> Response<Full<Bytes>> {
    match behavior {
        Behavior::Status(code) => {
            return Response::builder()
                .status(code)
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
        Behavior::DelayRange { from, until, delay } if (from..until).contains(&ordinal) => {
            sleep(delay).await;
        }
        _ => {}
    }
    echo(&req)
}

// Decode the `dns` parameter and turn the query into a response. Queries that violate
// the DoH conventions (missing parameter, bad base64, non-zero id) earn a 400.
fn echo(req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let decoded = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("dns=")))
        .and_then(|dns| URL_SAFE_NO_PAD.decode(dns.as_bytes()).ok());
    let raw = match decoded {
        Some(raw) => raw,
        None => return bad_request(),
    };

    let mut msg = match Message::from_octets(BytesMut::from(&raw[..])) {
        Ok(msg) => msg,
        Err(_) => return bad_request(),
    };
    if msg.header().id() != 0 {
        return bad_request();
    }
    msg.header_mut().set_qr(true);

    Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "application/dns-message")
        .body(Full::new(msg.into_octets().freeze()))
        .unwrap()
}

fn bad_request() -> Response<Full<Bytes>> {
    Response::builder()
        .status(400)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

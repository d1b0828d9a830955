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

//! The DoH upstream: a lazily-created HTTP client behind a mutex, an exchange path with
//! reset-and-retry semantics, and a batching lane that shares one client and one traffic
//! shaping pass across coalesced queries.

pub mod dial;
pub mod options;
pub mod shape;

mod batch;
mod h3;
mod probe;
mod quic;
mod tls;
mod transport;
mod wire;

use self::{
    batch::{BatchExchanger, BatchQueue},
    dial::{BootstrapDialer, DialHandler},
    options::{DohBuilder, Target},
    quic::QuicTemplate,
    shape::{Shaper, ShapingMode},
    tls::TlsTemplate,
    transport::HttpTransport,
};
use crate::error::{Result, UpstreamError};
use async_trait::async_trait;
use bytes::Bytes;
use domain::base::Message;
use log::debug;
use reqwest::StatusCode;
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{sync::Mutex, time::timeout};

// Additional attempts after the initial exchange, each preceded by a full client reset.
const MAX_RESETS: usize = 2;

/// A DNS over HTTPS upstream. Safe to share and use concurrently; all clones refer to
/// the same client, batch queue, and shaping state.
///
/// ```no_run
/// use dupstream::{AsyncTryInto, DohBuilder};
///
/// # async fn run() -> Result<(), dupstream::error::UpstreamError> {
/// let upstream = DohBuilder::new("https://cloudflare-dns.com/dns-query")
///     .async_try_into()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Upstream {
    inner: Arc<UpstreamInner>,
}

// The batch queue handle lives next to the client so that queue creation and `close`
// serialize on the same mutex.
#[derive(Default)]
struct ClientSlot {
    client: Option<HttpTransport>,
    batch: Option<BatchQueue>,
    closed: bool,
}

struct UpstreamInner {
    target: Target,
    timeout: Option<Duration>,
    dialer: Arc<dyn DialHandler>,
    tls: Arc<TlsTemplate>,
    quic: Arc<QuicTemplate>,
    shaper: Shaper,
    client: Mutex<ClientSlot>,
    batch_window: Duration,
    batch_size: usize,
    queue_len: usize,
    creations: AtomicUsize,
}

impl Upstream {
    /// Create an upstream from the builder. Nothing connects until the first exchange.
    pub fn new(builder: DohBuilder) -> Result<Self> {
        let timeout = builder.timeout_duration();
        let target = options::normalize(&builder.uri, builder.http_versions.clone())?;
        let dialer = builder
            .dialer
            .clone()
            .unwrap_or_else(|| Arc::new(BootstrapDialer::new(target.domain.clone(), target.port)));
        let tls = Arc::new(TlsTemplate::new(
            builder.root_store.clone(),
            builder.cipher_suites.clone(),
            builder.insecure_skip_verify,
            builder.cert_verifier.clone(),
        ));

        Ok(Self {
            inner: Arc::new(UpstreamInner {
                target,
                timeout,
                dialer,
                tls,
                quic: Arc::new(QuicTemplate::new()),
                shaper: Shaper::new(builder.shaping_seed),
                client: Mutex::new(ClientSlot::default()),
                batch_window: Duration::from_millis(builder.batch_window_ms),
                batch_size: builder.batch_size.max(1),
                queue_len: builder.queue_len.max(1),
                creations: AtomicUsize::new(0),
            }),
        })
    }

    /// The redacted form of the endpoint URL, safe to log.
    pub fn addr(&self) -> &str {
        &self.inner.target.redacted
    }

    /// Resolve one query into a response. The caller's message is left untouched; the
    /// response comes back under the caller's id.
    pub async fn exchange(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        let id = msg.header().id();
        let wire_msg = wire::with_id(msg, 0)?;
        let resp = self
            .inner
            .exchange_with_retry(&wire_msg, ShapingMode::Single)
            .await?;
        wire::with_id(&resp, id)
    }

    /// Resolve many queries through the batching lane. The result vector lines up
    /// positionally with the queries.
    pub async fn batch_exchange(&self, msgs: &[Message<Bytes>]) -> Vec<Result<Message<Bytes>>> {
        let queue = {
            let mut slot = self.inner.client.lock().await;
            if slot.closed {
                return msgs.iter().map(|_| Err(UpstreamError::Closed)).collect();
            }
            slot.batch
                .get_or_insert_with(|| {
                    BatchQueue::start(
                        Arc::downgrade(&self.inner),
                        self.inner.batch_window,
                        self.inner.batch_size,
                        self.inner.queue_len,
                    )
                })
                .clone()
        };

        // Submissions happen outside the lock; a full queue exerts backpressure here.
        let mut slots = Vec::with_capacity(msgs.len());
        for msg in msgs {
            slots.push(queue.submit(msg.clone()).await);
        }

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(match slot {
                Ok(rx) => match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(UpstreamError::Closed),
                },
                Err(e) => Err(e),
            });
        }
        out
    }

    /// Close the upstream. The current client is torn down, the batch worker winds
    /// down, and every later operation (including queries already sitting in the batch
    /// queue) fails with `Closed`.
    pub async fn close(&self) {
        let mut slot = self.inner.client.lock().await;
        if slot.closed {
            return;
        }
        slot.closed = true;
        // Dropping the queue handle closes its channel; the worker fails whatever is
        // still queued and exits, without waiting for the last `Upstream` clone to die.
        slot.batch.take();
        if let Some(client) = slot.client.take() {
            if let HttpTransport::H3(h3) = client {
                h3.close().await;
            }
        }
        debug!("upstream {} closed", self.inner.target.redacted);
    }

    /// How many HTTP clients have been constructed so far.
    #[doc(hidden)]
    pub fn client_creations(&self) -> usize {
        self.inner.creations.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.target.redacted)
    }
}

impl UpstreamInner {
    // Get the cached client or create one, everything serialized by the client mutex.
    // The configured timeout bounds the wait for the lock and the construction both.
    async fn get_client(&self) -> Result<(HttpTransport, bool)> {
        let started = Instant::now();
        let mut slot = match self.timeout {
            Some(bound) => timeout(bound, self.client.lock()).await?,
            None => self.client.lock().await,
        };
        if slot.closed {
            return Err(UpstreamError::Closed);
        }
        if let Some(client) = &slot.client {
            return Ok((client.clone(), true));
        }

        let remaining = match self.timeout {
            Some(bound) => Some(bound.checked_sub(started.elapsed()).ok_or_else(|| {
                UpstreamError::IoError(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for the client slot",
                ))
            })?),
            None => None,
        };
        let client = self.build_client(remaining).await?;
        slot.client = Some(client.clone());
        Ok((client, false))
    }

    async fn build_client(&self, bound: Option<Duration>) -> Result<HttpTransport> {
        let build = transport::build(
            &self.target,
            &self.dialer,
            &self.tls,
            &self.quic,
            self.timeout,
        );
        let client = match bound {
            Some(bound) => timeout(bound, build).await??,
            None => build.await?,
        };
        self.creations.fetch_add(1, Ordering::Relaxed);
        debug!("created a new HTTP client for {}", self.target.redacted);
        Ok(client)
    }

    // Tear the current client down and publish a fresh one. A 0-RTT rejection also
    // throws the stale QUIC session state away first.
    async fn reset_client(&self, cause: &UpstreamError) -> Result<HttpTransport> {
        let mut slot = self.client.lock().await;
        if slot.closed {
            return Err(UpstreamError::Closed);
        }
        if matches!(cause, UpstreamError::ZeroRttRejected) {
            debug!(
                "0-RTT rejected by {}; discarding the session store",
                self.target.redacted
            );
            self.quic.reset_session_store();
        }
        if let Some(old) = slot.client.take() {
            if let HttpTransport::H3(h3) = old {
                h3.close().await;
            }
        }
        let client = self.build_client(self.timeout).await?;
        slot.client = Some(client.clone());
        Ok(client)
    }

    async fn exchange_with_retry(
        &self,
        wire_msg: &Message<Bytes>,
        mode: ShapingMode,
    ) -> Result<Message<Bytes>> {
        let (mut client, cached) = self.get_client().await?;
        let mut resets = 0;
        loop {
            match self.exchange_https(&client, wire_msg, mode).await {
                Ok(resp) => return Ok(resp),
                // Transient errors only warrant a reset when the client predates this
                // call.
                Err(e) if cached && resets < MAX_RESETS && e.is_transient() => {
                    resets += 1;
                    debug!(
                        "transient error from {} ({}); re-creating the HTTP client, attempt {}",
                        self.target.redacted, e, resets
                    );
                    client = self.reset_client(&e).await?;
                }
                Err(e) => {
                    // Terminal: one best-effort reset, its failure attached to the
                    // original error.
                    return Err(match self.reset_client(&e).await {
                        Ok(_) | Err(UpstreamError::Closed) => e,
                        Err(reset) => UpstreamError::AfterReset {
                            source: Box::new(e),
                            reset: Box::new(reset),
                        },
                    });
                }
            }
        }
    }

    // The single HTTP exchange: encode, send, check status, unpack, verify the id.
    async fn exchange_https(
        &self,
        client: &HttpTransport,
        wire_msg: &Message<Bytes>,
        mode: ShapingMode,
    ) -> Result<Message<Bytes>> {
        let dns = wire::encode_query(wire_msg);
        let headers = self.shaper.headers(mode);

        let (status, body) = match client {
            HttpTransport::H2(client) => {
                let resp = client
                    .get(self.target.url.clone())
                    .query(&[("dns", dns.as_str())])
                    .headers(headers)
                    .send()
                    .await?;
                let status = resp.status();
                let body = resp.bytes().await?;
                (status, body)
            }
            HttpTransport::H3(h3) => {
                let mut url = self.target.url.clone();
                url.set_query(Some(&format!("dns={}", dns)));
                let mut req = http::Request::builder()
                    .method(http::Method::GET)
                    .uri(url.as_str())
                    .body(())?;
                *req.headers_mut() = headers;
                // reqwest carries its own per-request deadline; the h3 path needs an
                // explicit one.
                match self.timeout {
                    Some(bound) => timeout(bound, h3.round_trip(req)).await??,
                    None => h3.round_trip(req).await?,
                }
            }
        };

        if status != StatusCode::OK {
            return Err(UpstreamError::FailedHttp {
                status,
                addr: self.target.redacted.clone(),
            });
        }

        let resp = wire::unpack(body)?;
        if resp.header().id() != wire_msg.header().id() {
            return Err(UpstreamError::IdMismatch {
                expected: wire_msg.header().id(),
                found: resp.header().id(),
                response: resp.into_octets(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl BatchExchanger for UpstreamInner {
    type Client = HttpTransport;

    async fn batch_client(&self) -> Result<HttpTransport> {
        Ok(self.get_client().await?.0)
    }

    async fn batch_exchange_one(
        &self,
        client: HttpTransport,
        msg: Message<Bytes>,
    ) -> Result<Message<Bytes>> {
        let id = msg.header().id();
        let wire_msg = wire::with_id(&msg, 0)?;
        // Shaping is cosmetic; the unshaped query still goes out when it fails.
        let shaped = match self.shaper.pad_and_mark(&wire_msg) {
            Ok(shaped) => shaped,
            Err(e) => {
                debug!("shaping failed for {}: {}", self.target.redacted, e);
                wire_msg
            }
        };
        let resp = self
            .exchange_https(&client, &shaped, ShapingMode::Batched)
            .await?;
        wire::with_id(&resp, id)
    }
}

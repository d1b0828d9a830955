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

mod common;

use bytes::{Bytes, BytesMut};
use common::{serve, Behavior};
use domain::base::{Dname, Message, MessageBuilder, Rtype};
use dupstream::{error::UpstreamError, AsyncTryInto, DohBuilder, HttpVersion, Upstream};
use std::{str::FromStr, time::Duration};

fn query(name: &str, id: u16) -> Message<Bytes> {
    let name = Dname::<Bytes>::from_str(name).unwrap();
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(1232)).unwrap();
    builder.header_mut().set_id(id);
    builder.header_mut().set_rd(true);
    let mut builder = builder.question();
    builder.push((&name, Rtype::A)).unwrap();
    builder.into_message()
}

async fn upstream(url: &str, versions: Vec<HttpVersion>, timeout: u64) -> Upstream {
    DohBuilder::new(url)
        .http_versions(versions)
        .timeout(timeout)
        .insecure_skip_verify(true)
        .shaping_seed(7)
        .async_try_into()
        .await
        .unwrap()
}

#[tokio::test]
async fn happy_h2_exchange_restores_the_id() {
    let server = serve(Behavior::Echo).await;
    let upstream = upstream(&server.url("https"), vec![HttpVersion::H2], 5).await;

    let q = query("example.com", 0x1234);
    let resp = upstream.exchange(&q).await.unwrap();

    // The mock answers 400 to any query whose wire id isn't zero, so a successful echo
    // also proves the id was zeroed on the wire and restored afterwards.
    assert_eq!(resp.header().id(), 0x1234);
    assert!(resp.header().qr());
    // The caller's message was never touched.
    assert_eq!(q.header().id(), 0x1234);

    assert_eq!(server.hits(), 1);
    assert_eq!(upstream.client_creations(), 1);
}

#[tokio::test]
async fn consecutive_exchanges_share_one_client() {
    let server = serve(Behavior::Echo).await;
    let upstream = upstream(&server.url("https"), vec![HttpVersion::H2], 5).await;

    upstream.exchange(&query("one.example.com", 1)).await.unwrap();
    upstream.exchange(&query("two.example.com", 2)).await.unwrap();

    assert_eq!(server.hits(), 2);
    assert_eq!(upstream.client_creations(), 1);
}

#[tokio::test]
async fn bad_status_surfaces_code_and_redacted_addr() {
    let server = serve(Behavior::Status(500)).await;
    let upstream = upstream(&server.url("https"), vec![HttpVersion::H2], 5).await;

    let outcome = upstream.exchange(&query("example.com", 9)).await;
    match outcome {
        Err(UpstreamError::FailedHttp { status, addr }) => {
            assert_eq!(status.as_u16(), 500);
            assert!(addr.contains("localhost"));
        }
        other => panic!("expected FailedHttp, got {:?}", other.map(|_| ())),
    }

    // The terminal error triggered one best-effort reset, which rebuilt the client.
    assert_eq!(upstream.client_creations(), 2);
}

#[tokio::test]
async fn transient_timeout_resets_and_retries() {
    // Request 0 warms the client; request 1 stalls past the deadline; request 2 (the
    // retry after the reset) answers normally.
    let server = serve(Behavior::DelayRange {
        from: 1,
        until: 2,
        delay: Duration::from_secs(3),
    })
    .await;
    let upstream = upstream(&server.url("https"), vec![HttpVersion::H2], 1).await;

    upstream.exchange(&query("warmup.example.com", 1)).await.unwrap();
    assert_eq!(upstream.client_creations(), 1);

    let resp = upstream.exchange(&query("slow.example.com", 2)).await.unwrap();
    assert_eq!(resp.header().id(), 2);

    assert_eq!(server.hits(), 3);
    // Exactly one reset happened between the two attempts.
    assert_eq!(upstream.client_creations(), 2);
}

#[tokio::test]
async fn retries_are_bounded_to_two_resets() {
    // Everything after the warmup stalls, so the exchange burns the full retry budget.
    let server = serve(Behavior::DelayRange {
        from: 1,
        until: usize::MAX,
        delay: Duration::from_secs(5),
    })
    .await;
    let upstream = upstream(&server.url("https"), vec![HttpVersion::H2], 1).await;

    upstream.exchange(&query("warmup.example.com", 1)).await.unwrap();

    let outcome = upstream.exchange(&query("slow.example.com", 2)).await;
    assert!(outcome.err().unwrap().is_transient());

    // 1 warmup + 1 initial + 2 retries.
    assert_eq!(server.hits(), 4);
    // 1 initial client + 2 retry resets + 1 final best-effort reset.
    assert_eq!(upstream.client_creations(), 4);
}

#[tokio::test]
async fn batch_of_five_aligns_positionally() {
    let server = serve(Behavior::Echo).await;
    let upstream = upstream(&server.url("https"), vec![HttpVersion::H2], 5).await;

    let names = [
        "a.example.com",
        "b.example.com",
        "c.example.com",
        "d.example.com",
        "e.example.com",
    ];
    let queries: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| query(name, i as u16 + 100))
        .collect();

    let outcomes = upstream.batch_exchange(&queries).await;
    assert_eq!(outcomes.len(), names.len());

    for (i, (outcome, name)) in outcomes.into_iter().zip(names).enumerate() {
        let resp = outcome.unwrap();
        assert_eq!(resp.header().id(), i as u16 + 100);
        let qname = resp.first_question().unwrap().qname().to_string();
        assert!(qname.trim_end_matches('.').eq_ignore_ascii_case(name));
    }

    assert_eq!(server.hits(), names.len());
    assert_eq!(upstream.client_creations(), 1);
}

#[tokio::test]
async fn tls_wins_the_probe_and_h2_takes_over() {
    // The mock speaks TCP only. The QUIC probe can never complete, the TLS probe
    // succeeds, and the upstream settles on HTTP/2.
    let server = serve(Behavior::Echo).await;
    let upstream = upstream(
        &server.url("https"),
        vec![HttpVersion::H2, HttpVersion::H3],
        3,
    )
    .await;

    let resp = upstream.exchange(&query("example.com", 5)).await.unwrap();
    assert_eq!(resp.header().id(), 5);
    assert_eq!(upstream.client_creations(), 1);
}

#[tokio::test]
async fn h3_scheme_pins_http3_and_honors_the_deadline() {
    // `h3://` pins ALPN to HTTP/3; with nothing speaking QUIC on the other side the
    // exchange must fail within the configured deadline instead of hanging.
    let server = serve(Behavior::Echo).await;
    let upstream = upstream(&server.url("h3"), vec![HttpVersion::H2, HttpVersion::H3], 1).await;

    let outcome = upstream.exchange(&query("example.com", 5)).await;
    // Depending on how the host reports the dead port, the handshake either times out
    // against our deadline or collapses into a QUIC transport error.
    let err = outcome.err().unwrap();
    assert!(
        err.is_transient() || matches!(err, UpstreamError::QuicConnectionError(_)),
        "unexpected error: {}",
        err
    );
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn close_fails_further_operations() {
    let server = serve(Behavior::Echo).await;
    let upstream = upstream(&server.url("https"), vec![HttpVersion::H2], 5).await;

    upstream.exchange(&query("example.com", 1)).await.unwrap();
    upstream.close().await;

    assert!(matches!(
        upstream.exchange(&query("example.com", 2)).await,
        Err(UpstreamError::Closed)
    ));

    let outcomes = upstream.batch_exchange(&[query("example.com", 3)]).await;
    assert!(matches!(outcomes[0], Err(UpstreamError::Closed)));
}

// Live-network smoke tests, run with `cargo test -- --ignored`.

#[tokio::test]
#[ignore]
async fn live_cloudflare_h2() {
    let upstream = DohBuilder::new("https://cloudflare-dns.com/dns-query")
        .http_versions(vec![HttpVersion::H2])
        .async_try_into()
        .await
        .unwrap();
    let resp = upstream.exchange(&query("example.com", 0x42)).await.unwrap();
    assert_eq!(resp.header().id(), 0x42);
    assert!(resp.header().qr());
}

#[tokio::test]
#[ignore]
async fn live_google_h3() {
    let upstream = DohBuilder::new("h3://dns.google/dns-query")
        .async_try_into()
        .await
        .unwrap();
    let resp = upstream.exchange(&query("example.com", 0x42)).await.unwrap();
    assert_eq!(resp.header().id(), 0x42);
}

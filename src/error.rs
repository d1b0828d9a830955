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

//! This module provides the universal error type used in the library. The error type uses `thiserror`.

use bytes::Bytes;
use domain::base::{octets::ParseError, ShortBuf};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// A shorthand for the results returned throughout the library.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// UpstreamError enumerates all possible errors returned by this library.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The URL cannot be parsed or uses an unknown scheme.
    #[error("the URL '{0}' is invalid")]
    InvalidUri(String),

    /// The URL doesn't contain a domain we can resolve and verify against.
    #[error("the URL '{0}' doesn't contain a valid domain")]
    InvalidDomain(url::Url),

    /// None of the configured ALPN protocols can be served by the transports we have.
    #[error("none of the configured ALPN protocols is a supported HTTP version")]
    NoSupportedHttpVersion,

    /// HTTP/3 is not among the configured ALPN protocols, so no probe was run.
    #[error("HTTP/3 is not among the configured ALPN protocols")]
    H3Disabled,

    /// The TLS handshake finished before the QUIC one did, so HTTP/3 was rejected.
    #[error("TLS handshake was faster than the QUIC one")]
    TlsFaster,

    /// The server rejected our QUIC 0-RTT attempt; the cached session data is stale.
    #[error("QUIC server rejected the 0-RTT attempt")]
    ZeroRttRejected,

    /// The TLS configuration cannot be used for QUIC, which requires TLS 1.3.
    #[error("the TLS configuration doesn't contain a TLS 1.3 cipher suite usable for QUIC")]
    NoInitialCipherSuite,

    /// Unsuccessful HTTP status code returned by the upstream.
    #[error("unsuccessful HTTP code: {status} from upstream {addr}")]
    FailedHttp {
        /// The status code returned.
        status: StatusCode,
        /// The redacted upstream address.
        addr: String,
    },

    /// The response id doesn't match the query id. The raw response is carried along so
    /// callers that want to trust it regardless can still parse it.
    #[error("response id {found} doesn't match the query id {expected}")]
    IdMismatch {
        /// The id we sent on the wire.
        expected: u16,
        /// The id the response came back with.
        found: u16,
        /// The raw wire response.
        response: Bytes,
    },

    /// The shared client for a whole batch could not be created.
    #[error("the shared batch client could not be created: {0}")]
    BatchClient(String),

    /// The upstream has already been closed.
    #[error("the upstream has already been closed")]
    Closed,

    /// Error forwarded from `tokio::time::error`. This indicates a timeout probably.
    #[error(transparent)]
    TimeError(#[from] Elapsed),

    /// IO Error
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Error forwarded from `reqwest`.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// The QUIC connection could not even be attempted.
    #[error(transparent)]
    QuicConnectError(#[from] quinn::ConnectError),

    /// The QUIC connection failed or was lost.
    #[error(transparent)]
    QuicConnectionError(#[from] quinn::ConnectionError),

    /// Error forwarded from the HTTP/3 layer.
    #[error(transparent)]
    H3Error(#[from] h3::Error),

    /// The HTTP request could not be built.
    #[error(transparent)]
    HttpError(#[from] http::Error),

    /// Error forwarded from `rustls`.
    #[error(transparent)]
    TlsError(#[from] rustls::Error),

    /// The message doesn't fit in the buffer while packing.
    #[error(transparent)]
    ShortBuf(#[from] ShortBuf),

    /// The octets don't parse as a DNS message.
    #[error(transparent)]
    ParseError(#[from] ParseError),

    /// The original error, plus the failure of the best-effort client reset that followed it.
    #[error("{source} (the client reset afterwards failed as well: {reset})")]
    AfterReset {
        /// The error that caused the reset.
        source: Box<UpstreamError>,
        /// The error the reset itself ran into.
        reset: Box<UpstreamError>,
    },
}

impl UpstreamError {
    /// Whether the error is a transient transport failure that a client reset and retry
    /// may clear: elapsed timers, timed out sockets, QUIC idle timeouts, and rejected
    /// 0-RTT attempts. Everything else is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TimeError(_) | Self::ZeroRttRejected => true,
            Self::IoError(e) => e.kind() == std::io::ErrorKind::TimedOut,
            Self::ReqwestError(e) => e.is_timeout(),
            Self::QuicConnectionError(e) => matches!(e, quinn::ConnectionError::TimedOut),
            _ => false,
        }
    }
}

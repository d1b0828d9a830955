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

#![deny(missing_docs)]
#![deny(unsafe_code)]
// Documentation
//! DNS over HTTPS upstream transport library. It resolves DNS queries through an encrypted
//! HTTPS transport, speaking HTTP/2 over TLS or HTTP/3 over QUIC, whichever handshake wins
//! a per-client probe. Clients are created lazily, rebuilt on transient failures, and can
//! coalesce queries into batches that share one connection and one traffic-shaping pass.

pub mod error;
mod upstream;

pub use upstream::{
    dial::{BootstrapDialer, DialHandler, DialedConn, Network},
    options::{DohBuilder, HttpVersion},
    shape::ShapingMode,
    Upstream,
};

use async_trait::async_trait;

// EDNS0 recommended maximum payload size, which is also the largest message we would rebuild.
pub(crate) const MAX_LEN: usize = 1232;

/// A conversion that consumes the value, may suspend, and may fail.
#[async_trait]
pub trait AsyncTryInto<T> {
    /// The possible errors during the conversion.
    type Error;

    /// Convert oneself into the target type.
    async fn async_try_into(self) -> std::result::Result<T, Self::Error>;
}

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

use super::tls::TlsTemplate;
use crate::error::{Result, UpstreamError};
use quinn::{crypto::rustls::QuicClientConfig, TransportConfig, VarInt};
use rustls::client::{ClientSessionMemoryCache, ClientSessionStore};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

const KEEP_ALIVE: Duration = Duration::from_secs(20);
// Matches the idle timeout of the HTTP/2 connection pool.
const IDLE_TIMEOUT_MS: u32 = 300_000;
// 0-RTT session tickets cached per upstream.
const SESSION_STORE_SIZE: usize = 16;

// One immutable QUIC configuration snapshot. Handshakes clone the `Arc` out and never
// see later replacements.
pub(super) struct QuicConfig {
    pub transport: Arc<TransportConfig>,
    pub session_store: Arc<ClientSessionMemoryCache>,
}

impl QuicConfig {
    fn fresh() -> Arc<Self> {
        let mut transport = TransportConfig::default();
        transport.keep_alive_interval(Some(KEEP_ALIVE));
        transport.max_idle_timeout(Some(VarInt::from_u32(IDLE_TIMEOUT_MS).into()));
        Arc::new(Self {
            transport: Arc::new(transport),
            session_store: Arc::new(ClientSessionMemoryCache::new(SESSION_STORE_SIZE)),
        })
    }
}

// The mutable slot holding the current QUIC configuration. Replacement happens under the
// mutex; the configuration itself is never mutated in place once published.
pub(super) struct QuicTemplate {
    current: Mutex<Arc<QuicConfig>>,
}

impl QuicTemplate {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(QuicConfig::fresh()),
        }
    }

    /// The snapshot to run the next handshake with.
    pub fn snapshot(&self) -> Arc<QuicConfig> {
        self.current.lock().unwrap().clone()
    }

    /// The server rejected 0-RTT, so every cached session ticket is stale. Publish a
    /// replacement configuration with an empty store.
    pub fn reset_session_store(&self) {
        let mut current = self.current.lock().unwrap();
        let transport = current.transport.clone();
        *current = Arc::new(QuicConfig {
            transport,
            session_store: Arc::new(ClientSessionMemoryCache::new(SESSION_STORE_SIZE)),
        });
    }
}

/// Assemble the quinn client configuration for a real HTTP/3 connection.
pub(super) fn client_config(tls: &TlsTemplate, snapshot: &QuicConfig) -> Result<quinn::ClientConfig> {
    let store: Arc<dyn ClientSessionStore> = snapshot.session_store.clone();
    let crypto = tls.quic_config(store)?;
    let crypto =
        QuicClientConfig::try_from(crypto).map_err(|_| UpstreamError::NoInitialCipherSuite)?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(snapshot.transport.clone());
    Ok(config)
}

/// Assemble the quinn client configuration for the probe: default transport knobs and no
/// session reuse, so the probe cannot disturb the real connection state.
pub(super) fn probe_config(tls: &TlsTemplate) -> Result<quinn::ClientConfig> {
    let crypto = tls.probe_config(&[b"h3".to_vec()])?;
    let crypto =
        QuicClientConfig::try_from(crypto).map_err(|_| UpstreamError::NoInitialCipherSuite)?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

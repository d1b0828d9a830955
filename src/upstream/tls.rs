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

use crate::error::Result;
use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        ClientSessionMemoryCache, ClientSessionStore, Resumption,
    },
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedCipherSuite,
};
use std::sync::Arc;

// Sessions cached for TLS resumption over the TCP path.
const SESSION_CACHE_SIZE: usize = 64;

// Template for the per-connection TLS configurations. It is never handed out directly;
// every handshake gets a freshly built `ClientConfig` so ALPN and session state stay
// isolated between the transports.
pub(super) struct TlsTemplate {
    roots: Arc<RootCertStore>,
    cipher_suites: Option<Vec<SupportedCipherSuite>>,
    insecure_skip_verify: bool,
    verifier: Option<Arc<dyn ServerCertVerifier>>,
    session_store: Arc<ClientSessionMemoryCache>,
}

impl TlsTemplate {
    pub fn new(
        roots: Option<Arc<RootCertStore>>,
        cipher_suites: Option<Vec<SupportedCipherSuite>>,
        insecure_skip_verify: bool,
        verifier: Option<Arc<dyn ServerCertVerifier>>,
    ) -> Self {
        let roots = roots.unwrap_or_else(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(roots)
        });
        Self {
            roots,
            cipher_suites,
            insecure_skip_verify,
            verifier,
            session_store: Arc::new(ClientSessionMemoryCache::new(SESSION_CACHE_SIZE)),
        }
    }

    fn provider(&self) -> CryptoProvider {
        let mut provider = ring::default_provider();
        if let Some(suites) = &self.cipher_suites {
            provider.cipher_suites = suites.clone();
        }
        provider
    }

    fn builder_with_verifier(
        &self,
        honor_custom_verifier: bool,
    ) -> Result<rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>> {
        let builder = ClientConfig::builder_with_provider(Arc::new(self.provider()))
            .with_safe_default_protocol_versions()?;
        Ok(match &self.verifier {
            Some(verifier) if honor_custom_verifier => builder
                .dangerous()
                .with_custom_certificate_verifier(verifier.clone()),
            _ if self.insecure_skip_verify => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier)),
            _ => builder.with_root_certificates(self.roots.clone()),
        })
    }

    /// Configuration for the HTTP/2 (and HTTP/1.1) transport, with session resumption
    /// backed by the shared store.
    pub fn client_config(&self, alpn: &[Vec<u8>]) -> Result<ClientConfig> {
        let mut config = self.builder_with_verifier(true)?.with_no_client_auth();
        config.alpn_protocols = alpn.to_vec();
        config.resumption = Resumption::store(self.session_store.clone());
        Ok(config)
    }

    /// Configuration for the TLS half of the transport probe. Custom verifiers and the
    /// session cache are long-lived state the short-lived probe must not touch.
    pub fn probe_config(&self, alpn: &[Vec<u8>]) -> Result<ClientConfig> {
        let mut config = self.builder_with_verifier(false)?.with_no_client_auth();
        config.alpn_protocols = alpn.to_vec();
        config.resumption = Resumption::disabled();
        Ok(config)
    }

    /// Configuration for QUIC handshakes: h3 ALPN, early data on, and the session store
    /// supplied by the QUIC template so 0-RTT state can be replaced wholesale.
    pub fn quic_config(&self, session_store: Arc<dyn ClientSessionStore>) -> Result<ClientConfig> {
        let mut config = self.builder_with_verifier(true)?.with_no_client_auth();
        config.alpn_protocols = vec![b"h3".to_vec()];
        config.resumption = Resumption::store(session_store);
        config.enable_early_data = true;
        Ok(config)
    }
}

// Accepts any certificate. Only reachable through `insecure_skip_verify`.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

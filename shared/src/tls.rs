use std::sync::Arc;

use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::CryptoProvider,
    pki_types::ServerName,
    server::ResolvesServerCert,
    version::{TLS12, TLS13},
};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;

use crate::cert::NoVerifyServerCertVerifier;
use crate::crypto::init_crypto;
use crate::error::ProxyError;

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Builds client and server `rustls` configurations that share a single
/// crypto provider.
///
/// Only HTTP/1.1 is ever negotiated: the engine only speaks HTTP/1.1 on
/// both sides of the intercept.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    crypto_provider: Arc<CryptoProvider>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        init_crypto();
        TlsConfig {
            crypto_provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client-side config used to dial origins. Certificate validation is
    /// disabled; see [`NoVerifyServerCertVerifier`].
    pub fn client_config(&self, _roots: Arc<RootCertStore>) -> Result<ClientConfig, ProxyError> {
        let mut config = ClientConfig::builder_with_provider(self.crypto_provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::TlsHandshake(std::io::Error::other(e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifyServerCertVerifier))
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        Ok(config)
    }

    /// Server-side config used to terminate the client's TLS connection
    /// behind a CONNECT tunnel, presenting a freshly minted leaf certificate
    /// resolved per-SNI by `resolver`.
    pub fn server_config(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<ServerConfig, ProxyError> {
        let mut config = ServerConfig::builder_with_provider(self.crypto_provider.clone())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(|e| ProxyError::TlsHandshake(std::io::Error::other(e)))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        Ok(config)
    }
}

/// Connects to `server_name` over `stream`, performing the TLS handshake
/// used for every upstream dial (replay, param scan, and forward-proxied
/// plaintext-over-CONNECT requests alike).
pub async fn connect_tls(
    server_name: ServerName<'static>,
    stream: TcpStream,
    client_config: Arc<ClientConfig>,
) -> Result<ClientTlsStream<TcpStream>, ProxyError> {
    let connector = tokio_rustls::TlsConnector::from(client_config);
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProxyError::TlsHandshake(std::io::Error::other(e)))
}

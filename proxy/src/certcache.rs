use std::sync::Arc;

use dashmap::DashMap;
use roxy_shared::RoxyCA;
use roxy_shared::error::ProxyError;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use rustls::sign::CertifiedKey;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::store::CertificateStore;

/// Looks up or mints a [`CertifiedKey`] for a host, memoizing the result in
/// a [`CertificateStore`] (§4.2.3) and coalescing concurrent misses for the
/// same host behind a per-host mutex (the §9 single-flight recommendation).
///
/// Grounded on the Go original's `GetCertificate(host)` cache-first lookup
/// and `proxy/src/flow.rs`'s `DashMap`-backed flow table for the
/// per-host-guard shape.
pub struct CertCache {
    ca: RoxyCA,
    store: Arc<dyn CertificateStore>,
    provider: Arc<CryptoProvider>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl CertCache {
    pub fn new(ca: RoxyCA, store: Arc<dyn CertificateStore>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            ca,
            store,
            provider,
            inflight: DashMap::new(),
        }
    }

    pub async fn get_or_mint(&self, host: &str) -> Result<CertifiedKey, ProxyError> {
        let guard = self
            .inflight
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _lock = guard.lock().await;

        if let Some((cert_pem, key_pem)) = self
            .store
            .find_certificate(host)
            .await?
        {
            trace!("certificate cache hit for {host}");
            return pem_to_certified_key(&cert_pem, &key_pem, &self.provider);
        }

        debug!("minting leaf certificate for {host}");
        let (cert, key_pair) = self
            .ca
            .sign_leaf(host)
            .map_err(|e| ProxyError::TlsHandshake(std::io::Error::other(e)))?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        // Tolerate a lost race against another process/store writer per
        // §4.2.3 — either certificate remains valid to use locally.
        self.store
            .insert_certificate(host, cert_pem.clone(), key_pem.clone())
            .await?;

        pem_to_certified_key(&cert_pem, &key_pem, &self.provider)
    }
}

fn pem_to_certified_key(
    cert_pem: &str,
    key_pem: &str,
    provider: &CryptoProvider,
) -> Result<CertifiedKey, ProxyError> {
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
        .map_err(|e| ProxyError::TlsHandshake(std::io::Error::other(e)))?;
    let key_der = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
        .map_err(|e| ProxyError::TlsHandshake(std::io::Error::other(e)))?;
    let signing_key = provider
        .key_provider
        .load_private_key(key_der)
        .map_err(|e| ProxyError::TlsHandshake(std::io::Error::other(e)))?;
    Ok(CertifiedKey::new(vec![cert_der], signing_key))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use roxy_shared::generate_roxy_root_ca_with_path;

    fn test_cache() -> (CertCache, Arc<MemoryStore>) {
        let temp_dir = tempfile::tempdir().unwrap();
        let ca = generate_roxy_root_ca_with_path(Some(temp_dir.path().to_path_buf())).unwrap();
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        (CertCache::new(ca, store.clone(), provider), store)
    }

    #[tokio::test]
    async fn second_handshake_reuses_the_first_minted_certificate() {
        let (cache, store) = test_cache();

        cache.get_or_mint("a.test").await.unwrap();
        let (first_cert, _) = store.find_certificate("a.test").await.unwrap().unwrap();

        for _ in 0..9 {
            cache.get_or_mint("a.test").await.unwrap();
        }
        let (latest_cert, _) = store.find_certificate("a.test").await.unwrap().unwrap();

        assert_eq!(first_cert, latest_cert, "tenth handshake must reuse the cached leaf");
    }

    #[tokio::test]
    async fn distinct_hosts_get_distinct_certificates() {
        let (cache, store) = test_cache();

        cache.get_or_mint("a.test").await.unwrap();
        cache.get_or_mint("b.test").await.unwrap();

        let (cert_a, _) = store.find_certificate("a.test").await.unwrap().unwrap();
        let (cert_b, _) = store.find_certificate("b.test").await.unwrap().unwrap();
        assert_ne!(cert_a, cert_b);
    }

    #[tokio::test]
    async fn mints_for_both_dns_and_ip_literal_hosts() {
        let (cache, _store) = test_cache();
        assert!(cache.get_or_mint("example.test").await.is_ok());
        assert!(cache.get_or_mint("127.0.0.1").await.is_ok());
    }
}

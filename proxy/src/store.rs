use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use roxy_shared::error::ProxyError;

use crate::capture::{Exchange, ExchangeId};

/// Persisted exchange history, external to this crate in production (a
/// document store per spec) and expressed here purely as the contract the
/// engine, replay client and scanner depend on.
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    async fn insert_exchange(&self, exchange: Exchange) -> Result<ExchangeId, ProxyError>;
    async fn get_exchange(&self, id: &ExchangeId) -> Result<Exchange, ProxyError>;
    async fn list_exchanges(&self) -> Result<Vec<(ExchangeId, DateTime<Utc>)>, ProxyError>;
}

/// Persisted certificate material, keyed by host.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Returns `(cert_pem, key_pem)` if a certificate for `host` was
    /// already minted.
    async fn find_certificate(&self, host: &str) -> Result<Option<(String, String)>, ProxyError>;
    async fn insert_certificate(
        &self,
        host: &str,
        cert_pem: String,
        key_pem: String,
    ) -> Result<(), ProxyError>;
}

/// In-memory reference implementation of both store traits.
///
/// Grounded on `proxy/src/flow.rs::FlowStore`'s `DashMap`-backed table with
/// a monotonically increasing id, simplified here from a distributed
/// snowflake generator to a plain atomic counter since this store never
/// needs globally-unique ids across processes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    exchanges: Arc<DashMap<ExchangeId, (Exchange, DateTime<Utc>)>>,
    certificates: Arc<DashMap<String, (String, String)>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_exchange_id(&self) -> ExchangeId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        ExchangeId::new(n.to_string())
    }
}

#[async_trait]
impl ExchangeStore for MemoryStore {
    async fn insert_exchange(&self, exchange: Exchange) -> Result<ExchangeId, ProxyError> {
        let id = self.next_exchange_id();
        let captured_at = exchange.captured_at;
        self.exchanges.insert(id.clone(), (exchange, captured_at));
        Ok(id)
    }

    async fn get_exchange(&self, id: &ExchangeId) -> Result<Exchange, ProxyError> {
        self.exchanges
            .get(id)
            .map(|entry| entry.value().0.clone())
            .ok_or_else(|| ProxyError::BadInput(format!("no exchange with id {id}")))
    }

    async fn list_exchanges(&self) -> Result<Vec<(ExchangeId, DateTime<Utc>)>, ProxyError> {
        Ok(self
            .exchanges
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().1))
            .collect())
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn find_certificate(&self, host: &str) -> Result<Option<(String, String)>, ProxyError> {
        Ok(self.certificates.get(host).map(|e| e.value().clone()))
    }

    async fn insert_certificate(
        &self,
        host: &str,
        cert_pem: String,
        key_pem: String,
    ) -> Result<(), ProxyError> {
        // Tolerates duplicate inserts on a concurrent-miss race (§4.2.3):
        // whichever write lands first is kept, the later one is a no-op.
        self.certificates
            .entry(host.to_string())
            .or_insert((cert_pem, key_pem));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::capture::{CapturedRequest, CapturedResponse};
    use bytes::Bytes;
    use http::{HeaderMap, Uri};

    fn dummy_exchange() -> Exchange {
        let uri: Uri = "http://x.test/".parse().unwrap();
        let headers = HeaderMap::new();
        let req = CapturedRequest::new("GET", &uri, &headers, Bytes::new());
        let resp = CapturedResponse::new(http::StatusCode::OK, &headers, Bytes::from_static(b"hi"));
        Exchange::new(req, resp)
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = MemoryStore::new();
        let id = store.insert_exchange(dummy_exchange()).await.unwrap();
        let got = store.get_exchange(&id).await.unwrap();
        assert_eq!(got.request.url, "http://x.test/");
        assert_eq!(got.response.body, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn get_unknown_id_is_bad_input() {
        let store = MemoryStore::new();
        let err = store.get_exchange(&ExchangeId::new("missing")).await.unwrap_err();
        assert!(matches!(err, ProxyError::BadInput(_)));
    }

    #[tokio::test]
    async fn list_exchanges_reflects_every_insert() {
        let store = MemoryStore::new();
        let a = store.insert_exchange(dummy_exchange()).await.unwrap();
        let b = store.insert_exchange(dummy_exchange()).await.unwrap();
        let ids: Vec<ExchangeId> = store
            .list_exchanges()
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
    }

    #[tokio::test]
    async fn certificate_insert_tolerates_duplicate_racing_writes() {
        let store = MemoryStore::new();
        store
            .insert_certificate("a.test", "cert-1".into(), "key-1".into())
            .await
            .unwrap();
        store
            .insert_certificate("a.test", "cert-2".into(), "key-2".into())
            .await
            .unwrap();

        let (cert, _) = store.find_certificate("a.test").await.unwrap().unwrap();
        assert_eq!(cert, "cert-1");
    }
}

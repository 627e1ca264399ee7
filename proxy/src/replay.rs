use std::sync::Arc;

use http::{HeaderMap, Method, Request, Uri};
use roxy_shared::error::ProxyError;
use roxy_shared::tls::TlsConfig;
use tracing::debug;

use crate::capture::{CapturedRequest, CapturedResponse, Exchange, ExchangeId};
use crate::store::ExchangeStore;

/// Rehydrates a stored [`Exchange`] into a live request and reissues it
/// (§4.4). Used directly by replay and, one probe at a time, by the
/// parameter scanner (§4.5) — both need exactly the same
/// non-redirecting, non-validating client.
///
/// Grounded on the Go original's `History.RequestRepeat`: load by id,
/// rehydrate, `http.Client{CheckRedirect: ... ErrUseLastResponse}`, capture
/// the new pair, return the new id. [`roxy_shared::upstream::send_once`]
/// already embodies "one request in, one response out, connection torn
/// down after" — there is no redirect-following loop to disable.
pub struct ReplayClient {
    store: Arc<dyn ExchangeStore>,
    tls_config: TlsConfig,
}

impl ReplayClient {
    pub fn new(store: Arc<dyn ExchangeStore>, tls_config: TlsConfig) -> Self {
        ReplayClient { store, tls_config }
    }

    /// Loads `id`, reissues its captured request, captures the new
    /// (request, response) pair as a fresh [`Exchange`], and returns its id.
    pub async fn replay(&self, id: &ExchangeId) -> Result<ExchangeId, ProxyError> {
        let exchange = self.store.get_exchange(id).await?;
        let (response, captured_request) = self.reissue(&exchange.request, None).await?;
        let new_exchange = Exchange::new(captured_request, response);
        self.store.insert_exchange(new_exchange).await
    }

    /// Issues `request` (optionally with `override_uri` overriding its
    /// stored URL, used by the parameter scanner to splice in a probe
    /// query parameter) and returns the captured response together with
    /// the exact request that was sent.
    pub(crate) async fn reissue(
        &self,
        request: &CapturedRequest,
        override_uri: Option<Uri>,
    ) -> Result<(CapturedResponse, CapturedRequest), ProxyError> {
        let uri: Uri = match override_uri {
            Some(uri) => uri,
            None => request
                .url
                .parse()
                .map_err(|e: http::uri::InvalidUri| ProxyError::BadInput(e.to_string()))?,
        };

        let method = Method::try_from(request.method.as_str())
            .map_err(|e| ProxyError::BadInput(format!("invalid method {}: {e}", request.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            let name = http::header::HeaderName::try_from(name)
                .map_err(|e| ProxyError::BadInput(e.to_string()))?;
            let value =
                http::HeaderValue::from_str(value).map_err(|e| ProxyError::BadInput(e.to_string()))?;
            headers.append(name, value);
        }

        let body = request.body.clone();
        let mut builder = Request::builder().method(method.clone()).uri(uri.clone());
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let outbound = builder.body(http_body_util::Full::new(body.clone()))?;

        debug!("replaying {method} {uri}");
        let response = roxy_shared::upstream::send_once(&uri, outbound, &self.tls_config).await?;
        let response = roxy_shared::upstream::collect_body(response).await?;
        let (parts, resp_body) = response.into_parts();

        let captured_request = CapturedRequest::new(method.as_str(), &uri, &headers, body);
        let captured_response = CapturedResponse::new(parts.status, &parts.headers, resp_body);
        Ok((captured_response, captured_request))
    }
}

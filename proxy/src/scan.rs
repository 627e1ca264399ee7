use std::sync::Arc;

use http::Uri;
use rand::Rng;
use rand::distr::Alphanumeric;
use roxy_shared::error::ProxyError;
use roxy_shared::tls::TlsConfig;
use tracing::trace;

use crate::capture::{CapturedRequest, CapturedResponse, ExchangeId, ParamScanResult};
use crate::replay::ReplayClient;
use crate::store::ExchangeStore;

const TOKEN_LEN: usize = 10;

/// Dictionary-driven reflection probe (§4.5).
///
/// The Go original stubs this (`RequestScan` panics with "implement me");
/// this is its first real implementation, built on the same
/// non-redirecting/non-validating reissue path as [`ReplayClient`].
pub struct ParamScanner {
    store: Arc<dyn ExchangeStore>,
    replay: ReplayClient,
}

impl ParamScanner {
    pub fn new(store: Arc<dyn ExchangeStore>, tls_config: TlsConfig) -> Self {
        ParamScanner {
            replay: ReplayClient::new(store.clone(), tls_config),
            store,
        }
    }

    /// Loads `id`'s captured request and probes it once per `dictionary`
    /// entry, sequentially and in order (§4.5 "Ordering"). A network error
    /// on any single probe terminates the whole scan — there is no retry.
    pub async fn scan(
        &self,
        id: &ExchangeId,
        dictionary: &[String],
    ) -> Result<ParamScanResult, ProxyError> {
        let exchange = self.store.get_exchange(id).await?;
        let mut result = ParamScanResult::new();

        for param in dictionary {
            let token = random_token();
            let probe_uri = with_query_param(&exchange.request.url, param, &token)?;

            trace!("scanning param {param} with token {token}");
            let (response, request) = self
                .replay
                .reissue(&exchange.request, Some(probe_uri))
                .await?;

            if reflects(&response, &token) {
                result.insert(param.clone(), (request, response));
            }
        }

        Ok(result)
    }
}

fn random_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn reflects(response: &CapturedResponse, token: &str) -> bool {
    std::str::from_utf8(&response.body)
        .map(|body| body.contains(token))
        .unwrap_or(false)
}

/// Adds or overwrites query parameter `name=value` on `url`, preserving
/// every other query parameter and the rest of the URL unchanged.
fn with_query_param(url: &str, name: &str, value: &str) -> Result<Uri, ProxyError> {
    let uri: Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::BadInput(e.to_string()))?;

    let mut pairs: Vec<(String, String)> = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    if let Some(existing) = pairs.iter_mut().find(|(k, _)| k == name) {
        existing.1 = value.to_string();
    } else {
        pairs.push((name.to_string(), value.to_string()));
    }

    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();

    let path = uri.path();
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        format!("{path}?{query}")
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::BadInput(e.to_string()))?,
    );
    Uri::from_parts(parts).map_err(|e| ProxyError::BadInput(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn adds_new_query_param() {
        let uri = with_query_param("http://x.test/a", "debug", "tok123").unwrap();
        assert_eq!(uri.to_string(), "http://x.test/a?debug=tok123");
    }

    #[test]
    fn overwrites_existing_param_and_keeps_others() {
        let uri = with_query_param("http://x.test/a?id=1&debug=old", "debug", "tok123").unwrap();
        assert_eq!(uri.to_string(), "http://x.test/a?id=1&debug=tok123");
    }

    #[test]
    fn random_tokens_are_ten_alphanumeric_chars() {
        let token = random_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}

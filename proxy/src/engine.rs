use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri, uri::Scheme};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use roxy_shared::error::ProxyError;
use roxy_shared::tls::TlsConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::capture::{CapturedRequest, CapturedResponse, Exchange};
use crate::certcache::CertCache;
use crate::store::ExchangeStore;

/// How long the accept loop waits for in-flight connection tasks to drain
/// once a shutdown signal arrives before abandoning them (§5).
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// The interception engine: the accept loop plus the per-connection state
/// machine described in §4.1.
///
/// Grounded on `proxy/src/proxy.rs::start_http`/`proxy` — a
/// `TcpListener::accept` loop spawning a task per connection, dispatching
/// CONNECT via `hyper::upgrade::on`. Unlike the teacher, there is no
/// script-engine intercept hook: capture happens directly in the one-shot
/// request handler, since no scripting surface is in scope here.
pub struct ProxyEngine {
    tls_config: TlsConfig,
    store: Arc<dyn ExchangeStore>,
    cert_cache: Arc<CertCache>,
    shutdown_deadline: Duration,
}

impl ProxyEngine {
    /// Builds an engine with the default shutdown deadline (§5). Most
    /// callers not threading a [`crate::config::Config`] in want this.
    pub fn new(
        tls_config: TlsConfig,
        store: Arc<dyn ExchangeStore>,
        cert_cache: Arc<CertCache>,
    ) -> Arc<Self> {
        Self::with_shutdown_deadline(tls_config, store, cert_cache, DEFAULT_SHUTDOWN_DEADLINE)
    }

    /// Builds an engine with an explicit shutdown deadline, e.g. sourced
    /// from `Config::shutdown_deadline_secs`.
    pub fn with_shutdown_deadline(
        tls_config: TlsConfig,
        store: Arc<dyn ExchangeStore>,
        cert_cache: Arc<CertCache>,
        shutdown_deadline: Duration,
    ) -> Arc<Self> {
        Arc::new(ProxyEngine {
            tls_config,
            store,
            cert_cache,
            shutdown_deadline,
        })
    }

    /// Runs the accept loop until `shutdown` fires, then drains in-flight
    /// connections up to `shutdown_deadline` before returning.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError> {
        let local_addr = listener
            .local_addr()
            .map_err(ProxyError::UpstreamDial)?;
        trace!("proxy listening on {local_addr}");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("shutdown signal received, closing listener");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let engine = self.clone();
                            tasks.spawn(async move {
                                if let Err(e) = engine.handle_connection(stream, addr).await {
                                    warn!("connection from {addr} ended with error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept failed, stopping accept loop: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let deadline = tokio::time::sleep(self.shutdown_deadline);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("shutdown deadline reached, abandoning {} in-flight connections", tasks.len());
                    tasks.abort_all();
                    break;
                }
                next = tasks.join_next() => {
                    if next.is_none() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        client_addr: SocketAddr,
    ) -> Result<(), ProxyError> {
        let io = TokioIo::new(stream);
        let engine = self.clone();
        hyper::server::conn::http1::Builder::new()
            .title_case_headers(true)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let engine = engine.clone();
                    async move { engine.dispatch(client_addr, req).await }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| ProxyError::ClientProtocol(e.to_string()))
    }

    async fn dispatch(
        self: Arc<Self>,
        client_addr: SocketAddr,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError> {
        if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            trace!("plain forward from {client_addr}: {} {}", req.method(), req.uri());
            self.handle_plain_request(req).await
        }
    }

    /// Step 3 of §4.1.2: reply 200, then hand the upgraded socket to a TLS
    /// server handshake using a freshly-minted or cached leaf certificate.
    async fn handle_connect(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError> {
        let authority = req
            .uri()
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::ClientProtocol("CONNECT request missing authority".into()))?;
        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(443);

        let engine = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = engine.run_tls_tunnel(upgraded, host, port).await {
                        trace!("tls tunnel ended: {e}");
                    }
                }
                Err(e) => warn!("CONNECT upgrade failed: {e}"),
            }
        });

        Ok(Response::builder()
            .status(http::StatusCode::OK)
            .body(BoxBody::new(Empty::new()))?)
    }

    async fn run_tls_tunnel(
        self: Arc<Self>,
        upgraded: hyper::upgrade::Upgraded,
        host: String,
        port: u16,
    ) -> Result<(), ProxyError> {
        let client_io = TokioIo::new(upgraded);

        let certified_key = self.cert_cache.get_or_mint(&host).await?;
        let resolver: Arc<dyn ResolvesServerCert> = Arc::new(SingleCertResolver::new(certified_key));
        let server_config = self.tls_config.server_config(resolver)?;

        let tls_stream = TlsAcceptor::from(Arc::new(server_config))
            .accept(client_io)
            .await
            .map_err(|e| ProxyError::TlsHandshake(std::io::Error::other(e)))?;

        let io = TokioIo::new(tls_stream);
        let engine = self.clone();
        hyper::server::conn::http1::Builder::new()
            .title_case_headers(true)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let engine = engine.clone();
                    let host = host.clone();
                    async move { engine.handle_tunneled_request(req, &host, port).await }
                }),
            )
            .await
            .map_err(|e| ProxyError::UpstreamIo(std::io::Error::other(e)))
    }

    async fn handle_plain_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError> {
        let (parts, body) = req.into_parts();
        let body_bytes = body.collect().await.map_err(ProxyError::from)?.to_bytes();
        let uri = absolute_uri_plain(&parts.uri, &parts.headers)?;
        self.forward_and_capture(parts.method, uri, parts.headers, body_bytes)
            .await
    }

    async fn handle_tunneled_request(
        &self,
        req: Request<Incoming>,
        tunnel_host: &str,
        tunnel_port: u16,
    ) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError> {
        let (parts, body) = req.into_parts();
        let body_bytes = body.collect().await.map_err(ProxyError::from)?.to_bytes();
        let uri = absolute_uri_tunnel(&parts.uri, tunnel_host, tunnel_port)?;
        self.forward_and_capture(parts.method, uri, parts.headers, body_bytes)
            .await
    }

    /// §4.1.2 step 5: strip hop-by-hop headers, dial upstream, relay one
    /// request/response pair, capture it (§4.3), and never let a capture
    /// failure affect the client-visible response (§7).
    async fn forward_and_capture(
        &self,
        method: Method,
        uri: Uri,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError> {
        strip_hop_by_hop(&mut headers);

        let mut builder = Request::builder().method(method.clone()).uri(uri.clone());
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let upstream_req = builder.body(Full::new(body.clone()))?;

        let captured_request = CapturedRequest::new(method.as_str(), &uri, &headers, body);

        let response = roxy_shared::upstream::send_once(&uri, upstream_req, &self.tls_config).await?;
        let response = roxy_shared::upstream::collect_body(response).await?;
        let (parts, resp_body) = response.into_parts();

        let captured_response = CapturedResponse::new(parts.status, &parts.headers, resp_body.clone());
        let exchange = Exchange::new(captured_request, captured_response);
        if let Err(e) = self.store.insert_exchange(exchange).await {
            warn!("failed to persist captured exchange: {e}");
        }

        let mut resp_builder = Response::builder().status(parts.status);
        for (name, value) in parts.headers.iter() {
            resp_builder = resp_builder.header(name, value);
        }
        Ok(resp_builder.body(BoxBody::new(Full::new(resp_body)))?)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    headers.remove("proxy-connection");
    headers.remove("accept-encoding");
}

/// Honors the URL's explicit port, else 80, per the Open Question
/// resolution in §9.
fn absolute_uri_plain(req_uri: &Uri, headers: &HeaderMap) -> Result<Uri, ProxyError> {
    if req_uri.authority().is_some() {
        let mut parts = req_uri.clone().into_parts();
        if parts.scheme.is_none() {
            parts.scheme = Some(Scheme::HTTP);
        }
        return Uri::from_parts(parts).map_err(|e| ProxyError::ClientProtocol(e.to_string()));
    }

    let host_header = headers
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ProxyError::ClientProtocol("request has no Host header".into()))?;
    let path_and_query = req_uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("http://{host_header}{path_and_query}")
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::ClientProtocol(e.to_string()))
}

/// Prepends `https://<tunnel-authority>` to an origin-form request line,
/// the load-bearing absolute-URL reconstruction described in §9. Honors the
/// CONNECT authority's port, else 443.
fn absolute_uri_tunnel(req_uri: &Uri, tunnel_host: &str, tunnel_port: u16) -> Result<Uri, ProxyError> {
    let authority = if tunnel_port == 443 {
        tunnel_host.to_string()
    } else {
        format!("{tunnel_host}:{tunnel_port}")
    };
    let path_and_query = req_uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("https://{authority}{path_and_query}")
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::ClientProtocol(e.to_string()))
}

/// Presents one fixed certificate regardless of SNI.
///
/// The leaf is minted/looked-up synchronously (via [`CertCache`]) before
/// the TLS handshake begins, so unlike the teacher's
/// `LoggingResolvesServerCert` this never needs to capture a `ClientHello`
/// for later inspection — there is no inspection UI in scope.
struct SingleCertResolver(Arc<CertifiedKey>);

impl SingleCertResolver {
    fn new(key: CertifiedKey) -> Self {
        Self(Arc::new(key))
    }
}

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use roxy_shared::generate_roxy_root_ca_with_path;

    #[tokio::test]
    async fn with_shutdown_deadline_overrides_the_default() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ca = generate_roxy_root_ca_with_path(Some(temp_dir.path().to_path_buf())).unwrap();
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let cert_cache = Arc::new(CertCache::new(
            ca,
            store.clone() as Arc<dyn crate::store::CertificateStore>,
            provider,
        ));

        let configured = Duration::from_secs(3);
        let engine = ProxyEngine::with_shutdown_deadline(
            TlsConfig::new(),
            store as Arc<dyn ExchangeStore>,
            cert_cache,
            configured,
        );
        assert_eq!(engine.shutdown_deadline, configured);

        let default_engine_deadline = DEFAULT_SHUTDOWN_DEADLINE;
        assert_ne!(configured, default_engine_deadline);
    }
}

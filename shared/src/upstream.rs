use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use crate::error::ProxyError;
use crate::tls::{TlsConfig, connect_tls};
use crate::util::report;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully buffered response body, read once the upstream connection is
/// done with it so the short-lived dial below can be dropped immediately
/// after.
pub type UpstreamBody = Full<Bytes>;

/// Dials `uri`'s host, optionally over TLS, sends exactly one request and
/// returns exactly one response with the connection torn down afterward.
///
/// No redirect following, no connection reuse: every call establishes a
/// fresh upstream connection, which is what both the forwarding path and
/// the replay/scan clients want — they must each observe one origin
/// response in isolation.
pub async fn send_once(
    uri: &Uri,
    request: Request<UpstreamBody>,
    tls_config: &TlsConfig,
) -> Result<Response<Incoming>, ProxyError> {
    let host = uri.host().ok_or_else(|| ProxyError::BadInput("request URI has no host".into()))?;
    let is_tls = uri.scheme_str() == Some("https");
    let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

    let addr = format!("{host}:{port}");
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(ProxyError::UpstreamDial)?;

    if is_tls {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::BadInput(format!("invalid server name: {host}")))?;
        let client_config = tls_config.client_config(Default::default())?;
        let tls = connect_tls(server_name, tcp, Arc::new(client_config)).await?;
        send_on(tls, request).await
    } else {
        send_on(tcp, request).await
    }
}

async fn send_on<S>(
    io: S,
    request: Request<UpstreamBody>,
) -> Result<Response<Incoming>, ProxyError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(io);
    let (mut sender, conn) = timeout(HANDSHAKE_TIMEOUT, http1::handshake(io))
        .await
        .map_err(|_| ProxyError::UpstreamIo(std::io::Error::other("handshake timed out")))??;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            report(&e);
            warn!("upstream connection closed with error: {e}");
        }
    });

    Ok(sender.send_request(request).await?)
}

/// Collects a hyper response body into memory. Callers on the capture path
/// need the full bytes anyway to record an exchange.
pub async fn collect_body(response: Response<Incoming>) -> Result<Response<Bytes>, ProxyError> {
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(ProxyError::from)?
        .to_bytes();
    Ok(Response::from_parts(parts, bytes))
}

use std::error::Error;
use std::fmt;

/// Errors surfaced across the interception engine, replay client and
/// parameter scanner.
///
/// Kept as a flat enum with manual `Display`/`From` impls, in keeping with
/// the rest of this codebase's error types rather than a derive macro.
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed request line, headers, or body framing from the client.
    ClientProtocol(String),
    /// TLS handshake with the client (certificate minting or negotiation)
    /// failed.
    TlsHandshake(std::io::Error),
    /// Could not open a TCP connection to the origin.
    UpstreamDial(std::io::Error),
    /// The upstream connection broke mid-exchange.
    UpstreamIo(std::io::Error),
    /// HTTP-level failure talking to the origin.
    UpstreamHttp(hyper::Error),
    /// The exchange store is unavailable or returned an inconsistent state.
    StoreUnavailable(String),
    /// Caller-supplied input (exchange id, host, URI) was invalid.
    BadInput(String),
    /// Unrecoverable startup failure (CA material, bind address, config).
    Fatal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ClientProtocol(msg) => write!(f, "client protocol error: {msg}"),
            ProxyError::TlsHandshake(e) => write!(f, "tls handshake error: {e}"),
            ProxyError::UpstreamDial(e) => write!(f, "failed to dial upstream: {e}"),
            ProxyError::UpstreamIo(e) => write!(f, "upstream connection error: {e}"),
            ProxyError::UpstreamHttp(e) => write!(f, "upstream http error: {e}"),
            ProxyError::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            ProxyError::BadInput(msg) => write!(f, "bad input: {msg}"),
            ProxyError::Fatal(msg) => write!(f, "fatal error: {msg}"),
        }
    }
}

impl Error for ProxyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProxyError::TlsHandshake(e)
            | ProxyError::UpstreamDial(e)
            | ProxyError::UpstreamIo(e) => Some(e),
            ProxyError::UpstreamHttp(e) => Some(e),
            _ => None,
        }
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(value: hyper::Error) -> Self {
        ProxyError::UpstreamHttp(value)
    }
}

impl From<http::Error> for ProxyError {
    fn from(value: http::Error) -> Self {
        ProxyError::ClientProtocol(value.to_string())
    }
}

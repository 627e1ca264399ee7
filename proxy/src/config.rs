use std::net::SocketAddr;
use std::path::PathBuf;

use config::Environment;
use roxy_shared::error::ProxyError;
use serde::Deserialize;

/// Ambient startup configuration, layered from environment variables with
/// the `ROXY_` prefix (`ROXY_PROXY_BIND`, `ROXY_CA_KEY_PATH`, ...), in the
/// same `config`-crate `Environment` source style the teacher's CLI config
/// loader uses. None of this is named by spec.md itself — it exists so the
/// crate is runnable end to end without a CLI flag parser, which is out of
/// scope per §1.
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy listen address (§6: default `:8000`).
    pub proxy_bind: SocketAddr,
    /// PKCS#8 CA private key PEM path (§4.2.1/§6).
    pub ca_key_path: Option<PathBuf>,
    /// CA certificate PEM path (§4.2.1/§6).
    pub ca_cert_path: Option<PathBuf>,
    /// Newline-delimited parameter dictionary path (§6).
    pub param_dictionary_path: Option<PathBuf>,
    /// Shutdown grace period before abandoning in-flight connections (§5).
    pub shutdown_deadline_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            proxy_bind: "0.0.0.0:8000".parse().unwrap_or_else(|_| {
                SocketAddr::from(([0, 0, 0, 0], 8000))
            }),
            ca_key_path: None,
            ca_cert_path: None,
            param_dictionary_path: None,
            shutdown_deadline_secs: 10,
        }
    }
}

/// Mirrors [`Config`] with every field optional, so the `Environment`
/// source only needs to supply what's actually set — anything absent falls
/// back to [`Config::default`].
#[derive(Debug, Clone, Default, Deserialize)]
struct PartialConfig {
    proxy_bind: Option<SocketAddr>,
    ca_key_path: Option<PathBuf>,
    ca_cert_path: Option<PathBuf>,
    param_dictionary_path: Option<PathBuf>,
    shutdown_deadline_secs: Option<u64>,
}

impl Config {
    /// Loads configuration from `ROXY_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ProxyError> {
        let settings = config::Config::builder()
            .add_source(Environment::with_prefix("ROXY").separator("_"))
            .build()
            .map_err(config_err)?;

        let partial: PartialConfig = settings.try_deserialize().map_err(config_err)?;
        let defaults = Config::default();

        Ok(Config {
            proxy_bind: partial.proxy_bind.unwrap_or(defaults.proxy_bind),
            ca_key_path: partial.ca_key_path.or(defaults.ca_key_path),
            ca_cert_path: partial.ca_cert_path.or(defaults.ca_cert_path),
            param_dictionary_path: partial.param_dictionary_path.or(defaults.param_dictionary_path),
            shutdown_deadline_secs: partial
                .shutdown_deadline_secs
                .unwrap_or(defaults.shutdown_deadline_secs),
        })
    }

    /// Both CA material paths must be supplied together or not at all
    /// (§4.2.1: "loads ... from two PEM files"). Returns `None` when neither
    /// is configured, so the caller can fall back to the dev convenience
    /// `generate_roxy_root_ca` path.
    pub fn ca_paths(&self) -> Result<Option<(PathBuf, PathBuf)>, ProxyError> {
        match (&self.ca_key_path, &self.ca_cert_path) {
            (Some(key), Some(cert)) => Ok(Some((key.clone(), cert.clone()))),
            (None, None) => Ok(None),
            _ => Err(ProxyError::Fatal(
                "ROXY_CA_KEY_PATH and ROXY_CA_CERT_PATH must both be set or both be absent".into(),
            )),
        }
    }

    /// The §5 shutdown grace period as a [`std::time::Duration`], for
    /// passing straight into `ProxyEngine::with_shutdown_deadline`.
    pub fn shutdown_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_deadline_secs)
    }
}

fn config_err(e: config::ConfigError) -> ProxyError {
    ProxyError::Fatal(format!("configuration error: {e}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_is_port_8000() {
        let cfg = Config::default();
        assert_eq!(cfg.proxy_bind.port(), 8000);
    }

    #[test]
    fn ca_paths_requires_both_or_neither() {
        let mut cfg = Config::default();
        assert!(cfg.ca_paths().unwrap().is_none());

        cfg.ca_key_path = Some(PathBuf::from("/tmp/key.pem"));
        assert!(cfg.ca_paths().is_err());

        cfg.ca_cert_path = Some(PathBuf::from("/tmp/cert.pem"));
        assert_eq!(
            cfg.ca_paths().unwrap(),
            Some((PathBuf::from("/tmp/key.pem"), PathBuf::from("/tmp/cert.pem")))
        );
    }

    #[test]
    fn shutdown_deadline_reflects_configured_seconds() {
        let mut cfg = Config::default();
        cfg.shutdown_deadline_secs = 3;
        assert_eq!(cfg.shutdown_deadline(), std::time::Duration::from_secs(3));
    }
}

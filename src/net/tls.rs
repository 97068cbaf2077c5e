//! TLS configuration and certificate loading.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::SslConfig;

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    for (what, path) in [("Certificate", cert_path), ("Private key", key_path)] {
        if !path.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{what} file not found: {}", path.display()),
            ));
        }
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// TLS settings for the listener, or `None` when TLS is disabled.
pub async fn from_ssl_config(ssl: &SslConfig) -> Result<Option<RustlsConfig>, std::io::Error> {
    if !ssl.enable {
        return Ok(None);
    }
    load_tls_config(Path::new(&ssl.cert_file), Path::new(&ssl.key_file))
        .await
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_tls_loads_nothing() {
        let ssl = SslConfig::default();
        assert!(from_ssl_config(&ssl).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_certificate() {
        let ssl = SslConfig {
            enable: true,
            cert_file: "/nonexistent/server.pem".into(),
            key_file: "/nonexistent/server.key".into(),
        };
        let err = from_ssl_config(&ssl).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert!(err.to_string().contains("Certificate"));
    }
}
